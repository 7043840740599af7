//! HTTP surface of the daemon.
//!
//! Two halves: the webhook ingress (raw-body HMAC verification, then
//! normalization into the fast path) and the operator read endpoints
//! that replace the old pile of per-router diagnostic scripts.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use farelink_core::{
    CycleReport, FastPath, Ledger, Order, OrderStatus, PaymentEvent, Reconciler, RouterId,
    RouterSummary, Session,
};

const SIGNATURE_HEADER: &str = "x-farelink-signature";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub reconciler: Reconciler,
    pub fast_path: FastPath,
    pub webhook_secret: Option<SecretString>,
}

pub fn router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/webhooks/payment", post(payment_webhook))
        .route("/routers", get(list_routers))
        .route("/routers/{id}/report", get(router_report))
        .route("/orders/{code}", get(order_lookup))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

// ── Webhook ingress ─────────────────────────────────────────────────

/// Raw webhook body as the provider posts it; field names vary by
/// provider generation, hence the aliases.
#[derive(Debug, Deserialize)]
struct ProviderWebhook {
    #[serde(alias = "reference", alias = "txid")]
    order_id: String,
    status: String,
    #[serde(default)]
    charge_id: Option<String>,
    #[serde(default)]
    amount_cents: Option<i64>,
}

fn normalize(raw: ProviderWebhook) -> Option<PaymentEvent> {
    let status = OrderStatus::from_provider(&raw.status)?;
    Some(PaymentEvent {
        order_external_id: raw.order_id,
        status,
        charge_ref: raw.charge_id,
        amount_cents: raw.amount_cents,
    })
}

fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// POST /webhooks/payment
///
/// Verifies the HMAC-SHA256 signature over the raw body, normalizes the
/// event, and feeds the fast path. Unknown orders and unknown status
/// vocabulary are acknowledged and dropped -- the provider redelivers
/// on non-2xx and the poller converges regardless.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(ref secret) = state.webhook_secret else {
        warn!("webhook received but no webhook secret is configured");
        return StatusCode::SERVICE_UNAVAILABLE;
    };

    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        warn!("webhook missing signature header");
        return StatusCode::BAD_REQUEST;
    };

    if !verify_signature(secret.expose_secret().as_bytes(), &body, signature) {
        warn!("webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let raw: ProviderWebhook = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "webhook body unparseable");
            return StatusCode::BAD_REQUEST;
        }
    };

    let Some(event) = normalize(raw) else {
        debug!("webhook carried unknown status vocabulary, acknowledging");
        return StatusCode::OK;
    };

    match state.fast_path.ingest(&event) {
        Ok(outcome) => {
            debug!(?outcome, order = %event.order_external_id, "webhook ingested");
            StatusCode::OK
        }
        Err(err) => {
            warn!(%err, order = %event.order_external_id, "webhook ingest failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ── Operator surface ────────────────────────────────────────────────

async fn list_routers(State(state): State<AppState>) -> Json<Vec<RouterSummary>> {
    let mut summaries: Vec<RouterSummary> = state
        .ledger
        .routers()
        .iter()
        .map(RouterSummary::from)
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Json(summaries)
}

async fn router_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Arc<CycleReport>>, StatusCode> {
    state
        .reconciler
        .report(RouterId(id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
struct OrderView {
    order: Order,
    session: Option<Session>,
}

async fn order_lookup(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<OrderView>, StatusCode> {
    let order = state
        .ledger
        .order_by_code(&code)
        .ok_or(StatusCode::NOT_FOUND)?;
    let session = state.ledger.active_session_for_order(order.id);
    Ok(Json(OrderView { order, session }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_roundtrip_verifies() {
        let secret = b"whsec-test";
        let body = br#"{"order_id":"ord-1","status":"paid"}"#;
        let signature = sign(secret, body);
        assert!(verify_signature(secret, body, &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = b"whsec-test";
        let signature = sign(secret, br#"{"order_id":"ord-1","status":"paid"}"#);
        assert!(!verify_signature(
            secret,
            br#"{"order_id":"ord-2","status":"paid"}"#,
            &signature
        ));
    }

    #[test]
    fn garbage_signature_fails_closed() {
        assert!(!verify_signature(b"whsec-test", b"{}", "not-hex"));
        assert!(!verify_signature(b"whsec-test", b"{}", ""));
    }

    #[test]
    fn webhook_normalization_maps_provider_vocabulary() {
        let raw: ProviderWebhook = serde_json::from_str(
            r#"{ "txid": "ord-1", "status": "CONCLUIDA", "charge_id": "ch-9" }"#,
        )
        .unwrap();
        let event = normalize(raw).unwrap();
        assert_eq!(event.order_external_id, "ord-1");
        assert_eq!(event.status, OrderStatus::Paid);
        assert_eq!(event.charge_ref.as_deref(), Some("ch-9"));
    }

    #[test]
    fn unknown_vocabulary_normalizes_to_none() {
        let raw: ProviderWebhook =
            serde_json::from_str(r#"{ "order_id": "ord-1", "status": "mystery" }"#).unwrap();
        assert!(normalize(raw).is_none());
    }
}
