// ── Relay client ──
//
// One HTTP relay endpoint fronts every router. A call names the target
// router, carries its credentials, and one `RouterOp`. Transport-level
// failures are retried with backoff; faults the router itself reported
// are classified and never retried here.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::RelayError;
use crate::op::RouterOp;
use crate::transport::TransportConfig;

/// How to address one router through the relay.
#[derive(Debug, Clone)]
pub struct RouterTarget {
    /// Management address the relay should dial (e.g., `10.8.0.12:8728`).
    pub address: String,
    pub username: String,
    pub password: SecretString,
}

/// Fault codes the relay reports back from a router.
mod fault_code {
    pub const ALREADY_EXISTS: &str = "already-exists";
    pub const NOT_FOUND: &str = "not-found";
    pub const AUTH_FAILED: &str = "auth-failed";
    pub const BAD_COMMAND: &str = "bad-command";
    pub const ROUTER_UNREACHABLE: &str = "router-unreachable";
    pub const ROUTER_TIMEOUT: &str = "router-timeout";
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    router_address: &'a str,
    username: &'a str,
    password: &'a str,
    command: &'a RouterOp,
}

#[derive(Deserialize)]
struct RelayResponse {
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<RelayFault>,
}

#[derive(Deserialize)]
struct RelayFault {
    code: String,
    #[serde(default)]
    message: String,
}

/// Client for the command relay. Cheap to clone (shares the underlying
/// connection pool).
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl RelayClient {
    /// Create a client for the given relay endpoint.
    pub fn new(
        endpoint: Url,
        transport: &TransportConfig,
        max_retries: u32,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            http: transport.build_client()?,
            endpoint,
            timeout: transport.timeout,
            max_retries,
            backoff_base: Duration::from_millis(250),
        })
    }

    /// Execute one operation against one router.
    ///
    /// Transient failures (relay unreachable, router timed out behind the
    /// relay) are retried up to `max_retries` times with exponential
    /// backoff. For mutations, the relay's "already exists" / "not found"
    /// faults are success: the state the operation wanted is the state
    /// the router has.
    pub async fn execute(
        &self,
        target: &RouterTarget,
        op: &RouterOp,
    ) -> Result<Value, RelayError> {
        let mut attempt: u32 = 0;
        loop {
            match self.send(target, op).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_idempotent_conflict() && op.is_mutation() => {
                    debug!(op = op.name(), router = %target.address, %err, "idempotent conflict folded into success");
                    return Ok(Value::Null);
                }
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let backoff = self.backoff_base * 2u32.saturating_pow(attempt);
                    warn!(
                        op = op.name(),
                        router = %target.address,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %err,
                        "transient relay failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send(&self, target: &RouterTarget, op: &RouterOp) -> Result<Value, RelayError> {
        let request = RelayRequest {
            router_address: &target.address,
            username: &target.username,
            password: target.password.expose_secret(),
            command: op,
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::Timeout {
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    RelayError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Endpoint {
                status: status.as_u16(),
            });
        }

        let envelope: RelayResponse = response.json().await.map_err(|e| RelayError::Protocol {
            message: e.to_string(),
        })?;

        if envelope.ok {
            return Ok(envelope.data);
        }

        let fault = envelope.error.ok_or_else(|| RelayError::Protocol {
            message: "ok=false without an error body".into(),
        })?;
        Err(classify_fault(op, fault))
    }
}

fn classify_fault(op: &RouterOp, fault: RelayFault) -> RelayError {
    match fault.code.as_str() {
        fault_code::ALREADY_EXISTS => RelayError::AlreadyExists,
        fault_code::NOT_FOUND => RelayError::NotFound,
        fault_code::AUTH_FAILED => RelayError::Auth {
            message: fault.message,
        },
        fault_code::BAD_COMMAND => RelayError::Rejected {
            op: op.name().to_owned(),
            message: fault.message,
        },
        fault_code::ROUTER_UNREACHABLE | fault_code::ROUTER_TIMEOUT => {
            RelayError::RouterUnreachable {
                message: fault.message,
            }
        }
        other => RelayError::Rejected {
            op: op.name().to_owned(),
            message: format!("{other}: {}", fault.message),
        },
    }
}
