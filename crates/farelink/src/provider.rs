//! HTTP implementation of the payment provider's pull endpoint.
//!
//! Used by the slow-path poller for orders whose webhook never arrived.
//! The provider's status vocabulary is normalized through
//! `OrderStatus::from_provider`, exactly as the webhook route does it.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use farelink_core::{OrderStatus, PaymentProvider, ProviderError};

#[derive(Deserialize)]
struct ProviderOrder {
    status: String,
}

pub struct HttpPaymentProvider {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl HttpPaymentProvider {
    pub fn new(base_url: Url, token: SecretString) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("farelink/0.1.0")
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn order_url(&self, external_code: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(&format!("orders/{external_code}"))
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn get_order_status(&self, external_code: &str) -> Result<OrderStatus, ProviderError> {
        let response = self
            .http
            .get(self.order_url(external_code)?)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound);
        }
        if !response.status().is_success() {
            return Err(ProviderError::Transport(format!(
                "provider returned HTTP {}",
                response.status()
            )));
        }

        let order: ProviderOrder = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        OrderStatus::from_provider(&order.status)
            .ok_or_else(|| ProviderError::Decode(format!("unknown status '{}'", order.status)))
    }
}
