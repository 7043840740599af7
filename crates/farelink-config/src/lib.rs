//! Configuration for the farelink daemon.
//!
//! TOML file + `FARELINK_*` environment overrides, credential resolution
//! (env var indirection for router passwords and provider secrets), and
//! translation into `farelink_core` / `farelink_relay` runtime types.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use farelink_core::{ReconcilerConfig, Router};
use farelink_relay::{TlsMode, TransportConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("environment variable '{var}' named by {field} is not set")]
    MissingEnv { var: String, field: String },

    #[error("router '{name}' has neither password nor password_env")]
    NoRouterCredentials { name: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelaySection,

    #[serde(default)]
    pub reconciler: ReconcilerSection,

    #[serde(default)]
    pub provider: ProviderSection,

    #[serde(default)]
    pub http: HttpSection,

    /// The router fleet. Static reference data; reachability is tracked
    /// at runtime.
    #[serde(default)]
    pub routers: Vec<RouterProfile>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RelaySection {
    /// Relay endpoint URL.
    pub url: String,

    #[serde(default = "default_relay_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_relay_retries")]
    pub retries: u32,

    /// Accept the relay's self-signed certificate.
    #[serde(default)]
    pub insecure: bool,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8728/exec".into(),
            timeout_secs: default_relay_timeout(),
            retries: default_relay_retries(),
            insecure: false,
            ca_cert: None,
        }
    }
}

fn default_relay_timeout() -> u64 {
    5
}
fn default_relay_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReconcilerSection {
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    #[serde(default = "default_deadline")]
    pub router_deadline_secs: u64,

    #[serde(default = "default_cooldown")]
    pub error_cooldown_secs: u64,

    #[serde(default = "default_checkout_window")]
    pub checkout_window_secs: u64,

    #[serde(default = "default_paid_list")]
    pub paid_list: String,

    #[serde(default = "default_bypass_tag")]
    pub bypass_tag: String,

    /// Firewall chain watched for rule-ordering drift.
    #[serde(default = "default_filter_chain")]
    pub filter_chain: String,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
            router_deadline_secs: default_deadline(),
            error_cooldown_secs: default_cooldown(),
            checkout_window_secs: default_checkout_window(),
            paid_list: default_paid_list(),
            bypass_tag: default_bypass_tag(),
            filter_chain: default_filter_chain(),
        }
    }
}

fn default_tick() -> u64 {
    60
}
fn default_deadline() -> u64 {
    45
}
fn default_cooldown() -> u64 {
    900
}
fn default_checkout_window() -> u64 {
    1800
}
fn default_paid_list() -> String {
    "paid_clients".into()
}
fn default_bypass_tag() -> String {
    "farelink".into()
}
fn default_filter_chain() -> String {
    "forward".into()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProviderSection {
    /// Payment provider API base URL (pull endpoint).
    pub base_url: String,

    /// Environment variable holding the provider API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_poll")]
    pub poll_secs: u64,

    /// Orders younger than this are left for the webhook.
    #[serde(default = "default_min_age")]
    pub min_age_secs: u64,

    /// Environment variable holding the webhook HMAC secret.
    #[serde(default = "default_webhook_secret_env")]
    pub webhook_secret_env: String,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.payments.example".into(),
            token_env: default_token_env(),
            poll_secs: default_poll(),
            min_age_secs: default_min_age(),
            webhook_secret_env: default_webhook_secret_env(),
        }
    }
}

fn default_token_env() -> String {
    "FARELINK_PROVIDER_TOKEN".into()
}
fn default_poll() -> u64 {
    120
}
fn default_min_age() -> u64 {
    90
}
fn default_webhook_secret_env() -> String {
    "FARELINK_WEBHOOK_SECRET".into()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HttpSection {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

/// One router in the fleet.
#[derive(Debug, Deserialize, Serialize)]
pub struct RouterProfile {
    pub name: String,

    /// Management address the relay dials (host:port).
    pub address: String,

    pub username: String,

    /// Plaintext password (prefer `password_env`).
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the default config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "farelink", "farelink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("farelink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load configuration from `path` (or the default location) layered
/// with `FARELINK_*` environment overrides
/// (e.g. `FARELINK_RECONCILER__TICK_SECS=30`).
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("FARELINK_").split("__"))
        .extract()?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.relay.url).map_err(|e| ConfigError::Validation {
            field: "relay.url".into(),
            reason: e.to_string(),
        })?;
        Url::parse(&self.provider.base_url).map_err(|e| ConfigError::Validation {
            field: "provider.base_url".into(),
            reason: e.to_string(),
        })?;
        self.listen_addr()?;
        if self.reconciler.tick_secs == 0 {
            return Err(ConfigError::Validation {
                field: "reconciler.tick_secs".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.reconciler.router_deadline_secs >= self.reconciler.tick_secs.saturating_mul(2) {
            return Err(ConfigError::Validation {
                field: "reconciler.router_deadline_secs".into(),
                reason: "must stay well under two tick intervals".into(),
            });
        }
        for profile in &self.routers {
            if profile.password.is_none() && profile.password_env.is_none() {
                return Err(ConfigError::NoRouterCredentials {
                    name: profile.name.clone(),
                });
            }
        }
        Ok(())
    }

    // ── Runtime translations ─────────────────────────────────────────

    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.relay.url).map_err(|e| ConfigError::Validation {
            field: "relay.url".into(),
            reason: e.to_string(),
        })
    }

    pub fn relay_transport(&self) -> TransportConfig {
        let tls = if self.relay.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(ref path) = self.relay.ca_cert {
            TlsMode::CustomCa(path.clone())
        } else {
            TlsMode::System
        };
        TransportConfig {
            tls,
            timeout: Duration::from_secs(self.relay.timeout_secs),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            tick_interval: Duration::from_secs(self.reconciler.tick_secs),
            router_deadline: Duration::from_secs(self.reconciler.router_deadline_secs),
            error_cooldown: Duration::from_secs(self.reconciler.error_cooldown_secs),
            checkout_window: Duration::from_secs(self.reconciler.checkout_window_secs),
            paid_list: self.reconciler.paid_list.clone(),
            bypass_tag: self.reconciler.bypass_tag.clone(),
        }
    }

    /// Build the router fleet, resolving password indirection.
    pub fn build_routers(&self) -> Result<Vec<Router>, ConfigError> {
        self.routers
            .iter()
            .map(|profile| {
                let password = resolve_secret(
                    profile.password.as_deref(),
                    profile.password_env.as_deref(),
                    &format!("routers.{}", profile.name),
                )?
                .ok_or_else(|| ConfigError::NoRouterCredentials {
                    name: profile.name.clone(),
                })?;
                Ok(Router::new(
                    profile.name.clone(),
                    profile.address.clone(),
                    profile.username.clone(),
                    password,
                ))
            })
            .collect()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http
            .listen
            .parse()
            .map_err(|_| ConfigError::Validation {
                field: "http.listen".into(),
                reason: format!("'{}' is not a socket address", self.http.listen),
            })
    }

    /// The webhook HMAC secret, if its env var is set. A daemon without
    /// one refuses webhook traffic rather than accepting it unsigned.
    pub fn webhook_secret(&self) -> Option<SecretString> {
        std::env::var(&self.provider.webhook_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from)
    }

    /// The provider API token, if its env var is set.
    pub fn provider_token(&self) -> Option<SecretString> {
        std::env::var(&self.provider.token_env)
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from)
    }
}

fn resolve_secret(
    plaintext: Option<&str>,
    env_var: Option<&str>,
    field: &str,
) -> Result<Option<SecretString>, ConfigError> {
    if let Some(var) = env_var {
        let value = std::env::var(var).map_err(|_| ConfigError::MissingEnv {
            var: var.to_owned(),
            field: field.to_owned(),
        })?;
        return Ok(Some(SecretString::from(value)));
    }
    Ok(plaintext.map(|p| SecretString::from(p.to_owned())))
}
