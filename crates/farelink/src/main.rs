mod error;
mod provider;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use farelink_core::{HttpRelayGateway, Ledger, PaymentPoller, Reconciler};
use farelink_relay::RelayClient;

use crate::error::DaemonError;
use crate::provider::HttpPaymentProvider;
use crate::server::AppState;

/// Access-grant reconciliation daemon: keeps router state matching what
/// riders paid for.
#[derive(Debug, Parser)]
#[command(name = "farelinkd", version, about)]
struct Cli {
    /// Path to the config file (defaults to the platform config dir).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the HTTP listen address.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn,farelinkd=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), DaemonError> {
    let mut config = farelink_config::load_config(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.http.listen = listen;
    }
    let listen = config.listen_addr()?;

    // Relay plumbing
    let transport = config.relay_transport();
    let relay_client = RelayClient::new(config.relay_url()?, &transport, config.relay.retries)
        .map_err(DaemonError::RelayInit)?;
    let gateway = Arc::new(HttpRelayGateway::new(
        relay_client,
        config.reconciler.paid_list.clone(),
        config.reconciler.filter_chain.clone(),
    ));

    // Ledger + router fleet
    let ledger = Arc::new(Ledger::new());
    let routers = config.build_routers()?;
    if routers.is_empty() {
        warn!("no routers configured; reconciliation will idle");
    }
    for router in routers {
        info!(router = %router.name, address = %router.address, "registered router");
        ledger.upsert_router(router);
    }

    // The reconciliation pipeline
    let reconciler = Reconciler::new(Arc::clone(&ledger), gateway, config.reconciler_config());
    let fast_path = reconciler.fast_path();
    let cancel = CancellationToken::new();

    let loop_task = tokio::spawn({
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        async move { reconciler.run(cancel).await }
    });

    // Slow-path provider poller, when credentials are available
    let poller_task = match config.provider_token() {
        Some(token) => {
            let base_url = config.provider.base_url.parse().map_err(|e| {
                DaemonError::Config(farelink_config::ConfigError::Validation {
                    field: "provider.base_url".into(),
                    reason: format!("{e}"),
                })
            })?;
            let http_provider = HttpPaymentProvider::new(base_url, token).map_err(|e| {
                DaemonError::Config(farelink_config::ConfigError::Validation {
                    field: "provider".into(),
                    reason: e.to_string(),
                })
            })?;
            let poller = PaymentPoller::new(
                Arc::clone(&ledger),
                Arc::new(http_provider),
                fast_path.clone(),
                Duration::from_secs(config.provider.poll_secs),
                Duration::from_secs(config.provider.min_age_secs),
            );
            let cancel = cancel.clone();
            Some(tokio::spawn(async move { poller.run(cancel).await }))
        }
        None => {
            warn!(
                var = %config.provider.token_env,
                "provider token not set; slow-path polling disabled"
            );
            None
        }
    };

    // HTTP surface: webhook ingress + operator read endpoints
    let webhook_secret = config.webhook_secret();
    if webhook_secret.is_none() {
        warn!(
            var = %config.provider.webhook_secret_env,
            "webhook secret not set; webhook ingress will refuse traffic"
        );
    }
    let state = AppState {
        ledger,
        reconciler,
        fast_path,
        webhook_secret,
    };
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|source| DaemonError::Bind {
            addr: listen.to_string(),
            source,
        })?;
    info!(%listen, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background tasks and let in-flight slices finish.
    cancel.cancel();
    let _ = loop_task.await;
    if let Some(task) = poller_task {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
