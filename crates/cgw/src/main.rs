use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cgw_core::{
    config::Config,
    gateway::{Gateway, GatewayOptions, GatewayParts},
};
use cgw_supabase::PostgrestStore;
use cgw_telegram::{check_bot_token, TelegramConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    cgw_core::logging::init("cgw", cfg.log_format)?;

    let store = Arc::new(PostgrestStore::new(cfg.store.clone())?);
    let connector = Arc::new(TelegramConnector::new(
        cfg.telegram_poll_timeout,
        cfg.throttle,
    ));

    let gateway = Gateway::new(
        GatewayParts {
            credentials: store.clone(),
            directory: store.clone(),
            linkages: store,
            connector,
            credential_check: check_bot_token,
        },
        GatewayOptions::from_config(&cfg),
    );

    let diff = gateway
        .start()
        .await
        .context("initial clinic credential load failed")?;
    info!(clinics = diff.added.len(), "clinic bots starting");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let served = cgw_http::serve(cfg.bind_addr, gateway.clone(), shutdown.clone()).await;
    shutdown.cancel();
    gateway.shutdown().await;

    served.with_context(|| format!("http server on {} failed", cfg.bind_addr))
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
    shutdown.cancel();
}
