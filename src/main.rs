use std::net::SocketAddr;

use anyhow::Context;
use chrono::Utc;
use tokio::signal;
use tracing::{info, warn};

use storefront_checkout as checkout;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = checkout::config::load_config().context("failed to load configuration")?;
    checkout::config::init_tracing(cfg.log_level(), cfg.log_json);
    checkout::handlers::health::init_start_time();

    // Init events
    let (event_sender, event_rx) = checkout::events::EventSender::channel(1024);
    tokio::spawn(checkout::events::process_events(event_rx));

    let state = checkout::AppState::build(cfg.clone(), Some(event_sender))
        .context("failed to build checkout services")?;

    // Journal purge and session sweep
    let sweeper = state.clone();
    let purge_interval = cfg.purge_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_interval);
        loop {
            ticker.tick().await;
            let settings = &sweeper.checkout.settings;
            if let Err(e) = sweeper
                .checkout
                .recovery
                .purge_expired(settings.recovery_retention, settings.finalized_ttl)
                .await
            {
                warn!(error = %e, "checkout journal purge failed");
            }
            sweeper.sweep_sessions(Utc::now()).await;
        }
    });

    let app = checkout::handlers::router(state);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("storefront-checkout listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
