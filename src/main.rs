// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Main Entry Point
// =============================================================================
//
// Project: Slipsync - High Performance Matrix Sliding Sync Proxy (MSC3575)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2025-01-20
// Version: 0.1.0-alpha (PostgreSQL Backend)
// License: Apache 2.0 / MIT
//
// Description:
//   Entry point for the Slipsync sliding sync proxy. Sits between Matrix
//   clients and a homeserver: polls /sync v2 on behalf of every client
//   device, accumulates room state into PostgreSQL, and serves the
//   MSC3575 sliding sync API.
//
// Architecture:
//   • Multi-threaded Tokio runtime
//   • Axum web framework with async/await
//   • PostgreSQL backend via sqlx
//   • Structured logging with tracing
//   • Configuration via TOML + environment variables
//
// Runtime Requirements:
//   • SLIPSYNC_CONFIG environment variable pointing to a config file
//     (optional; defaults apply without one)
//   • PostgreSQL database accessible
//   • An upstream homeserver to poll
//
// =============================================================================

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

use slipsync::{build_app, router};
use slipsync_core::Config;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("SLIPSYNC_CONFIG").unwrap_or_else(|_| "slipsync.toml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Slipsync starting (upstream {})", config.upstream.base_url);
    let app = build_app(config).await?;

    // Periodic poller expiry sweep
    let sweep_handler = app.handler.clone();
    let sweep_interval = Duration::from_secs(app.config.poller.expiry_sweep_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_handler.pool().expire_old_pollers();
        }
    });

    let bind_addr = app.config.server.bind_addr.clone();
    let service = router(app.handler.clone()).layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("✅ Listening on {}", bind_addr);

    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!("❌ Server error: {}", e);
            e
        })?;

    info!("Slipsync shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
