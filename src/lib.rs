//! Slipsync application assembly
//!
//! Wires configuration, storage, the upstream client, the poller pool and
//! the request handler into one running application. The binary in
//! main.rs is a thin shell around this.

use std::sync::Arc;
use std::time::Duration;

use slipsync_api::handler::{HandlerConfig, SyncDataHandler};
use slipsync_api::{ConnMap, GlobalCache};
use slipsync_core::{Config, Result, SlipsyncError};
use slipsync_db::{migrations, DatabasePool, Storage};
use slipsync_sync::poller::PollerConfig;
use slipsync_sync::pool::{PollerPool, PollerPoolConfig};
use slipsync_sync::{HttpSyncClient, SyncV2Client};

pub use slipsync_api::handler::router;

/// A fully wired proxy, ready to serve
pub struct App {
    pub handler: Arc<SyncDataHandler>,
    pub config: Config,
}

/// Build the application from configuration: connect the pool, apply
/// migrations, rebuild the cache, and wire the components together.
pub async fn build_app(config: Config) -> Result<App> {
    let db = DatabasePool::new(&config.database).await?;
    migrations::run_migrations(db.pool()).await?;

    let storage = Storage::new(db.pool().clone(), config.poller.timeline_limit as i64);

    let client: Arc<dyn SyncV2Client> = Arc::new(
        HttpSyncClient::new(
            &config.upstream.base_url,
            Duration::from_secs(config.upstream.request_timeout_secs),
        )
        .map_err(|e| SlipsyncError::Config(e.to_string()))?,
    );

    let poller_pool = Arc::new(PollerPool::new(
        Arc::clone(&client),
        PollerPoolConfig {
            poller: PollerConfig {
                timeline_limit: config.poller.timeline_limit,
                poll_timeout_ms: config.upstream.poll_timeout_ms,
                backoff_initial_ms: config.poller.backoff_initial_ms,
                backoff_max_ms: config.poller.backoff_max_ms,
            },
            expiry_secs: config.poller.expiry_secs,
        },
    ));

    let handler = Arc::new(SyncDataHandler::new(
        storage,
        Arc::new(GlobalCache::new()),
        Arc::new(ConnMap::new()),
        poller_pool,
        client,
        HandlerConfig {
            default_timeout_ms: config.server.default_timeout_ms,
            max_timeout_ms: config.server.max_timeout_ms,
        },
    ));
    handler
        .startup(config.poller.timeline_limit as i64 + 1)
        .await?;

    Ok(App { handler, config })
}
