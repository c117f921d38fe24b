// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Poller Module
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
//   The per-device poller state machine: Starting -> Polling -> Terminated.
//   Each poller long-polls the upstream sync v2 endpoint on behalf of one
//   (user, device), hands every response to the data receiver, and only
//   then considers the poll committed. The since token advances strictly
//   after commit, so a cancelled or crashed poller resumes from the last
//   fully persisted batch.
//
// Features:
//   • Accelerated initial sync for second and later devices of a user
//   • First-commit barrier feeding the EnsurePolling rendezvous
//   • Exponential backoff with jitter on transient upstream failures
//   • Token expiry teardown on upstream 401
//
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use slipsync_core::Result;

use crate::client::{SyncError, SyncParams, SyncV2Client, SyncV2Response};

/// The sink a poller feeds. Implemented by the API layer, which persists
/// the response, updates caches, fans out to conns and commits the new
/// since token, all before returning.
#[async_trait]
pub trait PollDataReceiver: Send + Sync + 'static {
    /// The device's committed since token, empty when never synced
    async fn load_device_since(&self, user_id: &str, device_id: &str) -> Result<String>;

    /// Persist one upstream response. Must be atomic: either the whole
    /// response (including the new since token) commits, or none of it.
    async fn on_sync_response(
        &self,
        user_id: &str,
        device_id: &str,
        response: &SyncV2Response,
    ) -> Result<()>;

    /// Upstream declared the token dead. Tear down conns for the device
    /// and forget the token binding.
    async fn on_expired_token(&self, token: &str, user_id: &str, device_id: &str);
}

/// Tunables shared by every poller in the pool
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// room.timeline.limit on normal syncs
    pub timeline_limit: u32,

    /// Upstream long poll timeout in milliseconds
    pub poll_timeout_ms: u64,

    /// First backoff step after a transient failure, in milliseconds
    pub backoff_initial_ms: u64,

    /// Backoff cap in milliseconds
    pub backoff_max_ms: u64,
}

/// One poller task for one (user, device)
pub struct Poller {
    pub(crate) user_id: String,
    pub(crate) device_id: String,
    pub(crate) token: String,
    pub(crate) client: Arc<dyn SyncV2Client>,
    pub(crate) receiver: Arc<dyn PollDataReceiver>,
    pub(crate) config: PollerConfig,
    /// Another device of the same user was already polling when this
    /// poller was created; drives the accelerated initial sync
    pub(crate) other_devices_polling: bool,
    /// Resolved once: Some(true) after the first committed response,
    /// Some(false) on auth failure before that point
    pub(crate) status_tx: watch::Sender<Option<bool>>,
    /// Cooperative shutdown signal from the pool
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl Poller {
    /// Poll until terminated. Consumes the poller.
    pub async fn run(self) {
        let mut since = match self
            .receiver
            .load_device_since(&self.user_id, &self.device_id)
            .await
        {
            Ok(since) => since,
            Err(e) => {
                warn!(
                    "❌ Poller {}/{} could not load since token: {}",
                    self.user_id, self.device_id, e
                );
                let _ = self.status_tx.send(Some(false));
                return;
            }
        };

        info!(
            "🚀 Poller started for {}/{} (since={:?})",
            self.user_id, self.device_id, since
        );
        let mut failures: u32 = 0;
        let mut persist_retried = false;

        loop {
            if *self.shutdown_rx.borrow() {
                debug!("Poller {}/{} shut down", self.user_id, self.device_id);
                return;
            }

            let accelerated = since.is_empty() && self.other_devices_polling;
            let params = SyncParams {
                timeline_limit: if accelerated { 1 } else { self.config.timeline_limit },
                exclude_all_rooms: accelerated,
                timeout_ms: if since.is_empty() { 0 } else { self.config.poll_timeout_ms },
            };

            let outcome = {
                let mut shutdown = self.shutdown_rx.clone();
                tokio::select! {
                    _ = shutdown.changed() => return,
                    result = self.poll_once(&since, &params, &mut persist_retried) => result,
                }
            };

            match outcome {
                PollOutcome::Committed(next_batch) => {
                    since = next_batch;
                    failures = 0;
                    // Resolving more than once is a no-op on the watch
                    let _ = self.status_tx.send(Some(true));
                }
                PollOutcome::Backoff => {
                    failures = failures.saturating_add(1);
                    let delay = backoff_with_jitter(
                        self.config.backoff_initial_ms,
                        self.config.backoff_max_ms,
                        failures,
                    );
                    debug!(
                        "Poller {}/{} backing off {}ms after {} failures",
                        self.user_id, self.device_id, delay, failures
                    );
                    let mut shutdown = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = sleep(Duration::from_millis(delay)) => {}
                    }
                }
                PollOutcome::Expired => {
                    info!(
                        "Poller {}/{} terminated: token expired upstream",
                        self.user_id, self.device_id
                    );
                    let _ = self.status_tx.send(Some(false));
                    self.receiver
                        .on_expired_token(&self.token, &self.user_id, &self.device_id)
                        .await;
                    return;
                }
                PollOutcome::GiveUp => {
                    let _ = self.status_tx.send(Some(false));
                    return;
                }
            }
        }
    }

    async fn poll_once(
        &self,
        since: &str,
        params: &SyncParams,
        persist_retried: &mut bool,
    ) -> PollOutcome {
        let response = match self.client.do_sync(&self.token, since, params).await {
            Ok(response) => response,
            Err(SyncError::Unauthorized) => return PollOutcome::Expired,
            Err(SyncError::Transient(e)) => {
                debug!("Poller {}/{}: {}", self.user_id, self.device_id, e);
                return PollOutcome::Backoff;
            }
            Err(SyncError::Fatal(e)) => {
                warn!(
                    "❌ Poller {}/{} hit a fatal upstream error: {}",
                    self.user_id, self.device_id, e
                );
                return PollOutcome::Expired;
            }
        };

        match self
            .receiver
            .on_sync_response(&self.user_id, &self.device_id, &response)
            .await
        {
            Ok(()) => {
                *persist_retried = false;
                PollOutcome::Committed(response.next_batch)
            }
            Err(e) if !*persist_retried => {
                // One retry for aborted transactions; a second failure in a
                // row terminates the poller and the expiry sweep restarts it
                warn!(
                    "⚠️ Poller {}/{} failed to persist response, retrying once: {}",
                    self.user_id, self.device_id, e
                );
                *persist_retried = true;
                PollOutcome::Backoff
            }
            Err(e) => {
                warn!(
                    "❌ Poller {}/{} failed to persist response twice, terminating: {}",
                    self.user_id, self.device_id, e
                );
                PollOutcome::GiveUp
            }
        }
    }
}

enum PollOutcome {
    /// Response fully persisted; carry the new since token
    Committed(String),
    /// Transient trouble; retry the same since after a delay
    Backoff,
    /// Token dead upstream
    Expired,
    /// Persistent persistence failure
    GiveUp,
}

/// Exponential backoff with up to one second of jitter, capped
fn backoff_with_jitter(initial_ms: u64, max_ms: u64, failures: u32) -> u64 {
    let shift = failures.saturating_sub(1).min(16);
    let base = initial_ms.saturating_mul(1u64 << shift).min(max_ms);
    base + rand::thread_rng().gen_range(0..1000)
}
