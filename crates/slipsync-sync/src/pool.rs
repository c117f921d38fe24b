// =============================================================================
// Slipsync Matrix Sliding Sync Proxy - Poller Pool
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
//   The registry of live pollers and the EnsurePolling rendezvous. The
//   rendezvous resolves true only once the poller behind the caller's
//   token has committed at least one upstream response, so the request
//   handler can rely on the store reflecting the device's initial state.
//   The registry is keyed by (user, device); each handle records the
//   access token its poller authenticates with, and EnsurePolling joins
//   the existing first-commit barrier only on a token match. A poller
//   that dies before its first commit removes its own handle and drops
//   the barrier, so nothing is cached: a later request with a fresh
//   token starts a fresh poller instead of inheriting the failure.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use slipsync_core::utils::millis_since_unix_epoch;
use slipsync_core::DeviceKey;

use crate::client::SyncV2Client;
use crate::poller::{PollDataReceiver, Poller, PollerConfig};

/// Pool tunables
#[derive(Debug, Clone)]
pub struct PollerPoolConfig {
    /// Per-poller tunables
    pub poller: PollerConfig,

    /// Pollers whose token went unseen this long are expired
    pub expiry_secs: u64,
}

struct PollerHandle {
    /// The token this poller authenticates with
    token: String,

    /// First-commit barrier; None until resolved
    status_rx: watch::Receiver<Option<bool>>,

    /// Cooperative shutdown
    shutdown_tx: watch::Sender<bool>,

    /// Milliseconds since epoch when a client last presented the token
    last_seen_ms: Arc<AtomicU64>,
}

/// The per-process poller registry
pub struct PollerPool {
    client: Arc<dyn SyncV2Client>,
    config: PollerPoolConfig,
    inner: Arc<Mutex<HashMap<DeviceKey, PollerHandle>>>,
}

impl PollerPool {
    pub fn new(client: Arc<dyn SyncV2Client>, config: PollerPoolConfig) -> Self {
        Self {
            client,
            config,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Guarantee a live poller for (user, device) authenticated by `token`
    /// and wait for its first-commit barrier.
    ///
    /// Returns true once the poller has committed at least one upstream
    /// response; false if it terminated (auth failure, expiry) before
    /// that point. A false result leaves no pending state behind.
    pub async fn ensure_polling(
        &self,
        receiver: Arc<dyn PollDataReceiver>,
        token: &str,
        key: &DeviceKey,
    ) -> bool {
        let mut status_rx = {
            let mut pollers = self.inner.lock().expect("poller pool lock");
            match pollers.get(key) {
                Some(handle) if handle.token == token => {
                    handle
                        .last_seen_ms
                        .store(millis_since_unix_epoch(), Ordering::Relaxed);
                    handle.status_rx.clone()
                }
                Some(_) => {
                    // The client rotated tokens: replace the old poller
                    let old = pollers.remove(key).expect("checked above");
                    let _ = old.shutdown_tx.send(true);
                    self.spawn_locked(&mut pollers, receiver, token, key)
                }
                None => self.spawn_locked(&mut pollers, receiver, token, key),
            }
        };

        loop {
            if let Some(outcome) = *status_rx.borrow() {
                return outcome;
            }
            // A dropped sender means the poller died unresolved; report
            // failure but leave no cached state for the next token
            if status_rx.changed().await.is_err() {
                return false;
            }
        }
    }

    fn spawn_locked(
        &self,
        pollers: &mut HashMap<DeviceKey, PollerHandle>,
        receiver: Arc<dyn PollDataReceiver>,
        token: &str,
        key: &DeviceKey,
    ) -> watch::Receiver<Option<bool>> {
        let other_devices_polling = pollers
            .keys()
            .any(|k| k.user_id == key.user_id && k.device_id != key.device_id);

        let (status_tx, status_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let last_seen_ms = Arc::new(AtomicU64::new(millis_since_unix_epoch()));

        pollers.insert(
            key.clone(),
            PollerHandle {
                token: token.to_string(),
                status_rx: status_rx.clone(),
                shutdown_tx,
                last_seen_ms: Arc::clone(&last_seen_ms),
            },
        );

        let poller = Poller {
            user_id: key.user_id.to_string(),
            device_id: key.device_id.to_string(),
            token: token.to_string(),
            client: Arc::clone(&self.client),
            receiver,
            config: self.config.poller.clone(),
            other_devices_polling,
            status_tx,
            shutdown_rx,
        };

        let registry = Arc::clone(&self.inner);
        let spawn_key = key.clone();
        let token = token.to_string();
        tokio::spawn(async move {
            poller.run().await;
            let mut pollers = registry.lock().expect("poller pool lock");
            // Only deregister if we have not been replaced meanwhile
            if pollers.get(&spawn_key).is_some_and(|h| h.token == token) {
                pollers.remove(&spawn_key);
            }
        });

        debug!("🚀 Spawned poller for {key}");
        status_rx
    }

    /// Stop pollers whose token has not been presented recently.
    ///
    /// An in-flight poll of an expired poller is cancelled before its
    /// commit, so the device's since token stays at the last committed
    /// value and a later EnsurePolling resumes from there.
    pub fn expire_old_pollers(&self) {
        let cutoff = millis_since_unix_epoch().saturating_sub(self.config.expiry_secs * 1000);
        let mut pollers = self.inner.lock().expect("poller pool lock");
        let before = pollers.len();
        pollers.retain(|key, handle| {
            if handle.last_seen_ms.load(Ordering::Relaxed) < cutoff {
                info!("Expiring idle poller for {key}");
                let _ = handle.shutdown_tx.send(true);
                false
            } else {
                true
            }
        });
        let expired = before - pollers.len();
        if expired > 0 {
            info!("✅ Expired {expired} idle pollers");
        }
    }

    /// Number of live pollers
    pub fn len(&self) -> usize {
        self.inner.lock().expect("poller pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PollerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerPool")
            .field("pollers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{SyncError, SyncParams, SyncV2Response, WhoAmI};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    struct MockClient {
        /// Responses handed out in order; when exhausted the client blocks
        responses: AsyncMutex<Vec<Result<SyncV2Response, SyncError>>>,
        polls: AtomicUsize,
    }

    impl MockClient {
        fn new(responses: Vec<Result<SyncV2Response, SyncError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: AsyncMutex::new(responses),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SyncV2Client for MockClient {
        async fn whoami(&self, _token: &str) -> Result<WhoAmI, SyncError> {
            unimplemented!("pool tests resolve tokens out of band")
        }

        async fn do_sync(
            &self,
            _token: &str,
            _since: &str,
            _params: &SyncParams,
        ) -> Result<SyncV2Response, SyncError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().await.pop();
            match next {
                Some(result) => result,
                None => {
                    // Block like a real long poll with nothing to say
                    futures_pending().await;
                    unreachable!()
                }
            }
        }
    }

    async fn futures_pending() {
        std::future::pending::<()>().await
    }

    struct MockReceiver {
        committed: AtomicUsize,
        expired: AtomicUsize,
    }

    impl MockReceiver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                committed: AtomicUsize::new(0),
                expired: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PollDataReceiver for MockReceiver {
        async fn load_device_since(
            &self,
            _user_id: &str,
            _device_id: &str,
        ) -> slipsync_core::Result<String> {
            Ok(String::new())
        }

        async fn on_sync_response(
            &self,
            _user_id: &str,
            _device_id: &str,
            _response: &SyncV2Response,
        ) -> slipsync_core::Result<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_expired_token(&self, _token: &str, _user_id: &str, _device_id: &str) {
            self.expired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_config() -> PollerPoolConfig {
        PollerPoolConfig {
            poller: PollerConfig {
                timeline_limit: 50,
                poll_timeout_ms: 30_000,
                backoff_initial_ms: 1,
                backoff_max_ms: 10,
            },
            expiry_secs: 3600,
        }
    }

    fn key(user: &str, device: &str) -> DeviceKey {
        DeviceKey::new(user.try_into().unwrap(), device.into())
    }

    #[tokio::test]
    async fn test_ensure_polling_resolves_after_first_commit() {
        let ok = SyncV2Response {
            next_batch: "s1".into(),
            ..Default::default()
        };
        let client = MockClient::new(vec![Ok(ok)]);
        let pool = PollerPool::new(client.clone(), pool_config());
        let receiver = MockReceiver::new();

        let started = pool
            .ensure_polling(receiver.clone(), "TOKEN_A", &key("@alice:hs", "A"))
            .await;
        assert!(started);
        assert_eq!(receiver.committed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_polling_unauthorized_failure_does_not_wedge_fresh_token() {
        // Responses pop from the back: the dead token's poll gets the
        // 401, the fresh token's poll gets the commit.
        let ok = SyncV2Response {
            next_batch: "s1".into(),
            ..Default::default()
        };
        let client = MockClient::new(vec![Ok(ok), Err(SyncError::Unauthorized)]);
        let pool = PollerPool::new(client, pool_config());
        let receiver = MockReceiver::new();

        let started = pool
            .ensure_polling(receiver.clone(), "DEAD_TOKEN", &key("@alice:hs", "A"))
            .await;
        assert!(!started);
        assert_eq!(receiver.expired.load(Ordering::SeqCst), 1);

        // Same pool, same device: the failure above must not be cached
        // against a fresh token, which spawns a fresh poller.
        let started = pool
            .ensure_polling(receiver.clone(), "FRESH_TOKEN", &key("@alice:hs", "A"))
            .await;
        assert!(started);
        assert_eq!(receiver.committed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_old_pollers_with_zero_ttl_stops_everything() {
        let ok = SyncV2Response {
            next_batch: "s1".into(),
            ..Default::default()
        };
        let client = MockClient::new(vec![Ok(ok)]);
        let mut config = pool_config();
        config.expiry_secs = 0;
        let pool = PollerPool::new(client, config);
        let receiver = MockReceiver::new();

        assert!(
            pool.ensure_polling(receiver, "TOKEN_A", &key("@alice:hs", "A"))
                .await
        );
        // With a zero TTL everything is instantly stale
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        pool.expire_old_pollers();
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_second_device_gets_accelerated_params() {
        // Captured params asserted via a bespoke client
        struct CapturingClient {
            first_params: AsyncMutex<Vec<(String, SyncParams)>>,
        }

        #[async_trait]
        impl SyncV2Client for CapturingClient {
            async fn whoami(&self, _token: &str) -> Result<WhoAmI, SyncError> {
                unimplemented!()
            }
            async fn do_sync(
                &self,
                token: &str,
                since: &str,
                params: &SyncParams,
            ) -> Result<SyncV2Response, SyncError> {
                self.first_params
                    .lock()
                    .await
                    .push((token.to_string(), params.clone()));
                if since.is_empty() {
                    Ok(SyncV2Response {
                        next_batch: "s1".into(),
                        ..Default::default()
                    })
                } else {
                    futures_pending().await;
                    unreachable!()
                }
            }
        }

        let client = Arc::new(CapturingClient {
            first_params: AsyncMutex::new(Vec::new()),
        });
        let pool = PollerPool::new(client.clone(), pool_config());
        let receiver = MockReceiver::new();

        assert!(
            pool.ensure_polling(receiver.clone(), "TOKEN_A", &key("@alice:hs", "A"))
                .await
        );
        assert!(
            pool.ensure_polling(receiver.clone(), "TOKEN_B", &key("@alice:hs", "B"))
                .await
        );

        let calls = client.first_params.lock().await;
        let device_a = calls.iter().find(|(t, _)| t == "TOKEN_A").unwrap();
        let device_b = calls.iter().find(|(t, _)| t == "TOKEN_B").unwrap();
        assert!(!device_a.1.exclude_all_rooms);
        assert_eq!(device_a.1.timeline_limit, 50);
        assert!(device_b.1.exclude_all_rooms);
        assert_eq!(device_b.1.timeline_limit, 1);
    }
}
