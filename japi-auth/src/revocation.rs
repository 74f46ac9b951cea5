//! Token revocation: lookup by `jti`, with a periodic pruner task tied to
//! server shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Revocation lookup and registration.
///
/// A persistent deployment backs this with a `revoked_tokens` table; the
/// shipped [`MemoryRevocationStore`] keeps entries in process.
#[async_trait::async_trait]
pub trait RevocationStore: Send + Sync {
    /// Whether the token id is revoked at `now`. Entries past their
    /// expiry no longer match.
    async fn is_revoked(&self, jti: &str, now: DateTime<Utc>) -> bool;

    /// Revoke a token id until its natural expiry.
    async fn revoke(
        &self,
        jti: &str,
        user_id: Option<&str>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    );

    /// Drop entries whose expiry has passed. Returns how many were
    /// removed.
    async fn prune(&self, now: DateTime<Utc>) -> usize;
}

#[derive(Debug, Clone)]
struct RevokedToken {
    #[allow(dead_code)]
    user_id: Option<String>,
    expires_at: DateTime<Utc>,
    #[allow(dead_code)]
    revoked_at: DateTime<Utc>,
}

/// In-process revocation store (no persistence).
#[derive(Default)]
pub struct MemoryRevocationStore {
    entries: DashMap<String, RevokedToken>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn is_revoked(&self, jti: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(jti)
            .is_some_and(|entry| entry.expires_at > now)
    }

    async fn revoke(
        &self,
        jti: &str,
        user_id: Option<&str>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.entries.insert(
            jti.to_string(),
            RevokedToken {
                user_id: user_id.map(String::from),
                expires_at,
                revoked_at: now,
            },
        );
    }

    async fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

/// Spawn the periodic pruner. Cancellation is tied to server shutdown.
pub fn spawn_pruner(
    store: Arc<dyn RevocationStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = store.prune(Utc::now()).await;
                    if removed > 0 {
                        debug!(removed, "pruned expired revocation entries");
                    }
                }
            }
        }
    })
}
