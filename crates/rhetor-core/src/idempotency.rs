//! Idempotency store: at most one live execution per idempotency key.
//!
//! ```text
//! acquire_or_get(key) ─┬─ Completed  → Cached(output)
//!                      ├─ free       → Locked(token)
//!                      └─ Held       → wait until complete / release / lease expiry
//! ```
//!
//! - Locks are in-process leases; a holder that never comes back loses the key
//!   once its lease expires and the next caller takes over with a new token.
//! - Only completed records are persisted (through [`StateStore`]).
//! - Waiting is bounded by `wait_timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{Fingerprint, IdempotencyKey, StageError, StageKind};
use crate::ports::{Clock, IdempotencyRecord, StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a lock holder may keep a key before others may take it over.
    pub lease_timeout_ms: u64,
    /// How long a caller waits for another holder before giving up.
    pub wait_timeout_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 1_900_000,
            wait_timeout_ms: 1_900_000,
        }
    }
}

/// Proof of holding the lock on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: IdempotencyKey,
    stage: StageKind,
    token: u64,
}

impl LockToken {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    Locked(LockToken),
    Cached(Fingerprint),
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("gave up waiting {waited_ms} ms for key {key}")]
    WaitTimeout { key: IdempotencyKey, waited_ms: u64 },

    #[error("lock token for key {0} is no longer valid")]
    StaleToken(IdempotencyKey),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<IdempotencyError> for StageError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::WaitTimeout { .. } => {
                StageError::Transient("idempotency wait timed out".to_string())
            }
            IdempotencyError::StaleToken(_) => StageError::Transient(err.to_string()),
            IdempotencyError::Store(store) => StageError::Storage(store.to_string()),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Held { token: u64, expires_at: Instant },
    Completed(Fingerprint),
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<IdempotencyKey, Slot>,
    next_token: u64,
}

pub struct IdempotencyStore {
    inner: Mutex<Inner>,
    notify: Notify,
    config: IdempotencyConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyStore {
    pub fn new(config: IdempotencyConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            config,
            store,
            clock,
        }
    }

    /// Creates the store and reloads completed records.
    pub async fn load(
        config: IdempotencyConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let records = store.load_idempotency().await?;
        let this = Self::new(config, store, clock);
        {
            let mut inner = this.inner.lock().await;
            for record in records {
                inner.slots.insert(record.key, Slot::Completed(record.output));
            }
            debug!(records = inner.slots.len(), "idempotency records loaded");
        }
        Ok(this)
    }

    pub async fn acquire_or_get(
        &self,
        key: &IdempotencyKey,
        stage: StageKind,
    ) -> Result<Acquired, IdempotencyError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.wait_timeout_ms);
        let lease = Duration::from_millis(self.config.lease_timeout_ms);

        loop {
            // 通知を取りこぼさないよう、状態確認の前に登録しておく
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder_expires_at = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                match inner.slots.get(key) {
                    Some(Slot::Completed(output)) => return Ok(Acquired::Cached(output.clone())),
                    Some(Slot::Held { expires_at, .. }) if *expires_at > now => *expires_at,
                    held => {
                        if held.is_some() {
                            warn!(key = key.short(), "idempotency lease expired, taking over");
                        }
                        inner.next_token += 1;
                        let token = inner.next_token;
                        inner.slots.insert(
                            key.clone(),
                            Slot::Held {
                                token,
                                expires_at: now + lease,
                            },
                        );
                        return Ok(Acquired::Locked(LockToken {
                            key: key.clone(),
                            stage,
                            token,
                        }));
                    }
                }
            };

            if Instant::now() >= deadline {
                return Err(IdempotencyError::WaitTimeout {
                    key: key.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            debug!(key = key.short(), "waiting for idempotency lock holder");
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(holder_expires_at.min(deadline)) => {},
            }
        }
    }

    /// Records the output for the key and wakes waiters.
    pub async fn complete(&self, token: LockToken, output: Fingerprint) -> Result<(), IdempotencyError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.slots.get(&token.key) {
                Some(Slot::Held { token: current, .. }) if *current == token.token => {}
                _ => return Err(IdempotencyError::StaleToken(token.key)),
            }
            inner
                .slots
                .insert(token.key.clone(), Slot::Completed(output.clone()));
        }
        self.notify.notify_waiters();

        let record = IdempotencyRecord {
            key: token.key,
            stage: token.stage,
            output,
            completed_at: self.clock.now(),
        };
        self.store.put_idempotency(&record).await?;
        Ok(())
    }

    /// Gives the key up without a result (the attempt failed).
    pub async fn release(&self, token: LockToken) -> Result<(), IdempotencyError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.slots.get(&token.key) {
                Some(Slot::Held { token: current, .. }) if *current == token.token => {
                    inner.slots.remove(&token.key);
                }
                _ => return Err(IdempotencyError::StaleToken(token.key)),
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Drops a completed record whose artifact has gone missing.
    pub async fn forget(&self, key: &IdempotencyKey) -> Result<(), IdempotencyError> {
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.slots.get(key), Some(Slot::Completed(_))) {
                inner.slots.remove(key);
            }
        }
        self.store.delete_idempotency(key).await?;
        Ok(())
    }

    /// Completed output for a key, without waiting or locking.
    pub async fn cached(&self, key: &IdempotencyKey) -> Option<Fingerprint> {
        match self.inner.lock().await.slots.get(key) {
            Some(Slot::Completed(output)) => Some(output.clone()),
            _ => None,
        }
    }
}
