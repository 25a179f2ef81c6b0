//! Operation table
//!
//! The only shared mutable state of the coordinator. Records are keyed by
//! idempotency key and live for the lifetime of the process. Each key has an
//! attempt gate: at most one attempt runs per key, and a second attempt waits
//! up to the lock timeout before failing with `OperationInProgress`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::operation::{IdempotencyKey, OperationKind, OperationRecord};
use crate::error::{Error, Result};

struct OperationSlot {
    gate: Arc<Mutex<()>>,
    record: RwLock<OperationRecord>,
    cancel: Mutex<CancellationToken>,
}

/// In-memory table of operations
pub struct OperationTable {
    slots: Mutex<HashMap<IdempotencyKey, Arc<OperationSlot>>>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationTable")
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl OperationTable {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Start an attempt, creating the record on first use of the key
    ///
    /// Fails with `InvalidInput` when the key was already used for a
    /// different operation or different inputs.
    pub(crate) async fn begin(
        &self,
        key: &IdempotencyKey,
        kind: OperationKind,
        fingerprint: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<Attempt> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(OperationSlot {
                        gate: Arc::new(Mutex::new(())),
                        record: RwLock::new(OperationRecord::new(key.clone(), kind, fingerprint)),
                        cancel: Mutex::new(CancellationToken::new()),
                    })
                })
                .clone()
        };

        let attempt = self.enter(key, slot, cancel).await?;

        {
            let record = attempt.slot.record.read().await;
            if record.kind != kind || record.fingerprint != fingerprint {
                return Err(Error::InvalidInput(format!(
                    "idempotency key '{}' was already used for a different {} operation",
                    key, record.kind
                )));
            }
        }

        attempt.update(|record| record.attempts += 1).await;
        Ok(attempt)
    }

    /// Start an attempt on an existing operation
    pub(crate) async fn resume(&self, key: &IdempotencyKey) -> Result<Attempt> {
        let slot = self
            .slots
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operation '{}'", key)))?;
        self.enter(key, slot, None).await
    }

    async fn enter(
        &self,
        key: &IdempotencyKey,
        slot: Arc<OperationSlot>,
        cancel: Option<CancellationToken>,
    ) -> Result<Attempt> {
        let guard = tokio::time::timeout(self.lock_timeout, slot.gate.clone().lock_owned())
            .await
            .map_err(|_| Error::OperationInProgress(key.clone()))?;

        let token = cancel.unwrap_or_default();
        *slot.cancel.lock().await = token.clone();

        debug!(key = %key, "Operation attempt started");

        Ok(Attempt {
            key: key.clone(),
            slot,
            cancel: token,
            _guard: guard,
        })
    }

    /// Snapshot of an operation's record
    pub async fn snapshot(&self, key: &IdempotencyKey) -> Option<OperationRecord> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let record = slot.record.read().await.clone();
        Some(record)
    }

    /// Signal cancellation to the current attempt of `key`
    pub async fn cancel(&self, key: &IdempotencyKey) -> bool {
        let slot = self.slots.lock().await.get(key).cloned();
        match slot {
            Some(slot) => {
                slot.cancel.lock().await.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Exclusive right to drive one operation; released on drop
pub(crate) struct Attempt {
    key: IdempotencyKey,
    slot: Arc<OperationSlot>,
    cancel: CancellationToken,
    _guard: OwnedMutexGuard<()>,
}

impl Attempt {
    pub(crate) fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn record(&self) -> OperationRecord {
        self.slot.record.read().await.clone()
    }

    pub(crate) async fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut OperationRecord),
    {
        let mut record = self.slot.record.write().await;
        change(&mut record);
        record.touch();
    }
}
