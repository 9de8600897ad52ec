//! Cron lock backed by the `cron_locks` table.
//!
//! Acquisition is an insert-or-fail on the unique `task_name`. When the row
//! already exists and its `locked_at` is older than the TTL, the holder is
//! assumed dead and the row is handed to the caller with a conditional
//! update. Serialization failures are retried with exponential backoff;
//! ordinary contention is reported as data, never as an error.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    models::CreateCronLockEntity,
    retry::{RetryPolicy, retry_with_backoff},
    store::{Store, StoreError},
};

pub const DEFAULT_LOCK_TTL_MINUTES: i64 = 60;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    Acquired,
    /// Acquired by taking over an abandoned row.
    Stale { previous_holder: String },
    HeldByOther { holder: String },
    /// Retries were exhausted on serialization conflicts.
    TransientFailure,
}

impl LockResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockResult::Acquired | LockResult::Stale { .. })
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn Store>,
    backoff_base: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            backoff_base: BACKOFF_BASE,
        }
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    /// Tries to take the lock for `task_name` on behalf of `instance_id`.
    ///
    /// # Errors
    ///
    /// Only unexpected store failures are returned; contention and exhausted
    /// retries are reported through [`LockResult`].
    pub async fn acquire(
        &self,
        task_name: &str,
        instance_id: &str,
        ttl_minutes: i64,
        max_retries: u32,
    ) -> Result<LockResult, StoreError> {
        let policy = RetryPolicy::new(max_retries.saturating_add(1), self.backoff_base, 2);

        let outcome = retry_with_backoff(
            &policy,
            |attempt| self.try_acquire(task_name, instance_id, ttl_minutes, attempt),
            StoreError::is_transient,
        )
        .await;

        match outcome {
            Ok(result) => {
                match &result {
                    LockResult::Acquired => {
                        info!(task = task_name, instance = instance_id, "Acquired cron lock")
                    }
                    LockResult::Stale { previous_holder } => warn!(
                        task = task_name,
                        instance = instance_id,
                        previous_holder = %previous_holder,
                        "Took over stale cron lock"
                    ),
                    LockResult::HeldByOther { holder } => info!(
                        task = task_name,
                        instance = instance_id,
                        holder = %holder,
                        "Cron lock held by another instance"
                    ),
                    LockResult::TransientFailure => {}
                }
                Ok(result)
            }
            Err(err) if err.error.is_transient() => {
                warn!(
                    task = task_name,
                    instance = instance_id,
                    attempts = err.attempts,
                    error = %err.error,
                    "Gave up acquiring cron lock after transient conflicts"
                );
                Ok(LockResult::TransientFailure)
            }
            Err(err) => {
                error!(task = task_name, error = %err.error, "Failed to acquire cron lock");
                Err(err.error)
            }
        }
    }

    async fn try_acquire(
        &self,
        task_name: &str,
        instance_id: &str,
        ttl_minutes: i64,
        attempt: u32,
    ) -> Result<LockResult, StoreError> {
        let now = Utc::now();
        let insert = self
            .store
            .insert_lock(CreateCronLockEntity {
                task_name: task_name.to_string(),
                instance_id: instance_id.to_string(),
                locked_at: now,
            })
            .await;

        match insert {
            Ok(_) => return Ok(LockResult::Acquired),
            Err(StoreError::UniqueViolation(_)) => {}
            Err(err) => {
                debug!(task = task_name, attempt, error = %err, "Cron lock insert failed");
                return Err(err);
            }
        }

        let Some(existing) = self.store.find_lock(task_name).await? else {
            // Released between our insert and read; go around again.
            return Err(StoreError::Transient(format!(
                "cron lock {task_name} vanished during acquisition"
            )));
        };

        let stale_before = now - chrono::Duration::minutes(ttl_minutes);
        if existing.locked_at >= stale_before {
            return Ok(LockResult::HeldByOther {
                holder: existing.instance_id,
            });
        }

        if self
            .store
            .replace_stale_lock(task_name, instance_id, stale_before, now)
            .await?
        {
            Ok(LockResult::Stale {
                previous_holder: existing.instance_id,
            })
        } else {
            // Somebody else seized or refreshed it first.
            let holder = self
                .store
                .find_lock(task_name)
                .await?
                .map(|row| row.instance_id)
                .unwrap_or(existing.instance_id);
            Ok(LockResult::HeldByOther { holder })
        }
    }

    /// Deletes the lock row. A row that is already gone counts as released.
    pub async fn release(&self, task_name: &str) -> Result<(), StoreError> {
        if self.store.delete_lock(task_name).await? {
            info!(task = task_name, "Released cron lock");
        } else {
            debug!(task = task_name, "Cron lock was already released");
        }
        Ok(())
    }

    pub async fn holder(&self, task_name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .find_lock(task_name)
            .await?
            .map(|row| row.instance_id))
    }
}
