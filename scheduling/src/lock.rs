//! Slot locks taken during checkout.
//!
//! A lock is advisory for the checkout flow only: booking creation re-checks
//! availability atomically, so a lock that expires mid-checkout can at worst
//! turn into `SlotUnavailable`, never into a double booking.

use crate::error::BookingError;
use crate::store::BookingStore;
use crate::types::{HolderId, SlotKey, SlotLock};
use careslot_core::environment::Clock;
use chrono::Duration;
use std::sync::Arc;

/// Default lock lifetime
pub const DEFAULT_LOCK_TTL_MINUTES: i64 = 10;

/// Acquires and releases slot locks against the store
#[derive(Clone)]
pub struct SlotLockManager {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SlotLockManager {
    /// Creates a manager with the default 10-minute TTL
    #[must_use]
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::minutes(DEFAULT_LOCK_TTL_MINUTES),
        }
    }

    /// Override the lock lifetime
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Try to lock `key` for `holder` until `now + ttl`.
    ///
    /// Returns `false` when another holder's lock is active or an active
    /// booking occupies the slot. Calling again as the same holder refreshes
    /// the lock.
    ///
    /// # Errors
    ///
    /// - [`BookingError::NotFound`] if the service does not exist
    /// - [`BookingError::PolicyViolation`] if the service belongs to another provider
    /// - [`BookingError::Storage`] on store failure
    #[tracing::instrument(skip_all, fields(slot = %key, holder = %holder))]
    pub async fn acquire(&self, key: &SlotKey, holder: &HolderId) -> Result<bool, BookingError> {
        let service = self
            .store
            .get_service(&key.service_id)
            .await?
            .ok_or_else(|| BookingError::not_found("service", &key.service_id))?;
        if service.provider_id != key.provider_id {
            return Err(BookingError::PolicyViolation(format!(
                "service {} is not offered by provider {}",
                service.id, key.provider_id
            )));
        }

        let now = self.clock.now();
        let lock = SlotLock {
            key: key.clone(),
            holder: holder.clone(),
            locked_until: now + self.ttl,
        };

        let acquired = self
            .store
            .try_acquire_lock(&lock, key.start + service.duration(), now)
            .await?;

        if acquired {
            tracing::debug!(locked_until = %lock.locked_until, "Slot locked");
        } else {
            crate::metrics::record_slot_conflict("lock");
            tracing::debug!("Slot lock refused");
        }
        Ok(acquired)
    }

    /// Release `holder`'s lock on `key`. Returns whether a lock was removed.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Storage`] on store failure.
    pub async fn release(&self, key: &SlotKey, holder: &HolderId) -> Result<bool, BookingError> {
        let released = self.store.release_lock(key, holder).await?;
        tracing::debug!(slot = %key, holder = %holder, released, "Slot lock release");
        Ok(released)
    }

    /// The lock currently excluding others from `key`, if any
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Storage`] on store failure.
    pub async fn current(&self, key: &SlotKey) -> Result<Option<SlotLock>, BookingError> {
        Ok(self.store.active_lock(key, self.clock.now()).await?)
    }

    /// Delete expired locks. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Storage`] on store failure.
    pub async fn purge_expired(&self) -> Result<u64, BookingError> {
        Ok(self.store.purge_expired_locks(self.clock.now()).await?)
    }
}
