//! Error types for the scheduling engine.

use crate::types::BookingStatus;
use thiserror::Error;

/// Errors raised by a [`crate::store::BookingStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A conditional write lost: overlapping booking, foreign lock, or the
    /// stored status no longer matches the expected one
    #[error("Conflicting write")]
    Conflict,

    /// The record to update does not exist
    #[error("Record not found")]
    NotFound,

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => Self::Conflict,
            _ => Self::Database(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Errors surfaced by booking operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Provider, service, user or booking missing
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of record
        entity: &'static str,
        /// Identifier looked up
        id: String,
    },

    /// The slot was taken (or locked by someone else); fetch availability again
    #[error("Slot is no longer available")]
    SlotUnavailable,

    /// The booking's status does not permit the requested transition
    #[error("Cannot {action} a booking that is {from}")]
    InvalidTransition {
        /// Status at the time of the attempt
        from: BookingStatus,
        /// Transition attempted
        action: &'static str,
    },

    /// A time or ownership rule forbids the request
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// The deposit has not been received yet
    #[error("Deposit payment required before confirmation")]
    PaymentRequired,

    /// The payment or notification collaborator failed
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl BookingError {
    /// `NotFound` for a given entity kind
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
