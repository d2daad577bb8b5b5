//! Error types for the fact store.

use crate::spec::PredicateError;
use crate::transform::TransformationError;
use crate::types::Serial;
use std::any::Any;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed header, rejected before anything is written.
    #[error("Invalid fact: {0}")]
    Validation(String),

    /// Id or unique identifier collision. The whole batch was rejected.
    #[error("Duplicate fact: {0}")]
    DuplicateFact(String),

    /// Notification transport unavailable and the retry budget is spent.
    #[error("Notification transport unavailable: {0}")]
    Transport(String),

    #[error(transparent)]
    Transformation(#[from] TransformationError),

    #[error(transparent)]
    Predicate(#[from] PredicateError),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch at serial {serial}: expected {expected}, got {got}")]
    ChecksumMismatch {
        serial: Serial,
        expected: u32,
        got: u32,
    },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Readable text for a caught panic payload.
pub(crate) fn panic_message(what: &str, panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("{what} panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("{what} panicked: {s}")
    } else {
        format!("{what} panicked")
    }
}
