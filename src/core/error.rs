//! Core capability errors (identifier parsing, event validation).
//!
//! These are bounded and stable: core errors represent domain/refusal states,
//! not library implementation details.

use thiserror::Error;

use crate::error::Transience;

/// Invalid identifier or day key.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("device id `{raw}` is invalid: {reason}")]
    Device { raw: String, reason: String },
    #[error("scan id `{raw}` is invalid: {reason}")]
    Scan { raw: String, reason: String },
    #[error("message id `{raw}` is invalid: {reason}")]
    Message { raw: String, reason: String },
    #[error("day key `{raw}` is invalid: {reason}")]
    Day { raw: String, reason: String },
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("scan event is invalid: {reason}")]
    InvalidEvent { reason: String },
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }
}
