//! Typed error kinds with fixed propagation policies.
//!
//! Every fatal failure in the core is one of a small closed set of kinds.
//! The kinds never convert into each other: a configuration problem stays a
//! configuration problem no matter how deep in the call stack it surfaces.
//! Functions return `anyhow::Result` so call sites can attach path/row
//! context, with the kind embedded in the chain where callers (and tests)
//! can recover it via `downcast_ref::<NipoppyError>()`.
//!
//! Per-unit runtime failures (a child process exiting non-zero, an I/O
//! error inside a unit work directory) are deliberately *not* represented
//! here — they are reported as unit outcomes and the loop continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NipoppyError {
    /// Malformed JSON, schema violation, missing referenced file, or a
    /// pipeline variable left unset. Fatal before any unit is attempted.
    #[error("configuration error: {0}")]
    Config(String),

    /// Manifest inconsistency, duplicate table key, or an id violating the
    /// prefix policy. Fatal, surfaced with the offending row.
    #[error("planning error: {0}")]
    Planning(String),

    /// A dataset directory expected by the layout does not exist yet.
    /// Distinguishable from an empty-but-initialized dataset.
    #[error("dataset not initialized: {0}")]
    NotInitialized(String),

    /// The dataset lock could not be acquired, or a canonical table could
    /// not be written. Tables are left unchanged.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The caller-supplied cancellation signal was observed. Prior unit
    /// logs remain; tables are not updated for partially processed units.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl NipoppyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn planning(msg: impl Into<String>) -> Self {
        Self::Planning(msg.into())
    }

    pub fn not_initialized(msg: impl Into<String>) -> Self {
        Self::NotInitialized(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

/// Recover the typed kind from an `anyhow` chain, if one is present.
pub fn error_kind(err: &anyhow::Error) -> Option<&NipoppyError> {
    err.downcast_ref::<NipoppyError>()
}
