//! Custom error types for the scan core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different kinds of failure a scan can run into, from malformed
//! level specifications to faults raised by instrument channels.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically file parsing
//!   or type mismatches in configuration and scan plan files.
//! - **`Configuration`**: Semantic errors in a scan description that pass parsing
//!   but are logically wrong (zero levels, a setter list that does not match the
//!   setting matrix, a linear sweep with zero points). These always surface
//!   before any hardware is touched.
//! - **`Instrument`**: A read, write or control call failed. The collaborator's
//!   error is kept unchanged as the `source`; the engine never retries.
//! - **`UnknownChannel`**: A registry lookup for a channel, equipment label or
//!   control that was never registered.
//! - **`InvalidState`**: The scan lifecycle was driven out of order, e.g. `run`
//!   before `initialize`.
//! - **`Io`**: Wraps `std::io::Error`.
//!
//! Unknown tokens in a composition command are deliberately *not* an error; see
//! [`crate::composition`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by the scan core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration or plan file could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A scan description is structurally invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A channel collaborator failed while the scan was talking to hardware.
    #[error("Instrument error on '{channel}': {source}")]
    Instrument {
        /// Channel (or control) name the failing call was addressed to.
        channel: String,
        /// The collaborator's own error, unchanged.
        #[source]
        source: anyhow::Error,
    },

    /// No channel, equipment or control is registered under this name.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Lifecycle misuse.
    #[error("Scan state error: expected {expected}, got {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: String,
        /// State the scan was actually in.
        actual: String,
    },

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Wrap a collaborator error for `channel`.
    pub fn instrument(channel: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Instrument {
            channel: channel.into(),
            source,
        }
    }

    /// True for errors raised by hardware collaborators.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Instrument { .. })
    }
}
