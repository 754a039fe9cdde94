//! Error types for the PM100x panel.
//!
//! Two layers, both built with `thiserror`:
//!
//! - [`BusError`]: failures reported by the instrument bus itself (open, query,
//!   write, close). The message is opaque; it is whatever the bus library said.
//! - [`PmError`]: everything the device adapter can report. It wraps
//!   [`BusError`] via `#[from]` so bus calls compose with `?`.
//!
//! # Error Categories
//!
//! 1. **Not connected** - [`PmError::NotConnected`]. Any property access on a
//!    disconnected session.
//! 2. **Bus I/O** - [`PmError::Bus`], [`PmError::InvalidResponse`]. Surfaced to
//!    the controller as connection failures.
//! 3. **Validation** - [`PmError::Validation`], [`PmError::InvalidDirection`],
//!    [`PmError::InvalidAddress`], [`PmError::UnsupportedModel`]. Raised before
//!    the device is touched; cached state stays intact.
//!
//! Device-side range clamping is not an error and has no variant here.

use thiserror::Error;

/// Convenience alias for results using the adapter error type.
pub type PmResult<T> = std::result::Result<T, PmError>;

/// Failure reported by the instrument bus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// Read or write on an open resource failed.
    #[error("I/O error on '{address}': {message}")]
    Io {
        /// Resource address the failure happened on
        address: String,
        /// Message from the bus library
        message: String,
    },

    /// The resource did not answer in time.
    #[error("Timeout waiting for '{address}' to answer '{command}'")]
    Timeout {
        /// Resource address
        address: String,
        /// Command that went unanswered
        command: String,
    },

    /// Opening the resource failed.
    #[error("Failed to open resource '{address}': {message}")]
    Open {
        /// Resource address
        address: String,
        /// Message from the bus library
        message: String,
    },

    /// The resource manager itself could not be used.
    #[error("Resource manager error: {0}")]
    ResourceManager(String),

    /// The session was already closed.
    #[error("Session '{0}' is closed")]
    Closed(String),

    /// The bus backend was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

/// Primary error type of the device adapter.
#[derive(Error, Debug)]
pub enum PmError {
    /// No console is connected.
    #[error("No powermeter is currently connected.")]
    NotConnected,

    /// A console is already connected; reconnecting is a caller error.
    #[error("A powermeter is already connected at '{0}'.")]
    AlreadyConnected(String),

    /// The address was not returned by the most recent discovery scan.
    #[error("The specified address is not a valid device address: '{0}'.")]
    InvalidAddress(String),

    /// The requested model is not in the model table.
    #[error("The specified model '{requested}' is not supported. Supported models are {supported}.")]
    UnsupportedModel {
        /// Model name asked for
        requested: String,
        /// Comma-separated supported model names
        supported: String,
    },

    /// Range stepping direction other than +1 or -1.
    #[error("The direction must be either +1 (to increase power range) or -1 (to decrease it), got {0}.")]
    InvalidDirection(i32),

    /// User input rejected before reaching the device.
    #[error("{0}")]
    Validation(String),

    /// The bus failed.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The device answered something that could not be parsed.
    #[error("Unexpected response to '{command}': '{response}'")]
    InvalidResponse {
        /// Command that was sent
        command: String,
        /// Raw answer
        response: String,
    },
}

impl PmError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        PmError::Validation(message.into())
    }

    /// True for errors raised before any device I/O happened.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PmError::Validation(_)
                | PmError::InvalidDirection(_)
                | PmError::InvalidAddress(_)
                | PmError::UnsupportedModel { .. }
        )
    }

    /// True for failures of the bus or of the device's answers.
    pub fn is_bus(&self) -> bool {
        matches!(self, PmError::Bus(_) | PmError::InvalidResponse { .. })
    }
}
