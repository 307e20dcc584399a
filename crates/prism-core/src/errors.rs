//! Error types for the non-bonded offload pipeline.
//!
//! Every failure in this subsystem ends the simulation: nothing is retried and
//! nothing is swallowed. Configuration errors are raised before the first step.

use crate::types::InteractionLocality;
use thiserror::Error;

/// Unified error type for all non-bonded pipeline operations.
#[derive(Error, Debug)]
pub enum NbError {
    /// Device allocation could not be satisfied within the memory budget.
    #[error(
        "Resource exhausted allocating {context}: requested {requested_bytes} bytes, \
         {available_bytes} bytes available"
    )]
    ResourceExhausted {
        context: String,
        requested_bytes: usize,
        available_bytes: usize,
    },

    /// Contradictory or out-of-range parameters.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A kernel would run on a pair list whose buffer has been outlived.
    #[error("Stale {locality} pair list: {message}")]
    StaleList {
        locality: InteractionLocality,
        message: String,
    },

    /// An asynchronous device operation reported failure.
    #[error("Device operation '{operation}' failed on {stream} stream: {message}")]
    DeviceOperation {
        stream: String,
        operation: String,
        message: String,
    },

    /// A pipeline phase was requested out of order.
    #[error("Invalid {locality} pipeline transition {from} -> {to}")]
    InvalidTransition {
        locality: InteractionLocality,
        from: String,
        to: String,
    },

    /// I/O errors (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse errors
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl NbError {
    pub fn resource_exhausted(
        context: impl Into<String>,
        requested_bytes: usize,
        available_bytes: usize,
    ) -> Self {
        NbError::ResourceExhausted {
            context: context.into(),
            requested_bytes,
            available_bytes,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        NbError::InvalidConfiguration(message.into())
    }

    pub fn stale_list(locality: InteractionLocality, message: impl Into<String>) -> Self {
        NbError::StaleList {
            locality,
            message: message.into(),
        }
    }

    pub fn device(
        stream: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        NbError::DeviceOperation {
            stream: stream.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn transition(
        locality: InteractionLocality,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        NbError::InvalidTransition {
            locality,
            from: from.into(),
            to: to.into(),
        }
    }

    /// Always false: a partially evaluated force step cannot be replayed.
    pub fn is_retriable(&self) -> bool {
        false
    }

    /// True for errors that are raised before any step executes.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            NbError::InvalidConfiguration(_) | NbError::ConfigParse(_) | NbError::Io(_)
        )
    }

    /// Returns a user-friendly error message with actionable guidance.
    pub fn user_message(&self) -> String {
        match self {
            NbError::ResourceExhausted { .. } => format!(
                "{}\n\
                 → Reduce the system size or raise the device memory budget.\n\
                 → Check available GPU memory with `nvidia-smi`.",
                self
            ),
            NbError::InvalidConfiguration(_) | NbError::ConfigParse(_) => format!(
                "{}\n\
                 → Review the [cutoffs] and [electrostatics] sections of the configuration.",
                self
            ),
            NbError::StaleList { .. } => format!(
                "{}\n\
                 → The pair-list rebuild interval is too long for the list buffer; \
                 lower cadence.rebuild_interval or raise cutoffs.list_buffer.",
                self
            ),
            _ => self.to_string(),
        }
    }
}

/// Result type alias for non-bonded pipeline operations.
pub type Result<T> = std::result::Result<T, NbError>;
