//! Error taxonomy shared by every reporting strategy and the metering
//! service.
//!
//! Errors are structured so that the billing backend's code and HTTP
//! status survive every layer of wrapping. Use [`MeteringError::kind`],
//! [`MeteringError::code`] and [`MeteringError::status_code`] instead of
//! matching on the outermost variant.

use crate::reporter::ReporterError;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type accepted from integrator supplied collaborators.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The coarse classification of a [`MeteringError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidInput,
    Lifecycle,
    Resolution,
    Backend,
    Configuration,
    Unknown,
}

#[derive(Error, Debug)]
pub enum MeteringError {
    /// Rejected before any I/O happened.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The strategy was disposed and cannot record usage.
    #[error("strategy has been disposed and cannot record usage")]
    Disposed,

    /// The customer could not be mapped to a subscription item.
    #[error("could not find subscription item for customer {customer_id}")]
    Resolution { customer_id: String },

    /// The billing backend rejected or never received a submission.
    #[error("{message}")]
    Backend {
        message: String,
        subscription_item: Option<String>,
        #[source]
        source: ReporterError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Anything that is not one of the kinds above, kept in its string form.
    #[error("{0}")]
    Unknown(String),

    /// Context added by the metering service around a strategy failure.
    #[error("Failed to record usage: {0}")]
    Service(#[source] Box<MeteringError>),
}

impl MeteringError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        MeteringError::InvalidInput(message.into())
    }

    pub fn resolution(customer_id: impl Into<String>) -> Self {
        MeteringError::Resolution {
            customer_id: customer_id.into(),
        }
    }

    /// Wraps a backend failure, optionally attributing it to a
    /// subscription item.
    pub fn backend(
        message: impl Into<String>,
        subscription_item: Option<&str>,
        source: ReporterError,
    ) -> Self {
        MeteringError::Backend {
            message: message.into(),
            subscription_item: subscription_item.map(str::to_string),
            source,
        }
    }

    /// Converts an integrator error into a recognizable kind.
    ///
    /// A boxed `MeteringError` comes back unchanged. Anything else is
    /// kept as `Unknown` with its display form.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<MeteringError>() {
            Ok(err) => *err,
            Err(other) => MeteringError::Unknown(other.to_string()),
        }
    }

    /// Classification of this error, looking through service wrapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeteringError::InvalidInput(_) => ErrorKind::InvalidInput,
            MeteringError::Disposed => ErrorKind::Lifecycle,
            MeteringError::Resolution { .. } => ErrorKind::Resolution,
            MeteringError::Backend { .. } => ErrorKind::Backend,
            MeteringError::Config(_) => ErrorKind::Configuration,
            MeteringError::Unknown(_) => ErrorKind::Unknown,
            MeteringError::Service(inner) => inner.kind(),
        }
    }

    /// The backend error code, if the backend attached one.
    pub fn code(&self) -> Option<&str> {
        match self {
            MeteringError::Backend { source, .. } => source.code(),
            MeteringError::Service(inner) => inner.code(),
            _ => None,
        }
    }

    /// The backend HTTP status, if the backend attached one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            MeteringError::Backend { source, .. } => source.status_code(),
            MeteringError::Service(inner) => inner.status_code(),
            _ => None,
        }
    }

    /// The subscription item a backend failure belongs to.
    pub fn subscription_item(&self) -> Option<&str> {
        match self {
            MeteringError::Backend {
                subscription_item, ..
            } => subscription_item.as_deref(),
            MeteringError::Service(inner) => inner.subscription_item(),
            _ => None,
        }
    }
}
