//! Error kinds callers need to branch on.
//!
//! Most failures travel as `anyhow::Error`. Input validation failures are
//! wrapped in [`ValidationError`] so outer layers (the webhook server, the CLI)
//! can tell "bad input, nothing was written" apart from infrastructure errors
//! with `err.downcast_ref::<ValidationError>()`.

use thiserror::Error;

/// Bad or missing input. Raised before any state is mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Build an `anyhow::Error` wrapping a formatted [`ValidationError`].
macro_rules! invalid {
    ($($arg:tt)*) => {
        ::anyhow::Error::from($crate::error::ValidationError::new(format!($($arg)*)))
    };
}

pub(crate) use invalid;

/// True when the error chain carries a [`ValidationError`].
pub fn is_validation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ValidationError>().is_some())
}
