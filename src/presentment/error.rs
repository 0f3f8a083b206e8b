use thiserror::Error;

use super::model::AbortReason;
use crate::secure_area::SecureAreaError;

/// Failures that end a presentation.
///
/// Adapters work with [anyhow::Result] and raise these where the cause needs to
/// survive to the dispatcher, which classifies the final error by downcasting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresentmentError {
    #[error("unsupported protocol `{0}`")]
    UnsupportedProtocol(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    /// The user backed out of a prompt. Not a failure.
    #[error("cancelled by the user")]
    Cancelled,
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    #[error("credential source failed: {0}")]
    CredentialSource(String),
    #[error("unable to send the response: {0}")]
    Transport(String),
}

impl PresentmentError {
    pub(crate) fn invalid_request(reason: impl Into<String>) -> anyhow::Error {
        Self::InvalidRequest(reason.into()).into()
    }

    /// The abort reason if `err` (or anything it wraps) is a user cancellation.
    ///
    /// A dismissed key unlock takes precedence over any other cancellation.
    pub fn abort_reason(err: &anyhow::Error) -> Option<AbortReason> {
        let unlock_cancelled = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<SecureAreaError>(),
                Some(SecureAreaError::UnlockCancelled(_))
            )
        });
        if unlock_cancelled {
            return Some(AbortReason::UnlockCancelled);
        }

        err.chain()
            .any(|cause| {
                matches!(cause.downcast_ref::<PresentmentError>(), Some(PresentmentError::Cancelled))
            })
            .then_some(AbortReason::Cancelled)
    }
}
