// Failure classification shared by the RPC client, the coordinator and the dashboard server.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProctorError {
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("auth_rejected: HTTP {0}")]
    AuthRejected(u16),

    #[error("segment url has no capture timestamp: {0}")]
    MalformedUrl(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("confirmation text does not match")]
    ConfirmationMismatch,

    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ProctorError {
    /// Look through an `anyhow` chain for a classified failure.
    pub fn classify(err: &anyhow::Error) -> Option<&ProctorError> {
        err.chain().find_map(|cause| cause.downcast_ref::<ProctorError>())
    }

    /// Retrying cannot help with auth or request-shape failures.
    pub fn is_retryable(err: &anyhow::Error) -> bool {
        !matches!(
            Self::classify(err),
            Some(ProctorError::AuthRejected(_))
                | Some(ProctorError::MalformedUrl(_))
                | Some(ProctorError::UnknownSession(_))
                | Some(ProctorError::ConfirmationMismatch)
        )
    }
}
