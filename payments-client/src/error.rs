use thiserror::Error;

use crate::models::PaymentStatus;

/// Everything that can go wrong when talking to the payments backend.
#[derive(Debug, Error)]
pub enum PaymentsError {
    /// The backend kept answering `404` for a resource we expect to exist
    /// soon, e.g. a payment we just created.
    #[error("Resource still not found after {attempts} attempts")]
    NotReady { attempts: usize },

    /// The backend answered with a non-success status other than `404`.
    #[error("Backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// We couldn't reach the backend (connect, timeout, body read, ...).
    #[error("Transport failure after {attempts} attempts: {msg}")]
    Transport { attempts: usize, msg: String },

    /// A poll loop ran out of attempts before observing what it waited for.
    #[error("Gave up waiting for {waiting_for} after {attempts} fetches")]
    Timeout {
        attempts: usize,
        waiting_for: &'static str,
    },

    /// The backend answered successfully, but with something we couldn't
    /// make sense of.
    #[error("Invalid backend response: {0}")]
    Decode(String),

    /// The backend reported a status change that the payment lifecycle
    /// doesn't allow, e.g. out of a terminal state.
    #[error("Backend reported invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// The request or the HTTP client couldn't be built.
    #[error("Couldn't build request: {0}")]
    Build(String),
}

impl PaymentsError {
    /// Whether the transport layer retries this kind of failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::Transport { .. })
    }

    /// The HTTP status, if the backend answered with an error status.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
