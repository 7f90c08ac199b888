//! Error types for the action-delivery subsystem.

use thiserror::Error;
use uuid::Uuid;

use crate::trigger::FenceKind;

/// Delivery error covering every failure mode of a fence action.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    // Transport errors
    /// The request never produced a response (unreachable host, reset, DNS).
    #[error("transport failed: {0}")]
    Transport(String),

    /// The request did not complete within its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The server answered with a 5xx-equivalent failure.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Body or reason text.
        message: String,
    },

    // Authentication errors
    /// The access token was rejected by the service.
    #[error("access token rejected: {0}")]
    AuthExpired(String),

    /// The session can no longer be recovered locally; re-authentication is required.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    /// No account token is stored for the user.
    #[error("no account token for user {user_id}")]
    MissingToken {
        /// The account owner.
        user_id: String,
    },

    // Authorization errors
    /// The account's subscription tier does not allow fence actions.
    #[error("entitlement denied for user {user_id}")]
    EntitlementDenied {
        /// The account owner.
        user_id: String,
    },

    // Configuration errors
    /// A fence or action is malformed.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Neither entry nor exit has any configured action.
    #[error("no action configured for fence {fence_id}")]
    NoAction {
        /// The fence identifier.
        fence_id: String,
    },

    // Terminal errors
    /// The service returned an error we cannot recover from.
    #[error("api error: {0}")]
    Api(String),

    /// The response body could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A job failed on every attempt of its retry budget.
    #[error("retries exhausted for job {job_id} when {direction} fence {fence}")]
    RetryExhausted {
        /// The job that failed.
        job_id: Uuid,
        /// Title of the fence the job belongs to.
        fence: String,
        /// Direction the fence fired in.
        direction: FenceKind,
    },
}

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried through the retry queue up to its bound.
    TransientTransport,
    /// Recovered locally with a single refresh-and-retry.
    AuthExpired,
    /// Surfaced upward, never retried.
    SessionInvalid,
    /// Dropped silently at the dispatcher.
    EntitlementDenied,
    /// Fails fast to the immediate caller.
    ConfigInvalid,
    /// Surfaced as a user notification.
    RetryExhausted,
    /// Failed for good; logged and dropped.
    Terminal,
}

impl DeliveryError {
    /// Returns the taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            DeliveryError::Transport(_)
            | DeliveryError::Timeout(_)
            | DeliveryError::Server { .. } => ErrorClass::TransientTransport,
            DeliveryError::AuthExpired(_) => ErrorClass::AuthExpired,
            DeliveryError::SessionInvalid(_) | DeliveryError::MissingToken { .. } => {
                ErrorClass::SessionInvalid
            }
            DeliveryError::EntitlementDenied { .. } => ErrorClass::EntitlementDenied,
            DeliveryError::ConfigInvalid(_) | DeliveryError::NoAction { .. } => {
                ErrorClass::ConfigInvalid
            }
            DeliveryError::RetryExhausted { .. } => ErrorClass::RetryExhausted,
            DeliveryError::Api(_) | DeliveryError::Deserialization(_) => ErrorClass::Terminal,
        }
    }

    /// Whether the failure should be handed to the retry queue.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientTransport
    }
}

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Deserialization(err.to_string())
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => DeliveryError::Timeout(err.to_string()),
            _ => DeliveryError::Transport(err.to_string()),
        }
    }
}
