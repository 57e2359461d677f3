//! Billing error types

use thiserror::Error;

/// Maximum length of an error message persisted alongside an event record.
/// Stored errors may end up in replicated logs and admin views, so they are
/// bounded and never contain secrets.
pub const MAX_PERSISTED_ERROR_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Signature verification failed. Fail closed, never retried internally.
    #[error("webhook signature invalid")]
    SignatureInvalid,

    /// A provider name we have no verification strategy for. This is a
    /// configuration error, not a validation failure.
    #[error("unknown webhook provider: {0}")]
    UnknownProvider(String),

    /// The event was already applied. Idempotent success, not a failure.
    #[error("already processed")]
    AlreadyProcessed,

    /// Replay refused because the retry ceiling was reached.
    #[error("max retries exhausted")]
    RetryExhausted,

    /// Ledger/cache/blob unavailable. Surfaced as 5xx so the provider
    /// retries delivery; never interpreted as "not a duplicate".
    #[error("transient store failure: {0}")]
    TransientStore(String),

    /// A state machine handler failed; the event is marked `failed` and
    /// remains available for replay.
    #[error("handler failure: {0}")]
    Handler(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<siteforge_shared::KvError> for BillingError {
    fn from(err: siteforge_shared::KvError) -> Self {
        BillingError::TransientStore(err.to_string())
    }
}

/// Truncate an error message before persisting it.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_PERSISTED_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_PERSISTED_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}
