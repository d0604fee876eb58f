//! SDK error taxonomy.
//!
//! One enum for the whole workspace. Deploy, chain, and session code all
//! return [`SdkResult`]; callers match on the variant to decide whether a
//! failure is retryable (`SessionExpired`, `NetworkError`) or terminal
//! (`InvalidConfig`, `InsufficientFunds`, ...).

use thiserror::Error;

/// Convenience alias used across all SDK crates.
pub type SdkResult<T> = Result<T, SdkError>;

/// Errors produced by the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Agent configuration failed validation before any I/O.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The wallet private key could not be decoded.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// The backend rejected our schema version (HTTP 400 `SCHEMA_OUTDATED`).
    #[error("agent schema version is outdated, upgrade the SDK")]
    SchemaOutdated,

    /// Headless minting is disabled server-side (HTTP 503 sentinel).
    #[error("headless minting is temporarily disabled")]
    HeadlessMintingDisabled,

    /// Challenge/signature verification failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The bearer session token expired (HTTP 401). Recoverable by
    /// re-authenticating once and retrying the call.
    #[error("session expired")]
    SessionExpired,

    /// HTTP 403.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// HTTP 409, e.g. the agent id was reserved by another request.
    #[error("conflict: {0}")]
    Conflict(String),

    /// HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 429.
    #[error("rate limit exceeded, wait and retry")]
    RateLimited,

    /// Wallet balance below the mint price.
    #[error("insufficient funds: have {have} wei, need {need} wei")]
    InsufficientFunds { have: String, need: String },

    /// Gas estimation failed, meaning the mint transaction would revert
    /// (typically a rejected backend signature).
    #[error("mint would revert: {0}")]
    WouldRevert(String),

    /// No receipt within the polling deadline.
    #[error("timed out waiting for receipt of {0}")]
    ReceiptTimeout(String),

    /// The transaction was mined with a failure status.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// Neither a `Minted` nor a `Transfer` event carried a token id.
    #[error("could not extract token id from receipt logs")]
    TokenIdNotExtractable,

    /// The token id does not fit the backend's signed 64-bit field.
    #[error("token id {0} exceeds the signed 64-bit boundary")]
    TokenIdOutOfRange(String),

    /// A WAL-recorded transaction has no receipt yet; re-run later.
    #[error("pending transaction status unknown, re-run later: {0}")]
    PendingTransactionUnknown(String),

    /// Transport- or HTTP-level failure.
    #[error("network error: {0}")]
    NetworkError(String),

    /// A contract view call or RPC interaction failed.
    #[error("contract error: {0}")]
    ContractError(String),

    /// The session transport could not establish a connection.
    #[error("failed to connect: {0}")]
    ConnectError(String),

    /// A send was attempted while no session connection is live.
    #[error("not connected")]
    NotConnected,

    /// A deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled by shutdown or session loss.
    #[error("operation cancelled")]
    Cancelled,

    /// HTTP 503 without a recognized sentinel body.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Corrupt persistent state, failed serialization, or other internal
    /// failures. Persistent files are never auto-deleted on this path so
    /// the operator can inspect them.
    #[error("{0}")]
    Internal(String),
}

impl SdkError {
    /// Stable code delivered in `agent_error` payloads for task failures.
    pub fn task_error_code(&self) -> &'static str {
        match self {
            SdkError::RateLimited => "RATE_LIMITED",
            SdkError::Timeout => "TIMEOUT",
            SdkError::Cancelled => "CANCELLED",
            _ => "TASK_FAILED",
        }
    }

    /// True when retrying after a single re-authentication makes sense.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, SdkError::SessionExpired)
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Internal(format!("JSON serialization failed: {err}"))
    }
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        SdkError::Internal(format!("I/O error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_codes() {
        assert_eq!(SdkError::RateLimited.task_error_code(), "RATE_LIMITED");
        assert_eq!(SdkError::Timeout.task_error_code(), "TIMEOUT");
        assert_eq!(SdkError::Cancelled.task_error_code(), "CANCELLED");
        assert_eq!(
            SdkError::Internal("boom".into()).task_error_code(),
            "TASK_FAILED"
        );
    }

    #[test]
    fn test_session_expired_probe() {
        assert!(SdkError::SessionExpired.is_session_expired());
        assert!(!SdkError::RateLimited.is_session_expired());
    }
}
