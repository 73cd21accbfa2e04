use bitcoin::Network;
use thiserror::Error;

/// This is an alias for the result type returned by service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified service error.
///
/// The variant chosen at a component boundary is what governs retry
/// behavior downstream: the payout loop consults [`Error::is_retryable`]
/// and nothing else.
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal misconfiguration. Aborts the process at startup.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// An integrity guarantee was violated: ciphertext failed
    /// authentication, or a uniqueness invariant broke without a
    /// preceding cause. Aborts the current operation, never retried.
    #[error("integrity: {0}")]
    Integrity(String),

    /// External service fault that may succeed on a later attempt
    /// (timeout, 5xx, connection reset, broadcast rejection).
    #[error("external: {0}")]
    Retryable(#[source] ExplorerError),

    /// External service rejected the operation for a structural reason
    /// (bad signature, malformed transaction). Terminal.
    #[error("external (permanent): {0}")]
    Permanent(#[source] ExplorerError),

    /// Invalid input from the depositor. The transaction is absorbed
    /// (marked processed) with no bet and no refund.
    #[error("rejected deposit: {0}")]
    User(String),

    /// No UTXO combination covers the requested amount plus the fee
    /// buffer. Retryable until the payout's attempts are exhausted.
    #[error("insufficient funds: need {needed} sat, have {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },

    /// Interrupted by shutdown or a deadline; the next start's sweepers
    /// resume the work.
    #[error("interrupted: {0}")]
    Transient(String),

    /// Storage-layer fault surfaced by sled.
    #[error("storage: {0}")]
    Storage(#[from] sled::Error),

    /// A stored document failed to (de)serialize. Treated as corruption.
    #[error("document codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Retryable(_) | Error::InsufficientFunds { .. } | Error::Transient(_)
        )
    }

    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    pub(crate) fn user(msg: impl Into<String>) -> Self {
        Error::User(msg.into())
    }
}

impl From<ExplorerError> for Error {
    fn from(e: ExplorerError) -> Self {
        if e.is_retryable() {
            Error::Retryable(e)
        } else {
            Error::Permanent(e)
        }
    }
}

/// Errors from the explorer REST/WebSocket boundary.
#[derive(Debug, Error)]
pub enum ExplorerError {
    /// Connection could not be established or was reset mid-flight.
    #[error("connection: {0}")]
    Connection(String),

    /// The per-request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The response body did not parse as the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Non-success HTTP status with the explorer's reason body.
    #[error("status {0}: {1}")]
    Status(u16, String),

    /// All broadcast endpoints rejected the raw transaction.
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// WebSocket-level failure (handshake, protocol, stale connection).
    #[error("websocket: {0}")]
    Ws(String),

    /// Catch-all for faults that fit no other variant.
    #[error("{0}")]
    Other(String),
}

impl ExplorerError {
    /// Server-side and transport faults are worth retrying; client-side
    /// rejections are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExplorerError::Connection(_) | ExplorerError::Timeout | ExplorerError::Ws(_) => true,
            ExplorerError::Status(code, _) => *code == 429 || *code >= 500,
            ExplorerError::MalformedResponse(_) => true,
            ExplorerError::BroadcastRejected(_) => false,
            ExplorerError::Other(_) => false,
        }
    }
}

impl From<reqwest::Error> for ExplorerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExplorerError::Timeout
        } else if err.is_connect() {
            ExplorerError::Connection(err.to_string())
        } else if err.is_decode() {
            ExplorerError::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ExplorerError::Status(status.as_u16(), err.to_string())
        } else {
            ExplorerError::Other(err.to_string())
        }
    }
}

/// Errors raised while loading or validating configuration. All of these
/// are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    /// The explorer endpoint serves a different chain than the service is
    /// configured for. Guards against signing mainnet funds against a
    /// testnet index.
    #[error("network mismatch: configured for {expected} but explorer serves {actual}")]
    NetworkMismatch { expected: Network, actual: Network },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn explorer_retryability() {
        assert!(ExplorerError::Timeout.is_retryable());
        assert!(ExplorerError::Connection("reset".into()).is_retryable());
        assert!(ExplorerError::Status(502, "bad gateway".into()).is_retryable());
        assert!(ExplorerError::Status(429, "slow down".into()).is_retryable());
        assert!(!ExplorerError::Status(400, "bad request".into()).is_retryable());
        assert!(!ExplorerError::BroadcastRejected("bad-txns".into()).is_retryable());
    }

    #[test]
    fn classification_follows_retryability() {
        let e: Error = ExplorerError::Timeout.into();
        assert!(matches!(e, Error::Retryable(_)));
        assert!(e.is_retryable());

        let e: Error = ExplorerError::BroadcastRejected("scriptsig".into()).into();
        assert!(matches!(e, Error::Permanent(_)));
        assert!(!e.is_retryable());

        assert!(Error::InsufficientFunds {
            needed: 21_000,
            available: 500
        }
        .is_retryable());
        assert!(!Error::integrity("ciphertext failed authentication").is_retryable());
    }
}
