//! Unified error model for the datastore.
//! One enum covers every layer (parsing, framing, disk, network, config) so
//! handlers and background loops can map failures to a disposition without
//! downcasting. The HTTP boundary uses `http_status` to pick a response class.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Variable failed to parse or was rejected on ingest.
    #[error("invalid variable: {0}")]
    InvalidVariable(String),

    /// A framed record or a request body could not be decoded.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("i/o failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Variable absent, or a store file header was unreadable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Peer unreachable or request deadline exceeded.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// New config text failed to decode; the old config stays active.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// Record-log queue is at capacity; the write should be retried later.
    #[error("record log queue full")]
    Backpressure,

    /// A request or mutation argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shutdown flag observed; background loop exiting.
    #[error("shutting down")]
    Shutdown,
}

impl StoreError {
    pub fn invalid_variable<S: Into<String>>(msg: S) -> Self {
        StoreError::InvalidVariable(msg.into())
    }

    pub fn decode<S: Into<String>>(msg: S) -> Self {
        StoreError::DecodeFailure(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        StoreError::NotFound(msg.into())
    }

    /// Map to an HTTP status code at the request boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::InvalidVariable(_) | StoreError::InvalidArgument(_) => 400,
            StoreError::DecodeFailure(_) => 400,
            StoreError::NotFound(_) => 404,
            StoreError::ConfigInvalid(_) => 400,
            StoreError::Backpressure => 503,
            StoreError::IoFailure(_) | StoreError::NetworkFailure(_) => 503,
            StoreError::Shutdown => 503,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::DecodeFailure(err.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::NetworkFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(StoreError::invalid_variable("x").http_status(), 400);
        assert_eq!(StoreError::decode("bad frame").http_status(), 400);
        assert_eq!(StoreError::not_found("missing").http_status(), 404);
        assert_eq!(StoreError::Backpressure.http_status(), 503);
        assert_eq!(
            StoreError::NetworkFailure("peer down".into()).http_status(),
            503
        );
    }
}
