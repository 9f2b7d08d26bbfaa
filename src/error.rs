//! The error taxonomy for the responder core. See spec §7.

use thiserror::Error;

/// Errors raised by the public API and, internally, by the wire codec.
///
/// `WireFormat` never reaches a caller of the public API — it's absorbed
/// at the query-responder boundary (see `responder::Responder`) and only
/// exists here because the codec modules need somewhere to put it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A service registration, rename, or TXT update failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A DNS message or name failed to decode.
    #[error("malformed wire data: {0}")]
    WireFormat(String),

    /// The transport failed in a way that should be surfaced to the caller
    /// (a transient send failure is logged instead, per spec §7).
    #[error("transport error: {0}")]
    Network(String),

    /// `register` exhausted its rename budget (spec §4.4, §7).
    #[error("exhausted {attempts} rename attempts for {base_name:?}")]
    ConflictExhausted { base_name: String, attempts: u8 },

    /// The calling context was canceled during Probing or Announcing.
    #[error("canceled")]
    Canceled,

    /// The responder (or one of its background tasks) has already closed.
    #[error("responder is closed")]
    Closed,

    /// `register`/`unregister`/`update_service` referenced a name that
    /// doesn't exist in the registry, or a duplicate `fullName` collided.
    #[error("{0}")]
    Registry(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
