//! Error kinds, one per row of spec §7 (Error Handling Design).

use thiserror::Error;

/// Raised while parsing a DSN or building a `ConnectionConfig`. Fatal at
/// configuration time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid dsn: {0}")]
    InvalidDsn(String),

    #[error("unknown backend scheme: {0}")]
    UnknownScheme(String),

    #[error("unknown serializer: {0}")]
    UnknownSerializer(String),

    #[error("a connection named \"{0}\" has already been configured")]
    DuplicateConnection(String),

    #[error("missing connection: {0}")]
    MissingConnection(String),
}

/// Raised by the codec. Decode failures are never delivered to user code;
/// see spec §7, "Decode failure" row.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("deserialization failed: {0}")]
    Deserialize(String),

    #[error("decryption failed (bad key or corrupted payload)")]
    Decrypt,

    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// The single error type surfaced by `Interface` operations. All backend
/// errors (transient or permanent, per spec §7) are wrapped in this at the
/// point they cross the trait boundary, mirroring `InterfaceError` in
/// `morp/exception.py` and `Interface._raise_error` in `interface/base.py`.
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("queue {0} does not exist")]
    NoSuchQueue(String),

    #[error("not connected")]
    NotConnected,
}

impl InterfaceError {
    /// Wrap an arbitrary backend error, the Rust analogue of
    /// `Interface._raise_error` / `raise_error` in the Python source.
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        InterfaceError::Backend(e.to_string())
    }
}
