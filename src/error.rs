//! Error types for the envelope encryption core

use thiserror::Error;

/// Result type alias for envelope encryption operations
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors that can occur during envelope encryption operations
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Missing or malformed key configuration. Only raised at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Named KEK is not loaded in the registry
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// AEAD tag mismatch. Wrong key and tampered data are not distinguished.
    #[error("Authentication failed")]
    AuthenticationFailure,

    /// Stream container does not start with the expected magic
    #[error("Bad container magic")]
    BadMagic,

    /// Stream ended before the container header was complete
    #[error("Truncated container header")]
    TruncatedHeader,

    /// A value does not fit the container format
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Packed ciphertext is not decodable or too short
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// The external key-management root failed the round trip
    #[error("External key service failure: {0}")]
    ExternalService(String),

    /// The external key-management root returned a zero-length key
    #[error("External key service returned an empty key")]
    EmptyUnwrapResult,

    /// Cryptographic misuse (bad key size, cipher init)
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Stream I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EnvelopeError {
    /// Message shown to callers outside the trust boundary.
    pub const UNDECIPHERABLE: &'static str = "cannot process data";

    /// True for failures that are indistinguishable from active tampering.
    pub fn is_undecipherable(&self) -> bool {
        matches!(
            self,
            EnvelopeError::AuthenticationFailure
                | EnvelopeError::BadMagic
                | EnvelopeError::TruncatedHeader
                | EnvelopeError::MalformedCiphertext(_)
        )
    }

    /// Boundary-safe description that never reveals which integrity check failed.
    pub fn public_message(&self) -> String {
        if self.is_undecipherable() {
            Self::UNDECIPHERABLE.to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        EnvelopeError::Serialization(err.to_string())
    }
}
