//! Envelope encryption core.
//!
//! Named KEKs wrap per-operation DEKs; payloads are sealed with AES-GCM as
//! atomic envelopes, as streaming containers, or (for small secrets) with
//! the DEK wrapped by an external key-management root.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod gcm_stream;
pub mod key_registry;
pub mod secret;
pub mod stream;

pub use config::KeyRegistryConfig;
pub use crypto::{AesGcmCipher, EncryptedData, SecureKey, AES_256_KEY_SIZE, DEK_SIZE, NONCE_SIZE, TAG_SIZE};
pub use envelope::{EnvelopeCiphertext, EnvelopeEncryption, StreamKeyBundle};
pub use error::{EnvelopeError, Result};
pub use key_registry::KeyRegistry;
pub use secret::{KeyManagementRoot, LocalKeyManagementRoot, SecretWrappingService, WrappedSecret};
pub use stream::{StreamHeader, StreamingCodec, STREAM_MAGIC};

pub mod prelude {
    pub use crate::{
        EnvelopeCiphertext, EnvelopeEncryption, EnvelopeError, KeyManagementRoot, KeyRegistry,
        KeyRegistryConfig, Result, SecretWrappingService, StreamingCodec, WrappedSecret,
    };
}
