//! KMS-wrapped secrets
//!
//! For small, high-value values (API credentials, signing keys) the DEK is
//! wrapped by an external key-management root instead of a local KEK.
//! Only that root can unwrap it again.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::crypto::{AesGcmCipher, EncryptedData, SecureKey, WipeOnDrop, DEK_SIZE};
use crate::error::{EnvelopeError, Result};

/// External key-management root (cloud KMS, HSM).
///
/// Calls are synchronous round trips with no timeout or retry here;
/// implementations report transport problems as
/// [`EnvelopeError::ExternalService`].
pub trait KeyManagementRoot: Send + Sync {
    /// Wrap raw key bytes into an opaque blob
    fn wrap(&self, raw_key: &[u8]) -> Result<Vec<u8>>;

    /// Recover the raw key bytes from a blob produced by `wrap`
    fn unwrap(&self, blob: &[u8]) -> Result<SecureKey>;
}

impl<T: KeyManagementRoot + ?Sized> KeyManagementRoot for Arc<T> {
    fn wrap(&self, raw_key: &[u8]) -> Result<Vec<u8>> {
        (**self).wrap(raw_key)
    }

    fn unwrap(&self, blob: &[u8]) -> Result<SecureKey> {
        (**self).unwrap(blob)
    }
}

/// In-process root keyed with a local AES key.
///
/// Suitable for development and tests; it offers none of the custody
/// guarantees of a real KMS.
pub struct LocalKeyManagementRoot {
    root_key: SecureKey,
}

impl LocalKeyManagementRoot {
    pub fn new(root_key: SecureKey) -> Result<Self> {
        if !crate::crypto::is_valid_key_len(root_key.len()) {
            return Err(EnvelopeError::Configuration(format!(
                "root key must be 16, 24 or 32 bytes, got {}",
                root_key.len()
            )));
        }
        Ok(Self { root_key })
    }

    pub fn generate() -> Self {
        Self {
            root_key: SecureKey::generate(),
        }
    }
}

impl KeyManagementRoot for LocalKeyManagementRoot {
    fn wrap(&self, raw_key: &[u8]) -> Result<Vec<u8>> {
        AesGcmCipher::encrypt(self.root_key.as_bytes(), raw_key)
            .map(|wrapped| wrapped.to_packed())
            .map_err(|e| EnvelopeError::ExternalService(format!("wrap failed: {}", e)))
    }

    fn unwrap(&self, blob: &[u8]) -> Result<SecureKey> {
        EncryptedData::from_packed(blob)
            .and_then(|wrapped| AesGcmCipher::decrypt(self.root_key.as_bytes(), &wrapped))
            .map(SecureKey::new)
            .map_err(|_| EnvelopeError::ExternalService("unwrap rejected by key root".into()))
    }
}

/// Storable result of [`SecretWrappingService::encrypt_secret`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedSecret {
    /// Root-wrapped DEK, base64
    pub wrapped_dek_b64: String,
    /// `nonce(12) || ciphertext || tag(16)`, base64
    pub packed_ciphertext_b64: String,
}

/// Envelope encryption rooted in a [`KeyManagementRoot`].
pub struct SecretWrappingService<R: KeyManagementRoot> {
    root: R,
}

impl<R: KeyManagementRoot> SecretWrappingService<R> {
    pub fn new(root: R) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &R {
        &self.root
    }

    pub fn encrypt_secret(&self, plaintext: &[u8]) -> Result<WrappedSecret> {
        let dek = SecureKey::generate();
        let packed = AesGcmCipher::encrypt(dek.as_bytes(), plaintext)?.to_base64();
        let blob = self.root.wrap(dek.as_bytes())?;
        drop(dek);

        tracing::debug!(bytes = plaintext.len(), "secret wrapped");
        Ok(WrappedSecret {
            wrapped_dek_b64: STANDARD.encode(blob),
            packed_ciphertext_b64: packed,
        })
    }

    pub fn decrypt_secret(&self, secret: &WrappedSecret) -> Result<Vec<u8>> {
        let mut scratch = [0u8; DEK_SIZE];
        self.decrypt_secret_with_scratch(secret, &mut scratch)
    }

    /// Decrypt a secret that is expected to be UTF-8 text
    pub fn decrypt_secret_string(&self, secret: &WrappedSecret) -> Result<String> {
        String::from_utf8(self.decrypt_secret(secret)?)
            .map_err(|_| EnvelopeError::MalformedCiphertext("secret is not valid UTF-8".into()))
    }

    /// Like [`SecretWrappingService::decrypt_secret`], with the unwrapped
    /// DEK held in `scratch`, which is zeroed on return.
    pub fn decrypt_secret_with_scratch(
        &self,
        secret: &WrappedSecret,
        scratch: &mut [u8; DEK_SIZE],
    ) -> Result<Vec<u8>> {
        let mut dek = WipeOnDrop::new(scratch);

        let blob = STANDARD
            .decode(&secret.wrapped_dek_b64)
            .map_err(|e| EnvelopeError::MalformedCiphertext(format!("wrapped DEK: {}", e)))?;

        let unwrapped = self.root.unwrap(&blob)?;
        if unwrapped.is_empty() {
            return Err(EnvelopeError::EmptyUnwrapResult);
        }
        if unwrapped.len() != DEK_SIZE {
            return Err(EnvelopeError::Crypto(format!(
                "Unwrapped key has {} bytes, expected {}",
                unwrapped.len(),
                DEK_SIZE
            )));
        }
        dek.copy_from_slice(unwrapped.as_bytes());
        drop(unwrapped);

        let packed = EncryptedData::from_base64(&secret.packed_ciphertext_b64)?;
        AesGcmCipher::decrypt(&dek, &packed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NONCE_SIZE, TAG_SIZE};

    struct EmptyRoot;

    impl KeyManagementRoot for EmptyRoot {
        fn wrap(&self, raw_key: &[u8]) -> Result<Vec<u8>> {
            Ok(raw_key.to_vec())
        }

        fn unwrap(&self, _blob: &[u8]) -> Result<SecureKey> {
            Ok(SecureKey::new(Vec::new()))
        }
    }

    struct OfflineRoot;

    impl KeyManagementRoot for OfflineRoot {
        fn wrap(&self, _raw_key: &[u8]) -> Result<Vec<u8>> {
            Err(EnvelopeError::ExternalService("connection refused".into()))
        }

        fn unwrap(&self, _blob: &[u8]) -> Result<SecureKey> {
            Err(EnvelopeError::ExternalService("connection refused".into()))
        }
    }

    fn service() -> SecretWrappingService<LocalKeyManagementRoot> {
        SecretWrappingService::new(LocalKeyManagementRoot::generate())
    }

    #[test]
    fn test_round_trip_strings() {
        let service = service();
        for secret in ["", "hunter2", "pässwörd ✓", &"x".repeat(10_000)] {
            let wrapped = service.encrypt_secret(secret.as_bytes()).unwrap();
            assert_eq!(service.decrypt_secret_string(&wrapped).unwrap(), secret);
        }
    }

    #[test]
    fn test_packed_layout() {
        let service = service();
        let wrapped = service.encrypt_secret(b"layout").unwrap();
        let packed = STANDARD.decode(&wrapped.packed_ciphertext_b64).unwrap();
        assert_eq!(packed.len(), NONCE_SIZE + b"layout".len() + TAG_SIZE);
    }

    #[test]
    fn test_other_root_cannot_unwrap() {
        let wrapped = service().encrypt_secret(b"bound to one root").unwrap();
        let err = service().decrypt_secret(&wrapped).unwrap_err();
        assert!(matches!(err, EnvelopeError::ExternalService(_)));
    }

    #[test]
    fn test_empty_unwrap_result() {
        let service = SecretWrappingService::new(EmptyRoot);
        let wrapped = service.encrypt_secret(b"revoked").unwrap();
        assert!(matches!(
            service.decrypt_secret(&wrapped),
            Err(EnvelopeError::EmptyUnwrapResult)
        ));
    }

    #[test]
    fn test_short_packed_payload_is_malformed() {
        let service = service();
        let mut wrapped = service.encrypt_secret(b"x").unwrap();
        wrapped.packed_ciphertext_b64 = STANDARD.encode([0u8; NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(
            service.decrypt_secret(&wrapped),
            Err(EnvelopeError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn test_tampered_payload_fails_authentication() {
        let service = service();
        let mut wrapped = service.encrypt_secret(b"tamper").unwrap();
        let mut packed = STANDARD.decode(&wrapped.packed_ciphertext_b64).unwrap();
        packed[NONCE_SIZE] ^= 1;
        wrapped.packed_ciphertext_b64 = STANDARD.encode(packed);
        assert!(matches!(
            service.decrypt_secret(&wrapped),
            Err(EnvelopeError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_root_failures_propagate() {
        let service = SecretWrappingService::new(OfflineRoot);
        assert!(matches!(
            service.encrypt_secret(b"x"),
            Err(EnvelopeError::ExternalService(_))
        ));
    }

    #[test]
    fn test_scratch_is_zeroed_on_success_and_failure() {
        let service = service();
        let wrapped = service.encrypt_secret(b"hygiene").unwrap();

        let mut scratch = [0xAAu8; DEK_SIZE];
        assert_eq!(service.decrypt_secret_with_scratch(&wrapped, &mut scratch).unwrap(), b"hygiene");
        assert!(scratch.iter().all(|b| *b == 0));

        let mut broken = wrapped.clone();
        broken.packed_ciphertext_b64 = STANDARD.encode([0u8; 8]);
        let mut scratch = [0xAAu8; DEK_SIZE];
        assert!(service.decrypt_secret_with_scratch(&broken, &mut scratch).is_err());
        assert!(scratch.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_shared_root_through_arc() {
        let root = Arc::new(LocalKeyManagementRoot::generate());
        let writer = SecretWrappingService::new(Arc::clone(&root));
        let reader = SecretWrappingService::new(root);
        let wrapped = writer.encrypt_secret(b"shared").unwrap();
        assert_eq!(reader.decrypt_secret(&wrapped).unwrap(), b"shared");
    }

    #[test]
    fn test_serde_field_names() {
        let wrapped = service().encrypt_secret(b"json").unwrap();
        let json = serde_json::to_string(&wrapped).unwrap();
        assert!(json.contains("wrappedDekB64"));
        assert!(json.contains("packedCiphertextB64"));
    }
}
