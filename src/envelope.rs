use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{generate_nonce, AesGcmCipher, EncryptedData, SecureKey, WipeOnDrop, DEK_SIZE, NONCE_SIZE};
use crate::error::{EnvelopeError, Result};
use crate::key_registry::KeyRegistry;

/// Envelope encryption: a fresh DEK per payload, wrapped by the active KEK.
///
/// Stateless across calls; every operation builds its own DEK, nonces and
/// cipher contexts, so one instance can be shared between threads.
#[derive(Clone)]
pub struct EnvelopeEncryption {
    registry: Arc<KeyRegistry>,
}

impl EnvelopeEncryption {
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn active_kek_name(&self) -> &str {
        self.registry.active_name()
    }

    /// Encrypt an atomic payload.
    ///
    /// Only the KEK-wrapped DEK leaves this call; the raw DEK is zeroized
    /// when it drops, on the error path as well.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EnvelopeCiphertext> {
        let dek = SecureKey::generate();
        let data = AesGcmCipher::encrypt(dek.as_bytes(), plaintext)?;
        let (kek_name, wrapped) = self.wrap_dek(dek.as_bytes())?;
        drop(dek);

        tracing::debug!(kek = %kek_name, bytes = plaintext.len(), "envelope encrypted");

        Ok(EnvelopeCiphertext {
            ciphertext: data.ciphertext,
            encrypted_dek: wrapped.ciphertext,
            dek_nonce: wrapped.nonce,
            data_nonce: data.nonce,
            kek_name,
        })
    }

    /// Decrypt an envelope.
    ///
    /// [`EnvelopeError::KeyNotFound`] if its KEK is no longer loaded,
    /// [`EnvelopeError::AuthenticationFailure`] on any tampering.
    pub fn decrypt(&self, envelope: &EnvelopeCiphertext) -> Result<Vec<u8>> {
        let mut scratch = [0u8; DEK_SIZE];
        self.decrypt_with_scratch(envelope, &mut scratch)
    }

    /// Like [`EnvelopeEncryption::decrypt`], recovering the DEK into
    /// `scratch`. The buffer holds only zeros once this returns.
    pub fn decrypt_with_scratch(
        &self,
        envelope: &EnvelopeCiphertext,
        scratch: &mut [u8; DEK_SIZE],
    ) -> Result<Vec<u8>> {
        let dek = self.unwrap_dek(
            &envelope.kek_name,
            &envelope.dek_nonce,
            &envelope.encrypted_dek,
            scratch,
        )?;
        let plaintext = AesGcmCipher::decrypt_parts(&dek, &envelope.data_nonce, &envelope.ciphertext)?;

        tracing::debug!(kek = %envelope.kek_name, bytes = plaintext.len(), "envelope decrypted");
        Ok(plaintext)
    }

    /// Re-wrap an envelope's DEK under the active KEK.
    ///
    /// The payload ciphertext and data nonce are carried over untouched, so
    /// rotating a KEK never re-encrypts bulk data. Once every stored
    /// envelope has been re-wrapped, the old KEK can be retired.
    pub fn rewrap(&self, envelope: &EnvelopeCiphertext) -> Result<EnvelopeCiphertext> {
        let mut scratch = [0u8; DEK_SIZE];
        let dek = self.unwrap_dek(
            &envelope.kek_name,
            &envelope.dek_nonce,
            &envelope.encrypted_dek,
            &mut scratch,
        )?;
        let (kek_name, wrapped) = self.wrap_dek(&dek)?;
        drop(dek);

        tracing::info!(from = %envelope.kek_name, to = %kek_name, "envelope DEK re-wrapped");

        Ok(EnvelopeCiphertext {
            ciphertext: envelope.ciphertext.clone(),
            encrypted_dek: wrapped.ciphertext,
            dek_nonce: wrapped.nonce,
            data_nonce: envelope.data_nonce.clone(),
            kek_name,
        })
    }

    /// DEK, data nonce and wrapped DEK for a streaming body.
    pub fn prepare_stream_key(&self) -> Result<StreamKeyBundle> {
        let dek = SecureKey::generate();
        let (kek_name, wrapped) = self.wrap_dek(dek.as_bytes())?;

        Ok(StreamKeyBundle {
            kek_name,
            dek_nonce: wrapped.nonce,
            encrypted_dek: wrapped.ciphertext,
            data_nonce: generate_nonce(),
            dek,
        })
    }

    /// Unwrap a DEK into `scratch`; the returned guard wipes it on drop.
    pub(crate) fn unwrap_dek<'a>(
        &self,
        kek_name: &str,
        dek_nonce: &[u8],
        encrypted_dek: &[u8],
        scratch: &'a mut [u8; DEK_SIZE],
    ) -> Result<WipeOnDrop<'a>> {
        let mut dek = WipeOnDrop::new(scratch);
        let kek = self.registry.get(kek_name)?;
        AesGcmCipher::decrypt_into(kek.as_bytes(), dek_nonce, encrypted_dek, &mut dek)?;
        Ok(dek)
    }

    fn wrap_dek(&self, dek: &[u8]) -> Result<(String, EncryptedData)> {
        let (kek_name, kek) = self.registry.active();
        let wrapped = AesGcmCipher::encrypt(kek.as_bytes(), dek)?;
        Ok((kek_name.to_string(), wrapped))
    }
}

/// Self-contained result of [`EnvelopeEncryption::encrypt`]. Safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeCiphertext {
    /// Payload ciphertext with the GCM tag appended
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// DEK wrapped by the named KEK, tag appended
    #[serde(with = "base64_bytes")]
    pub encrypted_dek: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub dek_nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data_nonce: Vec<u8>,
    /// KEK that wrapped the DEK
    pub kek_name: String,
}

impl EnvelopeCiphertext {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(EnvelopeError::from)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(EnvelopeError::from)
    }
}

/// Key material for one streaming container body.
#[derive(Debug)]
pub struct StreamKeyBundle {
    pub kek_name: String,
    pub dek_nonce: Vec<u8>,
    pub encrypted_dek: Vec<u8>,
    pub data_nonce: [u8; NONCE_SIZE],
    dek: SecureKey,
}

impl StreamKeyBundle {
    pub(crate) fn dek(&self) -> &SecureKey {
        &self.dek
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyRegistryConfig;
    use crate::crypto::generate_random_bytes;

    fn service_with(config: KeyRegistryConfig) -> EnvelopeEncryption {
        EnvelopeEncryption::new(Arc::new(KeyRegistry::load(&config).unwrap()))
    }

    fn service() -> EnvelopeEncryption {
        service_with(
            KeyRegistryConfig::default()
                .with_key("kek-v1", &generate_random_bytes(32))
                .with_active("kek-v1"),
        )
    }

    #[test]
    fn test_warehouse_scenario() {
        let service = service();
        let plaintext = "Sensitive Warehouse Data";

        let envelope = service.encrypt(plaintext.as_bytes()).unwrap();
        assert_eq!(envelope.kek_name, "kek-v1");
        assert_ne!(envelope.ciphertext, plaintext.as_bytes());

        let decrypted = service.decrypt(&envelope).unwrap();
        assert_eq!(String::from_utf8(decrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_round_trip_various_sizes() {
        let service = service();
        for len in [0, 1, 15, 16, 17, 4096] {
            let plaintext = generate_random_bytes(len);
            let envelope = service.encrypt(&plaintext).unwrap();
            assert_eq!(service.decrypt(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_dek_and_nonces_per_call() {
        let service = service();
        let a = service.encrypt(b"same").unwrap();
        let b = service.encrypt(b"same").unwrap();
        assert_ne!(a.encrypted_dek, b.encrypted_dek);
        assert_ne!(a.data_nonce, b.data_nonce);
        assert_ne!(a.dek_nonce, b.dek_nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    fn field(envelope: &mut EnvelopeCiphertext, index: usize) -> &mut Vec<u8> {
        match index {
            0 => &mut envelope.ciphertext,
            1 => &mut envelope.encrypted_dek,
            2 => &mut envelope.dek_nonce,
            _ => &mut envelope.data_nonce,
        }
    }

    #[test]
    fn test_tampering_any_field_fails() {
        let service = service();
        let envelope = service.encrypt(b"integrity").unwrap();

        for index in 0..4 {
            let len = field(&mut envelope.clone(), index).len();
            for bit in 0..len * 8 {
                let mut tampered = envelope.clone();
                field(&mut tampered, index)[bit / 8] ^= 1 << (bit % 8);
                assert!(matches!(
                    service.decrypt(&tampered),
                    Err(EnvelopeError::AuthenticationFailure)
                ));
            }
        }
    }

    #[test]
    fn test_rotation_keeps_old_envelopes_readable() {
        let v1 = generate_random_bytes(32);
        let v2 = generate_random_bytes(32);

        let before = service_with(KeyRegistryConfig::default().with_key("v1", &v1).with_active("v1"));
        let envelope = before.encrypt(b"rotate me").unwrap();

        let rotated = KeyRegistryConfig::default()
            .with_key("v1", &v1)
            .with_key("v2", &v2)
            .with_active("v2");
        let after = service_with(rotated.clone());
        assert_eq!(after.decrypt(&envelope).unwrap(), b"rotate me");
        assert_eq!(after.encrypt(b"new").unwrap().kek_name, "v2");

        let retired = service_with(rotated.without_key("v1"));
        assert!(matches!(retired.decrypt(&envelope), Err(EnvelopeError::KeyNotFound(_))));
    }

    #[test]
    fn test_rewrap_moves_envelope_to_active_kek() {
        let v1 = generate_random_bytes(32);
        let v2 = generate_random_bytes(32);

        let before = service_with(KeyRegistryConfig::default().with_key("v1", &v1).with_active("v1"));
        let envelope = before.encrypt(b"bulk payload").unwrap();

        let rotated = KeyRegistryConfig::default()
            .with_key("v1", &v1)
            .with_key("v2", &v2)
            .with_active("v2");
        let rewrapped = service_with(rotated.clone()).rewrap(&envelope).unwrap();
        assert_eq!(rewrapped.kek_name, "v2");
        assert_eq!(rewrapped.ciphertext, envelope.ciphertext);
        assert_eq!(rewrapped.data_nonce, envelope.data_nonce);
        assert_ne!(rewrapped.encrypted_dek, envelope.encrypted_dek);

        let retired = service_with(rotated.without_key("v1"));
        assert_eq!(retired.decrypt(&rewrapped).unwrap(), b"bulk payload");
        assert!(matches!(retired.rewrap(&envelope), Err(EnvelopeError::KeyNotFound(_))));
    }

    #[test]
    fn test_rewrap_rejects_tampered_dek() {
        let service = service();
        let mut envelope = service.encrypt(b"x").unwrap();
        envelope.encrypted_dek[0] ^= 1;
        assert!(matches!(
            service.rewrap(&envelope),
            Err(EnvelopeError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_scratch_is_zeroed_after_success() {
        let service = service();
        let envelope = service.encrypt(b"hygiene").unwrap();

        let mut scratch = [0xAAu8; DEK_SIZE];
        service.decrypt_with_scratch(&envelope, &mut scratch).unwrap();
        assert!(scratch.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_scratch_is_zeroed_after_failure() {
        let service = service();
        let mut envelope = service.encrypt(b"hygiene").unwrap();
        let last = envelope.ciphertext.len() - 1;
        envelope.ciphertext[last] ^= 0xFF;

        let mut scratch = [0xAAu8; DEK_SIZE];
        assert!(service.decrypt_with_scratch(&envelope, &mut scratch).is_err());
        assert!(scratch.iter().all(|b| *b == 0));

        envelope.kek_name = "missing".into();
        let mut scratch = [0xAAu8; DEK_SIZE];
        assert!(service.decrypt_with_scratch(&envelope, &mut scratch).is_err());
        assert!(scratch.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_json_round_trip() {
        let service = service();
        let envelope = service.encrypt(b"persist me").unwrap();

        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"kekName\":\"kek-v1\""));
        assert!(json.contains("\"encryptedDek\""));

        let restored = EnvelopeCiphertext::from_json(&json).unwrap();
        assert_eq!(restored, envelope);
        assert_eq!(service.decrypt(&restored).unwrap(), b"persist me");
        assert!(matches!(
            EnvelopeCiphertext::from_json("{}"),
            Err(EnvelopeError::Serialization(_))
        ));
    }

    #[test]
    fn test_prepare_stream_key_unwraps_to_same_dek() {
        let service = service();
        let bundle = service.prepare_stream_key().unwrap();
        assert_eq!(bundle.kek_name, "kek-v1");

        let mut scratch = [0u8; DEK_SIZE];
        let dek = service
            .unwrap_dek(&bundle.kek_name, &bundle.dek_nonce, &bundle.encrypted_dek, &mut scratch)
            .unwrap();
        assert_eq!(&dek[..], bundle.dek().as_bytes());
    }
}
