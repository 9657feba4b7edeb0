use std::collections::HashMap;

use base64::{engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD}, Engine};
use sha2::{Digest, Sha256};

use crate::config::KeyRegistryConfig;
use crate::crypto::{is_valid_key_len, SecureKey};
use crate::error::{EnvelopeError, Result};

/// Named KEKs, one of them active.
///
/// Built once at startup by [`KeyRegistry::load`] and read-only after that,
/// so it can be shared behind an `Arc` without locking. Rotation means
/// loading a new name, pointing `active` at it and keeping the old names
/// around for decryption.
pub struct KeyRegistry {
    keys: HashMap<String, SecureKey>,
    active: String,
}

impl KeyRegistry {
    /// Decode and validate every configured KEK.
    ///
    /// Fails with [`EnvelopeError::Configuration`] if any key is malformed or
    /// the active designator is missing or unknown.
    pub fn load(config: &KeyRegistryConfig) -> Result<Self> {
        let mut keys = HashMap::with_capacity(config.keys.len());

        for (name, encoded) in &config.keys {
            if name.is_empty() {
                return Err(EnvelopeError::Configuration("KEK name must not be empty".into()));
            }

            let key = SecureKey::new(STANDARD.decode(encoded.trim()).map_err(|e| {
                EnvelopeError::Configuration(format!("KEK '{}' is not valid base64: {}", name, e))
            })?);

            if !is_valid_key_len(key.len()) {
                return Err(EnvelopeError::Configuration(format!(
                    "KEK '{}' must be 16, 24 or 32 bytes, got {}",
                    name,
                    key.len()
                )));
            }

            tracing::debug!(kek = %name, bits = key.len() * 8, fingerprint = %fingerprint_of(&key), "loaded KEK");
            keys.insert(name.clone(), key);
        }

        let active = config
            .active
            .clone()
            .ok_or_else(|| EnvelopeError::Configuration("no active KEK designated".into()))?;

        if !keys.contains_key(&active) {
            return Err(EnvelopeError::Configuration(format!(
                "active KEK '{}' is not among the loaded keys",
                active
            )));
        }

        tracing::info!(keys = keys.len(), active = %active, "key registry loaded");
        Ok(Self { keys, active })
    }

    /// Active KEK used for all new encryptions
    pub fn active(&self) -> (&str, &SecureKey) {
        // `load` guarantees the active name resolves
        (&self.active, &self.keys[&self.active])
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    /// Look up a KEK by name, active or retired
    pub fn get(&self, name: &str) -> Result<&SecureKey> {
        self.keys
            .get(name)
            .ok_or_else(|| EnvelopeError::KeyNotFound(format!("KEK '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    /// Loaded KEK names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Short, non-reversible identifier for logs and audits
    pub fn fingerprint(&self, name: &str) -> Result<String> {
        self.get(name).map(fingerprint_of)
    }
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("keys", &self.names())
            .field("active", &self.active)
            .finish()
    }
}

fn fingerprint_of(key: &SecureKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..8])
}
