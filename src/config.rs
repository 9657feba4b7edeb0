//! Key source configuration
//!
//! KEKs arrive as base64 strings keyed by name, plus the name of the one
//! that should be active. Where they come from (env, JSON, secret store)
//! does not matter to the registry.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{EnvelopeError, Result};

/// Environment variable listing KEKs as `name:base64[,name:base64...]`
pub const KEYS_ENV_VAR: &str = "ENVELOPE_KEKS";

/// Environment variable naming the active KEK
pub const ACTIVE_KEY_ENV_VAR: &str = "ENVELOPE_ACTIVE_KEK";

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct KeyRegistryConfig {
    /// KEK name -> base64 key bytes
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    /// Name of the KEK used for new encryptions
    #[serde(default)]
    pub active: Option<String>,
}

impl KeyRegistryConfig {
    /// Read keys from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read keys through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(KEYS_ENV_VAR)
            .ok_or_else(|| EnvelopeError::Configuration(format!("{} not set", KEYS_ENV_VAR)))?;

        let mut keys = BTreeMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, encoded) = entry.split_once(':').ok_or_else(|| {
                EnvelopeError::Configuration(format!(
                    "{} entries must look like name:base64",
                    KEYS_ENV_VAR
                ))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(EnvelopeError::Configuration(format!(
                    "{} contains an entry with an empty key name",
                    KEYS_ENV_VAR
                )));
            }
            if keys.insert(name.to_string(), encoded.trim().to_string()).is_some() {
                return Err(EnvelopeError::Configuration(format!(
                    "KEK '{}' is declared more than once",
                    name
                )));
            }
        }

        let active = lookup(ACTIVE_KEY_ENV_VAR)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(Self { keys, active })
    }

    /// Parse the serialized form
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EnvelopeError::Configuration(format!("invalid key configuration: {}", e)))
    }

    /// Add a raw key under `name`
    pub fn with_key(mut self, name: impl Into<String>, raw: &[u8]) -> Self {
        self.keys.insert(name.into(), STANDARD.encode(raw));
        self
    }

    /// Designate the active key
    pub fn with_active(mut self, name: impl Into<String>) -> Self {
        self.active = Some(name.into());
        self
    }

    /// Drop a key, e.g. to retire it after rotation
    pub fn without_key(mut self, name: &str) -> Self {
        self.keys.remove(name);
        self
    }
}

impl std::fmt::Debug for KeyRegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistryConfig")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_lookup() {
        let k1 = STANDARD.encode([1u8; 32]);
        let k2 = STANDARD.encode([2u8; 16]);
        let keys = format!("kek-v1:{}, kek-v2:{}", k1, k2);
        let config = KeyRegistryConfig::from_lookup(lookup(&[
            (KEYS_ENV_VAR, keys.as_str()),
            (ACTIVE_KEY_ENV_VAR, "kek-v2"),
        ]))
        .unwrap();

        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys["kek-v1"], k1);
        assert_eq!(config.active.as_deref(), Some("kek-v2"));
    }

    #[test]
    fn test_missing_keys_var() {
        let err = KeyRegistryConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, EnvelopeError::Configuration(_)));
    }

    #[test]
    fn test_malformed_entries() {
        for bad in ["kek-v1", ":AAAA", "a:AAAA,a:BBBB"] {
            let err = KeyRegistryConfig::from_lookup(lookup(&[(KEYS_ENV_VAR, bad)])).unwrap_err();
            assert!(matches!(err, EnvelopeError::Configuration(_)), "{}", bad);
        }
    }

    #[test]
    fn test_blank_active_is_absent() {
        let config = KeyRegistryConfig::from_lookup(lookup(&[
            (KEYS_ENV_VAR, "a:AAAA"),
            (ACTIVE_KEY_ENV_VAR, "  "),
        ]))
        .unwrap();
        assert!(config.active.is_none());
    }

    #[test]
    fn test_json_and_builder_agree() {
        let built = KeyRegistryConfig::default()
            .with_key("kek-v1", &[7u8; 32])
            .with_active("kek-v1");
        let json = serde_json::to_string(&built).unwrap();
        let parsed = KeyRegistryConfig::from_json(&json).unwrap();

        assert_eq!(parsed.keys, built.keys);
        assert_eq!(parsed.active, built.active);
        assert!(KeyRegistryConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let config = KeyRegistryConfig::default().with_key("kek-v1", &[7u8; 32]);
        let debug = format!("{:?}", config);
        assert!(debug.contains("kek-v1"));
        assert!(!debug.contains(&STANDARD.encode([7u8; 32])));
    }
}
