//! Cryptographic primitives for envelope encryption
//!
//! Single-shot AES-GCM (128/192/256-bit keys, 96-bit nonce, 128-bit tag)
//! plus the key and buffer wrappers that keep raw key bytes off the heap
//! once they are no longer needed.

use std::ops::{Deref, DerefMut};

use aes::Aes192;
use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit, OsRng},
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{EnvelopeError, Result};

/// AES-128 key size in bytes
pub const AES_128_KEY_SIZE: usize = 16;

/// AES-192 key size in bytes
pub const AES_192_KEY_SIZE: usize = 24;

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// DEKs are always AES-256
pub const DEK_SIZE: usize = AES_256_KEY_SIZE;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Returns true if `len` is a usable AES key length.
pub fn is_valid_key_len(len: usize) -> bool {
    matches!(len, AES_128_KEY_SIZE | AES_192_KEY_SIZE | AES_256_KEY_SIZE)
}

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Copy a key out of a borrowed slice
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec() }
    }

    /// Generate a new random AES-256 key
    pub fn generate() -> Self {
        let mut key = vec![0u8; AES_256_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { bytes: key }
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Borrowed key buffer that is zeroed when the guard goes out of scope,
/// on success and error paths alike.
pub struct WipeOnDrop<'a> {
    buf: &'a mut [u8],
}

impl<'a> WipeOnDrop<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }
}

impl Deref for WipeOnDrop<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf
    }
}

impl DerefMut for WipeOnDrop<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf
    }
}

impl Drop for WipeOnDrop<'_> {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}

/// Encrypted data container with nonce and ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: Vec<u8>,
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Create a new EncryptedData container
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// `nonce || ciphertext || tag`
    pub fn to_packed(&self) -> Vec<u8> {
        [self.nonce.as_slice(), self.ciphertext.as_slice()].concat()
    }

    /// Split a packed buffer back into nonce and ciphertext
    pub fn from_packed(packed: &[u8]) -> Result<Self> {
        if packed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(EnvelopeError::MalformedCiphertext(format!(
                "expected at least {} bytes, got {}",
                NONCE_SIZE + TAG_SIZE,
                packed.len()
            )));
        }

        let (nonce, ciphertext) = packed.split_at(NONCE_SIZE);
        Ok(Self {
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Encode the packed form to base64 for storage
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_packed())
    }

    /// Decode from base64
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| EnvelopeError::MalformedCiphertext(format!("base64 decode error: {}", e)))?;
        Self::from_packed(&decoded)
    }
}

/// AES-GCM keyed for one of the three AES key sizes.
enum GcmCipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl GcmCipher {
    fn new(key: &[u8]) -> Result<Self> {
        let cipher = match key.len() {
            AES_128_KEY_SIZE => Aes128Gcm::new_from_slice(key).map(Self::Aes128),
            AES_192_KEY_SIZE => Aes192Gcm::new_from_slice(key).map(Self::Aes192),
            AES_256_KEY_SIZE => Aes256Gcm::new_from_slice(key).map(Self::Aes256),
            other => {
                return Err(EnvelopeError::Crypto(format!(
                    "Invalid key size: expected 16, 24 or 32 bytes, got {}",
                    other
                )))
            }
        };
        cipher.map_err(|e| EnvelopeError::Crypto(format!("Cipher init error: {}", e)))
    }

    fn encrypt(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> aes_gcm::aead::Result<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.encrypt(nonce, plaintext),
            Self::Aes192(c) => c.encrypt(nonce, plaintext),
            Self::Aes256(c) => c.encrypt(nonce, plaintext),
        }
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> aes_gcm::aead::Result<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes192(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
    }
}

/// AES-GCM cipher wrapper.
///
/// A fresh cipher context is built for every call and dropped before
/// returning, so no keyed state outlives the operation.
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext under a fresh random 96-bit nonce.
    ///
    /// # Returns
    /// Encrypted data containing the nonce and `ciphertext || tag`
    pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<EncryptedData> {
        let cipher = GcmCipher::new(key)?;
        let nonce = generate_nonce();

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| EnvelopeError::Crypto(format!("Encryption error: {}", e)))?;

        Ok(EncryptedData::new(nonce.to_vec(), ciphertext))
    }

    /// Decrypt an [`EncryptedData`] container
    pub fn decrypt(key: &[u8], encrypted: &EncryptedData) -> Result<Vec<u8>> {
        Self::decrypt_parts(key, &encrypted.nonce, &encrypted.ciphertext)
    }

    /// Decrypt `ciphertext || tag` under `nonce`.
    ///
    /// Every integrity problem, including a nonce of the wrong size, is
    /// reported as [`EnvelopeError::AuthenticationFailure`].
    pub fn decrypt_parts(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = GcmCipher::new(key)?;

        if nonce.len() != NONCE_SIZE {
            return Err(EnvelopeError::AuthenticationFailure);
        }

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EnvelopeError::AuthenticationFailure)
    }

    /// Decrypt a wrapped key straight into `out`, which must match the
    /// recovered length exactly. The intermediate plaintext is zeroized.
    pub fn decrypt_into(key: &[u8], nonce: &[u8], ciphertext: &[u8], out: &mut [u8]) -> Result<()> {
        let plaintext = Zeroizing::new(Self::decrypt_parts(key, nonce, ciphertext)?);

        if plaintext.len() != out.len() {
            return Err(EnvelopeError::Crypto(format!(
                "Unwrapped key has {} bytes, expected {}",
                plaintext.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&plaintext);
        Ok(())
    }
}

/// Generate a random 96-bit nonce
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generate cryptographically secure random bytes
pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
