//! Incremental AES-256-GCM
//!
//! Assembled from the same parts `aes-gcm` uses internally (AES block
//! cipher, 32-bit big-endian CTR, GHASH) so that a body of any size can be
//! pushed through in pieces. The wire result is exactly what single-shot
//! AES-GCM produces for the same key and nonce: `ciphertext || tag`, with
//! one tag over the whole stream and no associated data.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::{Block, GHash};

use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{WipeOnDrop, AES_256_KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{EnvelopeError, Result};

type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

const BLOCK_SIZE: usize = 16;

/// NIST SP 800-38D bound on plaintext per (key, nonce): 2^39 - 256 bits.
pub const GCM_MAX_MESSAGE_LEN: u64 = (1 << 36) - 32;

fn init(key: &[u8], nonce: &[u8]) -> Result<(Aes256Ctr32, Authenticator)> {
    if key.len() != AES_256_KEY_SIZE {
        return Err(EnvelopeError::Crypto(format!(
            "Invalid key size: expected {}, got {}",
            AES_256_KEY_SIZE,
            key.len()
        )));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(EnvelopeError::InvalidArgument(format!(
            "streaming GCM needs a {}-byte nonce, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }

    let cipher = Aes256::new_from_slice(key)
        .map_err(|e| EnvelopeError::Crypto(format!("Cipher init error: {}", e)))?;
    let ghash = hash_subkey(&cipher, &mut [0u8; BLOCK_SIZE]);

    // J0 = nonce || 0^31 || 1
    let mut j0 = [0u8; BLOCK_SIZE];
    j0[..NONCE_SIZE].copy_from_slice(nonce);
    j0[BLOCK_SIZE - 1] = 1;

    let mut ctr = Aes256Ctr32::new_from_slices(key, &j0)
        .map_err(|e| EnvelopeError::Crypto(format!("Cipher init error: {}", e)))?;

    // First keystream block is E(K, J0), the tag mask; payload starts at counter 2.
    let mut tag_mask = Zeroizing::new([0u8; TAG_SIZE]);
    ctr.apply_keystream(&mut tag_mask[..]);

    Ok((ctr, Authenticator::new(ghash, tag_mask)))
}

/// GHASH keyed with H = E(K, 0^128). The raw subkey is computed in
/// `scratch`, which is zeroed before returning.
fn hash_subkey(cipher: &Aes256, scratch: &mut [u8; BLOCK_SIZE]) -> GHash {
    let mut h = WipeOnDrop::new(scratch);
    h.fill(0);
    cipher.encrypt_block(Block::from_mut_slice(&mut h));
    GHash::new(Block::from_slice(&h))
}

/// GHASH over the ciphertext, fed in arbitrary slices.
struct Authenticator {
    ghash: GHash,
    tag_mask: Zeroizing<[u8; TAG_SIZE]>,
    partial: [u8; BLOCK_SIZE],
    partial_len: usize,
    message_len: u64,
}

impl Authenticator {
    fn new(ghash: GHash, tag_mask: Zeroizing<[u8; TAG_SIZE]>) -> Self {
        Self {
            ghash,
            tag_mask,
            partial: [0u8; BLOCK_SIZE],
            partial_len: 0,
            message_len: 0,
        }
    }

    fn reserve(&mut self, len: usize) -> Result<()> {
        let total = self.message_len.saturating_add(len as u64);
        if total > GCM_MAX_MESSAGE_LEN {
            return Err(EnvelopeError::InvalidArgument(
                "stream exceeds the AES-GCM per-nonce length limit".into(),
            ));
        }
        self.message_len = total;
        Ok(())
    }

    fn absorb(&mut self, mut data: &[u8]) {
        if self.partial_len > 0 {
            let take = (BLOCK_SIZE - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < BLOCK_SIZE {
                return;
            }
            self.ghash.update(&[Block::clone_from_slice(&self.partial)]);
            self.partial_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            self.ghash.update(&[Block::clone_from_slice(block)]);
        }

        let rest = blocks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    /// Pads the trailing partial block and appends the length block.
    fn close(mut self) -> (GHash, Zeroizing<[u8; TAG_SIZE]>) {
        if self.partial_len > 0 {
            self.ghash.update_padded(&self.partial[..self.partial_len]);
        }

        // len(A) = 0 bits, len(C) in bits
        let mut lengths = Block::default();
        lengths[8..].copy_from_slice(&(self.message_len * 8).to_be_bytes());
        self.ghash.update(&[lengths]);

        (self.ghash, self.tag_mask)
    }
}

fn keystream_exhausted() -> EnvelopeError {
    EnvelopeError::InvalidArgument("stream exceeds the AES-GCM counter space".into())
}

/// Streaming AES-256-GCM encryptor. Consumed by [`GcmEncryptor::finish`].
pub struct GcmEncryptor {
    ctr: Aes256Ctr32,
    auth: Authenticator,
}

impl GcmEncryptor {
    pub fn new(key: &[u8], nonce: &[u8]) -> Result<Self> {
        let (ctr, auth) = init(key, nonce)?;
        Ok(Self { ctr, auth })
    }

    /// Encrypt `buf` in place.
    pub fn update(&mut self, buf: &mut [u8]) -> Result<()> {
        self.auth.reserve(buf.len())?;
        self.ctr.try_apply_keystream(buf).map_err(|_| keystream_exhausted())?;
        self.auth.absorb(buf);
        Ok(())
    }

    /// Authentication tag to append after the last ciphertext byte.
    pub fn finish(self) -> [u8; TAG_SIZE] {
        let (ghash, mask) = self.auth.close();
        let mut digest = ghash.finalize();

        let mut tag = [0u8; TAG_SIZE];
        for (t, (d, m)) in tag.iter_mut().zip(digest.iter().zip(mask.iter())) {
            *t = d ^ m;
        }
        digest.as_mut_slice().zeroize();
        tag
    }
}

/// Streaming AES-256-GCM decryptor.
///
/// Plaintext produced by [`GcmDecryptor::update`] is unauthenticated until
/// [`GcmDecryptor::verify`] succeeds.
pub struct GcmDecryptor {
    ctr: Aes256Ctr32,
    auth: Authenticator,
}

impl GcmDecryptor {
    pub fn new(key: &[u8], nonce: &[u8]) -> Result<Self> {
        let (ctr, auth) = init(key, nonce)?;
        Ok(Self { ctr, auth })
    }

    /// Decrypt `buf` in place.
    pub fn update(&mut self, buf: &mut [u8]) -> Result<()> {
        self.auth.reserve(buf.len())?;
        self.auth.absorb(buf);
        self.ctr.try_apply_keystream(buf).map_err(|_| keystream_exhausted())
    }

    /// Constant-time check of the trailing tag.
    pub fn verify(self, tag: &[u8]) -> Result<()> {
        if tag.len() != TAG_SIZE {
            return Err(EnvelopeError::AuthenticationFailure);
        }

        let (ghash, mask) = self.auth.close();
        let mut expected = Block::clone_from_slice(tag);
        for (e, m) in expected.iter_mut().zip(mask.iter()) {
            *e ^= m;
        }

        let verdict = ghash.verify(&expected);
        expected.as_mut_slice().zeroize();
        verdict.map_err(|_| EnvelopeError::AuthenticationFailure)
    }
}
