//! Streaming container format
//!
//! ```text
//! magic(4) "ENV1"
//! u8  kek_name_len      | kek_name (UTF-8)
//! u8  dek_nonce_len     | dek_nonce
//! u16 encrypted_dek_len | encrypted_dek   (big-endian length)
//! u8  data_nonce_len    | data_nonce
//! AES-256-GCM ciphertext of the body, 16-byte tag at the very end
//! ```
//!
//! The body is one continuous GCM stream, so its tag can only be checked
//! after the last byte. Plaintext written by `decode` before that point is
//! provisional and must be discarded if `decode` returns an error.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::crypto::{DEK_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::envelope::EnvelopeEncryption;
use crate::error::{EnvelopeError, Result};
use crate::gcm_stream::{GcmDecryptor, GcmEncryptor};
use crate::key_registry::KeyRegistry;

/// Leading bytes of every container
pub const STREAM_MAGIC: [u8; 4] = *b"ENV1";

/// Body read size
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

const MAX_SHORT_FIELD: usize = u8::MAX as usize;
const MAX_WRAPPED_DEK: usize = u16::MAX as usize;

/// Everything in front of the encrypted body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub kek_name: String,
    pub dek_nonce: Vec<u8>,
    pub encrypted_dek: Vec<u8>,
    pub data_nonce: Vec<u8>,
}

impl StreamHeader {
    /// Check every field fits its length prefix.
    pub fn validate(&self) -> Result<()> {
        check_len("KEK name", self.kek_name.len(), MAX_SHORT_FIELD)?;
        check_len("DEK nonce", self.dek_nonce.len(), MAX_SHORT_FIELD)?;
        check_len("wrapped DEK", self.encrypted_dek.len(), MAX_WRAPPED_DEK)?;
        check_len("data nonce", self.data_nonce.len(), MAX_SHORT_FIELD)
    }

    pub fn encoded_len(&self) -> usize {
        STREAM_MAGIC.len()
            + 1 + self.kek_name.len()
            + 1 + self.dek_nonce.len()
            + 2 + self.encrypted_dek.len()
            + 1 + self.data_nonce.len()
    }

    /// Serialize, validating first so nothing partial is ever produced.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&STREAM_MAGIC);
        out.push(self.kek_name.len() as u8);
        out.extend_from_slice(self.kek_name.as_bytes());
        out.push(self.dek_nonce.len() as u8);
        out.extend_from_slice(&self.dek_nonce);
        out.extend_from_slice(&(self.encrypted_dek.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.encrypted_dek);
        out.push(self.data_nonce.len() as u8);
        out.extend_from_slice(&self.data_nonce);
        Ok(out)
    }

    /// Parse a header, leaving `reader` positioned at the first body byte.
    ///
    /// [`EnvelopeError::TruncatedHeader`] if the input ends early,
    /// [`EnvelopeError::BadMagic`] if it is not a container at all.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_header_bytes(reader, &mut magic)?;
        if magic != STREAM_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }

        let kek_name = read_u8_prefixed(reader)?;
        let dek_nonce = read_u8_prefixed(reader)?;

        let mut len = [0u8; 2];
        read_header_bytes(reader, &mut len)?;
        let mut encrypted_dek = vec![0u8; u16::from_be_bytes(len) as usize];
        read_header_bytes(reader, &mut encrypted_dek)?;

        let data_nonce = read_u8_prefixed(reader)?;

        // A name that is not UTF-8 can never match a loaded KEK
        let kek_name = String::from_utf8(kek_name)
            .map_err(|_| EnvelopeError::KeyNotFound("KEK name is not valid UTF-8".into()))?;

        Ok(Self {
            kek_name,
            dek_nonce,
            encrypted_dek,
            data_nonce,
        })
    }
}

fn check_len(field: &str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(EnvelopeError::InvalidArgument(format!(
            "{} is {} bytes, container allows at most {}",
            field, len, max
        )));
    }
    Ok(())
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => EnvelopeError::TruncatedHeader,
        _ => EnvelopeError::Io(e),
    })
}

fn read_u8_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 1];
    read_header_bytes(reader, &mut len)?;
    let mut field = vec![0u8; len[0] as usize];
    read_header_bytes(reader, &mut field)?;
    Ok(field)
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Encodes and decodes streaming containers.
///
/// Reader and writer are taken by value and dropped on every exit path;
/// pass `&mut` references to keep using them afterwards.
#[derive(Clone)]
pub struct StreamingCodec {
    envelope: EnvelopeEncryption,
}

impl StreamingCodec {
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self {
            envelope: EnvelopeEncryption::new(registry),
        }
    }

    /// Encrypt `input` into a container on `output`. Returns body bytes read.
    pub fn encode<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<u64> {
        let bundle = self.envelope.prepare_stream_key()?;
        let header = StreamHeader {
            kek_name: bundle.kek_name.clone(),
            dek_nonce: bundle.dek_nonce.clone(),
            encrypted_dek: bundle.encrypted_dek.clone(),
            data_nonce: bundle.data_nonce.to_vec(),
        }
        .to_bytes()?;

        let mut encryptor = GcmEncryptor::new(bundle.dek().as_bytes(), &bundle.data_nonce)?;
        drop(bundle);

        output.write_all(&header)?;

        let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = read_some(&mut input, &mut buf)?;
            if n == 0 {
                break;
            }
            encryptor.update(&mut buf[..n])?;
            output.write_all(&buf[..n])?;
            total += n as u64;
        }

        output.write_all(&encryptor.finish())?;
        output.flush()?;

        tracing::debug!(bytes = total, "stream container encoded");
        Ok(total)
    }

    /// Decrypt a container from `input` onto `output`. Returns body bytes written.
    pub fn decode<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64> {
        let mut scratch = [0u8; DEK_SIZE];
        self.decode_with_scratch(input, output, &mut scratch)
    }

    /// Like [`StreamingCodec::decode`], recovering the DEK into `scratch`,
    /// which is zeroed before the body is read.
    pub fn decode_with_scratch<R: Read, W: Write>(
        &self,
        mut input: R,
        mut output: W,
        scratch: &mut [u8; DEK_SIZE],
    ) -> Result<u64> {
        let header = StreamHeader::read_from(&mut input)?;

        let mut decryptor = {
            let dek = self.envelope.unwrap_dek(
                &header.kek_name,
                &header.dek_nonce,
                &header.encrypted_dek,
                scratch,
            )?;
            if header.data_nonce.len() != NONCE_SIZE {
                return Err(EnvelopeError::AuthenticationFailure);
            }
            GcmDecryptor::new(&dek, &header.data_nonce)?
        };

        // The last TAG_SIZE bytes seen so far may be the tag; hold them back.
        let mut buf = vec![0u8; STREAM_BUFFER_SIZE + TAG_SIZE];
        let mut held = 0usize;
        let mut total = 0u64;
        loop {
            let n = read_some(&mut input, &mut buf[held..])?;
            if n == 0 {
                break;
            }
            let filled = held + n;
            if filled <= TAG_SIZE {
                held = filled;
                continue;
            }

            let body = filled - TAG_SIZE;
            decryptor.update(&mut buf[..body])?;
            output.write_all(&buf[..body])?;
            total += body as u64;

            buf.copy_within(body..filled, 0);
            held = TAG_SIZE;
        }

        if let Err(err) = decryptor.verify(&buf[..held]) {
            tracing::warn!(
                kek = %header.kek_name,
                provisional_bytes = total,
                "stream container failed authentication"
            );
            return Err(err);
        }
        output.flush()?;

        tracing::debug!(kek = %header.kek_name, bytes = total, "stream container decoded");
        Ok(total)
    }

    /// Decode fully in memory; bytes are returned only after the tag checks out.
    pub fn decode_to_vec<R: Read>(&self, input: R) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.decode(input, &mut out)?;
        Ok(out)
    }

    /// Encode `src` into `dst`. `dst` is removed if encoding fails.
    pub fn encode_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        self.encode_to_path(BufReader::new(File::open(src)?), dst)
    }

    /// Decode `src` into `dst`. Provisional output is removed if decoding fails.
    pub fn decode_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        self.decode_to_path(BufReader::new(File::open(src)?), dst)
    }

    /// Encode any reader into the file at `dst`, removing it on failure.
    pub fn encode_to_path<R: Read>(&self, input: R, dst: &Path) -> Result<u64> {
        let output = BufWriter::new(File::create(dst)?);
        self.encode(input, output).inspect_err(|_| discard(dst))
    }

    /// Decode any reader into the file at `dst`.
    ///
    /// Plaintext is written before the tag is checked, so the file is
    /// removed whenever decoding fails.
    pub fn decode_to_path<R: Read>(&self, input: R, dst: &Path) -> Result<u64> {
        let output = BufWriter::new(File::create(dst)?);
        self.decode(input, output).inspect_err(|_| discard(dst))
    }
}

impl From<EnvelopeEncryption> for StreamingCodec {
    fn from(envelope: EnvelopeEncryption) -> Self {
        Self { envelope }
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
    }
}
