//! Streaming passphrase-based file encryption.
//!
//! Output layout:
//!
//! ```text
//! salt (16 bytes) || segment_0 || segment_1 || ... || segment_n
//! ```
//!
//! Each segment is up to 64 KiB of plaintext sealed with AES-256-GCM in the
//! STREAM construction (big-endian 32-bit counter, last-segment flag), so
//! every segment is authenticated and truncation is detected. The 32-byte key
//! and 7-byte nonce prefix are derived from the passphrase and salt with
//! PBKDF2-HMAC-SHA256.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes256Gcm, Key};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, EngineResult};

pub const SALT_LEN: usize = 16;
pub const SEGMENT_LEN: usize = 64 * 1024;
pub const TAG_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 10_000;

const KEY_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = 7;

fn derive(passphrase: &str, salt: &[u8]) -> EngineResult<[u8; KEY_LEN + NONCE_PREFIX_LEN]> {
    if passphrase.trim().is_empty() {
        return Err(EngineError::EncryptionKeyUnavailable);
    }
    let mut material = [0u8; KEY_LEN + NONCE_PREFIX_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut material);
    Ok(material)
}

fn crypto_error(message: &str) -> EngineError {
    EngineError::Crypto {
        message: message.to_string(),
    }
}

/// Seals plaintext segments for one output file.
pub struct Encryptor {
    stream: Option<EncryptorBE32<Aes256Gcm>>,
    salt: [u8; SALT_LEN],
}

impl Encryptor {
    /// Derive a key for a fresh random salt.
    pub fn new(passphrase: &str) -> EngineResult<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        Self::with_salt(passphrase, salt)
    }

    pub fn with_salt(passphrase: &str, salt: [u8; SALT_LEN]) -> EngineResult<Self> {
        let material = derive(passphrase, &salt)?;
        let key = Key::<Aes256Gcm>::from_slice(&material[..KEY_LEN]);
        let nonce = GenericArray::from_slice(&material[KEY_LEN..]);
        Ok(Encryptor {
            stream: Some(EncryptorBE32::new(key, nonce)),
            salt,
        })
    }

    /// Bytes that must precede the first segment.
    pub fn header(&self) -> &[u8] {
        &self.salt
    }

    pub fn seal_next(&mut self, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        self.stream
            .as_mut()
            .ok_or_else(|| crypto_error("stream already finalized"))?
            .encrypt_next(plaintext)
            .map_err(|_| crypto_error("segment encryption failed"))
    }

    /// Seal the final segment; the encryptor is spent afterwards.
    pub fn seal_last(&mut self, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        self.stream
            .take()
            .ok_or_else(|| crypto_error("stream already finalized"))?
            .encrypt_last(plaintext)
            .map_err(|_| crypto_error("segment encryption failed"))
    }
}

/// Opens segments produced by `Encryptor`.
pub struct Decryptor {
    stream: Option<DecryptorBE32<Aes256Gcm>>,
}

impl Decryptor {
    pub fn new(passphrase: &str, salt: &[u8; SALT_LEN]) -> EngineResult<Self> {
        let material = derive(passphrase, salt)?;
        let key = Key::<Aes256Gcm>::from_slice(&material[..KEY_LEN]);
        let nonce = GenericArray::from_slice(&material[KEY_LEN..]);
        Ok(Decryptor {
            stream: Some(DecryptorBE32::new(key, nonce)),
        })
    }

    pub fn open_next(&mut self, segment: &[u8]) -> EngineResult<Vec<u8>> {
        self.stream
            .as_mut()
            .ok_or_else(|| crypto_error("stream already finalized"))?
            .decrypt_next(segment)
            .map_err(|_| crypto_error("authentication failed (wrong passphrase or corrupted data)"))
    }

    pub fn open_last(&mut self, segment: &[u8]) -> EngineResult<Vec<u8>> {
        self.stream
            .take()
            .ok_or_else(|| crypto_error("stream already finalized"))?
            .decrypt_last(segment)
            .map_err(|_| crypto_error("authentication failed (wrong passphrase or corrupted data)"))
    }
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF).
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn io_crypto(err: std::io::Error) -> EngineError {
    EngineError::Crypto {
        message: err.to_string(),
    }
}

/// Encrypt everything from `reader` into `writer`. Returns plaintext bytes consumed.
pub async fn encrypt<R, W>(reader: &mut R, writer: &mut W, passphrase: &str) -> EngineResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut encryptor = Encryptor::new(passphrase)?;
    writer.write_all(encryptor.header()).await.map_err(io_crypto)?;

    let mut total = 0u64;
    let mut current = vec![0u8; SEGMENT_LEN];
    let mut current_len = read_full(reader, &mut current).await.map_err(io_crypto)?;
    loop {
        let mut next = vec![0u8; SEGMENT_LEN];
        let next_len = read_full(reader, &mut next).await.map_err(io_crypto)?;
        total += current_len as u64;

        if next_len == 0 {
            let sealed = encryptor.seal_last(&current[..current_len])?;
            writer.write_all(&sealed).await.map_err(io_crypto)?;
            break;
        }

        let sealed = encryptor.seal_next(&current[..current_len])?;
        writer.write_all(&sealed).await.map_err(io_crypto)?;
        current = next;
        current_len = next_len;
    }

    writer.flush().await.map_err(io_crypto)?;
    Ok(total)
}

/// Reverse `encrypt`. Returns plaintext bytes written.
///
/// # Errors
/// `EngineError::Crypto` on a truncated header, wrong passphrase, or any
/// tampered or missing segment.
pub async fn decrypt<R, W>(reader: &mut R, writer: &mut W, passphrase: &str) -> EngineResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut salt = [0u8; SALT_LEN];
    if read_full(reader, &mut salt).await.map_err(io_crypto)? != SALT_LEN {
        return Err(crypto_error("truncated header"));
    }
    let mut decryptor = Decryptor::new(passphrase, &salt)?;

    let segment_len = SEGMENT_LEN + TAG_LEN;
    let mut total = 0u64;
    let mut current = vec![0u8; segment_len];
    let mut current_len = read_full(reader, &mut current).await.map_err(io_crypto)?;
    if current_len == 0 {
        return Err(crypto_error("missing final segment"));
    }

    loop {
        let mut next = vec![0u8; segment_len];
        let next_len = read_full(reader, &mut next).await.map_err(io_crypto)?;

        let plain = if next_len == 0 {
            decryptor.open_last(&current[..current_len])?
        } else {
            decryptor.open_next(&current[..current_len])?
        };
        writer.write_all(&plain).await.map_err(io_crypto)?;
        total += plain.len() as u64;

        if next_len == 0 {
            break;
        }
        current = next;
        current_len = next_len;
    }

    writer.flush().await.map_err(io_crypto)?;
    Ok(total)
}
