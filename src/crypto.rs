//! Digests, key derivation, and the bulk cipher.
//!
//! Content digest: SHA-1 over the plaintext, uncompressed chunk; the
//! dedup key when crypto is off.
//!
//! Stored digest (csha): SHA-1 over the compressed-then-encrypted
//! chunk.  The server recomputes it from the bytes it receives, so it
//! doubles as the storage key and the transfer check.  Encryption is
//! deterministic under a fixed key and derived IV, so identical chunks
//! still dedup.
//!
//! Key derivation: HKDF-SHA512(crypto_secret) expanded into the bulk
//! cipher key.
//!
//! Bulk cipher: AES-256-CBC with PKCS7 padding.  The 16-byte IV is
//! derived from the chunk index (file-local for file chunks,
//! manifest-global for metadata transfers) and recorded per digest entry
//! in the manifest, so extract can reproduce it.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use sha1::{Digest as _, Sha1};
use sha2::Sha512;
use thiserror::Error;

pub const DIGEST_LEN: usize = 20;
pub const IV_LEN:     usize = 16;
pub const KEY_LEN:    usize = 32;

pub type Digest = [u8; DIGEST_LEN];
pub type Iv     = [u8; IV_LEN];

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const HKDF_SALT:     &[u8] = b"chunkvault.v2.keys";
const INFO_BULK_KEY: &[u8] = b"bulk-cipher";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("decryption failed, wrong secret or corrupted chunk")]
    DecryptFailed,
    #[error("key derivation failed")]
    KeyDerivation,
}

// ── Digests ──────────────────────────────────────────────────────────────────

/// SHA-1 of one buffer.
pub fn sha1(data: &[u8]) -> Digest {
    let mut h = Sha1::new();
    h.update(data);
    h.finalize().into()
}

/// Incremental SHA-1, one per file, fed chunk by chunk as the reader
/// stage consumes the file.
#[derive(Clone)]
pub struct Sha1Ctx(Sha1);

impl Sha1Ctx {
    pub fn new() -> Self {
        Sha1Ctx(Sha1::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        self.0.finalize().into()
    }
}

impl Default for Sha1Ctx {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase hex of a digest (diagnostics and `list -vvv` output).
pub fn digest_hex(d: &Digest) -> String {
    hex::encode(d)
}

/// SHA-512 hex of the account password, the LOGIN payload.
pub fn login_hash(password: &str) -> String {
    let mut h = Sha512::new();
    h.update(password.as_bytes());
    hex::encode(h.finalize())
}

// ── Keys ─────────────────────────────────────────────────────────────────────

/// The bulk-cipher key derived from `crypto_secret`.
#[derive(Clone)]
pub struct Keys {
    bulk: [u8; KEY_LEN],
}

impl Keys {
    pub fn derive(secret: &[u8]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha512>::new(Some(HKDF_SALT), secret);
        let mut bulk = [0u8; KEY_LEN];
        hk.expand(INFO_BULK_KEY, &mut bulk)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Keys { bulk })
    }

    pub fn encrypt(&self, iv: &Iv, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.bulk.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Aes256CbcDec::new(&self.bulk.into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

// ── IV derivation ────────────────────────────────────────────────────────────

/// Deterministic IV for chunk `index`: the little-endian index in both
/// halves of the 16-byte block.  For file chunks `index` is file-local;
/// for metadata transfers it is the manifest-global block number.
pub fn iv_for_chunk(index: u64) -> Iv {
    let mut iv = [0u8; IV_LEN];
    iv[0..8].copy_from_slice(&index.to_le_bytes());
    iv[8..16].copy_from_slice(&index.to_le_bytes());
    iv
}

// ── Tests ────────────────────────────────────────────────────────────────────
