//! Payload encryption.
//!
//! AES-256-CBC with PKCS#7 padding. The key is the first 32 bytes of the
//! lowercase hex SHA-256 digest of the passphrase. With a random IV the
//! 16 IV bytes prefix the ciphertext; otherwise a constant IV is used.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;
const CONSTANT_IV: &[u8; IV_LEN] = b"0123456789012345";

/// Capability used by publish, history and the subscribe loop when a cipher
/// key is configured.
pub trait EncryptionProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
    fn uses_random_iv(&self) -> bool;
}

/// Legacy-compatible AES-256-CBC cipher.
#[derive(Clone)]
pub struct AesCbcCipher {
    key: [u8; 32],
    random_iv: bool,
}

impl AesCbcCipher {
    pub fn new(passphrase: &str, random_iv: bool) -> Self {
        Self {
            key: derive_key(passphrase),
            random_iv,
        }
    }
}

impl std::fmt::Debug for AesCbcCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCbcCipher")
            .field("random_iv", &self.random_iv)
            .finish_non_exhaustive()
    }
}

fn derive_key(passphrase: &str) -> [u8; 32] {
    let digest = Sha256::digest(passphrase.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let mut key = [0u8; 32];
    for (dst, src) in key.iter_mut().zip(hex.bytes()) {
        *dst = src;
    }
    key
}

impl EncryptionProvider for AesCbcCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = *CONSTANT_IV;
        if self.random_iv {
            rand::rng().fill_bytes(&mut iv);
        }
        let enc = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?;
        let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        if self.random_iv {
            let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        } else {
            Ok(ciphertext)
        }
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (iv, body) = if self.random_iv {
            if ciphertext.len() < IV_LEN {
                return Err(Error::Crypto("ciphertext shorter than IV".into()));
            }
            ciphertext.split_at(IV_LEN)
        } else {
            (CONSTANT_IV.as_slice(), ciphertext)
        };
        let dec = Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|e| Error::Crypto(format!("decrypt: {e}")))
    }

    fn uses_random_iv(&self) -> bool {
        self.random_iv
    }
}

// ---------------------------------------------------------------------------
// JSON payload helpers
// ---------------------------------------------------------------------------

/// Encrypt a JSON payload into a base64 JSON string.
pub(crate) fn encrypt_value(
    cipher: &dyn EncryptionProvider,
    value: &serde_json::Value,
) -> Result<serde_json::Value> {
    let plain = serde_json::to_vec(value).map_err(|e| Error::Crypto(format!("encode: {e}")))?;
    let encrypted = cipher.encrypt(&plain)?;
    Ok(serde_json::Value::String(BASE64.encode(encrypted)))
}

/// Decrypt a base64 JSON string back into JSON. Plaintext that is not JSON
/// is returned as a string.
pub(crate) fn decrypt_value(
    cipher: &dyn EncryptionProvider,
    value: &serde_json::Value,
) -> Result<serde_json::Value> {
    let serde_json::Value::String(encoded) = value else {
        return Err(Error::Crypto("encrypted payload must be a string".into()));
    };
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| Error::Crypto(format!("base64: {e}")))?;
    let plain = cipher.decrypt(&raw)?;
    match serde_json::from_slice(&plain) {
        Ok(v) => Ok(v),
        Err(_) => String::from_utf8(plain)
            .map(serde_json::Value::String)
            .map_err(|e| Error::Crypto(format!("plaintext is not utf-8: {e}"))),
    }
}
