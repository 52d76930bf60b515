//! Per-connection AES-CBC session key for fill notices.
//!
//! The key and IV arrive in-band on the fill-notice subscription response
//! and are valid for that connection only. Rotation replaces them as a
//! whole; invalid material clears the context so a stale key can never
//! decrypt a notice sent under the new one.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::DecodeError;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_LEN: usize = 16;

/// Raw key/IV pair as delivered by the broker (ASCII strings).
#[derive(Clone, PartialEq, Eq)]
pub struct CipherMaterial {
    key: String,
    iv: String,
}

impl CipherMaterial {
    pub fn new(key: impl Into<String>, iv: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            iv: iv.into(),
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if !matches!(self.key.len(), 16 | 24 | 32) {
            return Err(DecodeError::InvalidKeyMaterial(format!(
                "key length {} (expected 16, 24 or 32)",
                self.key.len()
            )));
        }
        if self.iv.len() != BLOCK_LEN {
            return Err(DecodeError::InvalidKeyMaterial(format!(
                "iv length {} (expected {BLOCK_LEN})",
                self.iv.len()
            )));
        }
        Ok(())
    }
}

// Key material never reaches logs.
impl std::fmt::Debug for CipherMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherMaterial")
            .field("key_len", &self.key.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// Session cipher state owned by one connection.
#[derive(Debug, Default)]
pub struct SessionCipherContext {
    material: Option<CipherMaterial>,
    generation: u64,
}

impl SessionCipherContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install fresh material. Returns the new generation on success; on
    /// invalid material the context is left empty.
    pub fn rotate(&mut self, material: CipherMaterial) -> Result<u64, DecodeError> {
        self.generation += 1;
        match material.validate() {
            Ok(()) => {
                self.material = Some(material);
                Ok(self.generation)
            }
            Err(err) => {
                self.material = None;
                Err(err)
            }
        }
    }

    /// Drop the key; called whenever the connection is replaced.
    pub fn clear(&mut self) {
        self.material = None;
    }

    pub fn is_ready(&self) -> bool {
        self.material.is_some()
    }

    /// Rotation counter, bumped on every rotation attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Base64-decode, AES-CBC decrypt and strip PKCS#7 padding.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String, DecodeError> {
        let material = self.material.as_ref().ok_or(DecodeError::NoSessionKey)?;
        let data = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
        if data.is_empty() || data.len() % BLOCK_LEN != 0 {
            return Err(DecodeError::BlockLength(data.len()));
        }

        let key = material.key.as_bytes();
        let iv = material.iv.as_bytes();
        let invalid_len = |_| DecodeError::InvalidKeyMaterial("key/iv length".to_string());
        let plaintext = match key.len() {
            16 => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(invalid_len)?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            24 => Aes192CbcDec::new_from_slices(key, iv)
                .map_err(invalid_len)?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            32 => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(invalid_len)?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            n => {
                return Err(DecodeError::InvalidKeyMaterial(format!("key length {n}")));
            }
        }
        .map_err(|_| DecodeError::InvalidPadding)?;

        String::from_utf8(plaintext).map_err(|_| DecodeError::InvalidUtf8)
    }
}
