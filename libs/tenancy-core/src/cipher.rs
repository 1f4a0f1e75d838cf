use crate::{SecretCipher, TenancyError};
use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha2::{Digest, Sha256};
use std::fmt;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
/// Truncated SHA-256 of the plaintext, sealed inside the ciphertext.
const CHECK_LEN: usize = 16;
const SEPARATOR: char = ':';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Malformed secret blob: {0}")]
    MalformedBlob(String),
    #[error("Secret blob is not valid hex")]
    InvalidHex,
    #[error("Invalid length: {0}")]
    InvalidLength(String),
    #[error("Integrity check failed (wrong key or corrupted ciphertext)")]
    IntegrityCheckFailed,
    #[error("Decrypted secret is not valid UTF-8")]
    InvalidUtf8,
    #[error("Encryption failed: {0}")]
    Encryption(String),
}

// --- Key ---

/// 256-bit key derived once from the configured secret.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    /// One-way derivation: SHA-256 of the configured secret material.
    pub fn derive(secret: &str) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        Self(key)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

// --- Blob ---

/// `hex(iv) + ':' + hex(ciphertext)`, exactly as persisted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EncryptedSecret(String);

impl EncryptedSecret {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedSecret(<{} chars>)", self.0.len())
    }
}

// --- Primitives ---

pub fn encrypt(plaintext: &str, key: &CipherKey) -> Result<EncryptedSecret, CipherError> {
    let iv: [u8; IV_LEN] = rand::random();

    let mut sealed = Vec::with_capacity(plaintext.len() + CHECK_LEN);
    sealed.extend_from_slice(plaintext.as_bytes());
    sealed.extend_from_slice(&integrity_check(plaintext.as_bytes()));

    let ciphertext = Aes256CbcEnc::new_from_slices(&key.0, &iv)
        .map_err(|e| CipherError::Encryption(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(&sealed);

    Ok(EncryptedSecret(format!(
        "{}{}{}",
        hex::encode(iv),
        SEPARATOR,
        hex::encode(ciphertext)
    )))
}

pub fn decrypt(blob: &EncryptedSecret, key: &CipherKey) -> Result<String, CipherError> {
    let (iv_hex, ciphertext_hex) = blob
        .0
        .split_once(SEPARATOR)
        .ok_or_else(|| CipherError::MalformedBlob("missing separator".into()))?;

    let iv = hex::decode(iv_hex).map_err(|_| CipherError::InvalidHex)?;
    if iv.len() != IV_LEN {
        return Err(CipherError::InvalidLength(format!(
            "iv must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }
    let ciphertext = hex::decode(ciphertext_hex).map_err(|_| CipherError::InvalidHex)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CipherError::InvalidLength(format!(
            "ciphertext must be a non-empty multiple of {} bytes, got {}",
            BLOCK_LEN,
            ciphertext.len()
        )));
    }

    let sealed = Aes256CbcDec::new_from_slices(&key.0, &iv)
        .map_err(|e| CipherError::InvalidLength(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CipherError::IntegrityCheckFailed)?;

    if sealed.len() < CHECK_LEN {
        return Err(CipherError::IntegrityCheckFailed);
    }
    let (plaintext, check) = sealed.split_at(sealed.len() - CHECK_LEN);
    if integrity_check(plaintext).as_slice() != check {
        return Err(CipherError::IntegrityCheckFailed);
    }

    String::from_utf8(plaintext.to_vec()).map_err(|_| CipherError::InvalidUtf8)
}

fn integrity_check(plaintext: &[u8]) -> [u8; CHECK_LEN] {
    let digest = Sha256::digest(plaintext);
    let mut check = [0u8; CHECK_LEN];
    check.copy_from_slice(&digest[..CHECK_LEN]);
    check
}

// --- Cipher ---

/// AES-256-CBC credential cipher bound to the process-wide key.
///
/// One key seals every tenant credential; there is no per-tenant key and no
/// rotation path. Changing the secret makes every stored blob undecryptable.
#[derive(Clone, Debug)]
pub struct CredentialCipher {
    key: CipherKey,
}

impl CredentialCipher {
    pub fn new(key: CipherKey) -> Self {
        Self { key }
    }

    pub fn from_secret(secret: &str) -> Result<Self, TenancyError> {
        if secret.trim().is_empty() {
            return Err(TenancyError::Configuration(
                "Cipher secret cannot be empty".into(),
            ));
        }
        Ok(Self::new(CipherKey::derive(secret)))
    }
}

impl SecretCipher for CredentialCipher {
    fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, CipherError> {
        encrypt(plaintext, &self.key)
    }

    fn decrypt(&self, blob: &EncryptedSecret) -> Result<String, CipherError> {
        decrypt(blob, &self.key)
    }
}
