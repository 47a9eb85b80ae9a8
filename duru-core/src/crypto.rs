//! Cryptography primitives for account keys and content encryption
//!
//! Provides AES-256-GCM encryption with Argon2id key derivation.
//! Content blobs use a self-describing envelope:
//! `[scheme tag][12-byte nonce][ciphertext + tag]`, so every stored
//! ciphertext records which key scheme produced it.

use crate::config::{
    DEFAULT_KDF_ITERATIONS, DEFAULT_KDF_MEMORY_KIB, DEFAULT_KDF_PARALLELISM, KEY_SIZE, NONCE_SIZE,
    SALT_SIZE,
};
use crate::error::{AppError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Argon2id cost parameters, stored alongside every wrapped key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_KDF_MEMORY_KIB,
            iterations: DEFAULT_KDF_ITERATIONS,
            parallelism: DEFAULT_KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Cheap parameters so tests do not spend seconds per derivation
    pub fn for_test() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// 256-bit symmetric key, wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Generate a fresh key from the OS CSPRNG
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(AppError::Crypto("Invalid key length".to_string()));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Fill `buf` from the OS CSPRNG
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|_| AppError::KeyProvisioning("Secure randomness unavailable".to_string()))
}

/// Fresh random salt for the passphrase KDF
pub fn generate_salt() -> Result<Vec<u8>> {
    let mut salt = vec![0u8; SALT_SIZE];
    fill_random(&mut salt)?;
    Ok(salt)
}

/// Derive a 256-bit wrapping key from a passphrase using Argon2id.
///
/// This is deliberately slow; async callers run it on the blocking pool.
pub fn derive_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<SecretKey> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|_| AppError::Crypto("Invalid KDF parameters".to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|_| AppError::Crypto("Key derivation failed".to_string()))?;

    let key = SecretKey(output);
    output.zeroize();
    Ok(key)
}

/// Encrypt with AES-256-GCM, returning `(nonce, ciphertext)`
pub fn encrypt_with_key(key: &SecretKey, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| AppError::Crypto("Cipher initialization failed".to_string()))?;

    let mut nonce_bytes = vec![0u8; NONCE_SIZE];
    fill_random(&mut nonce_bytes)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| AppError::Crypto("Encryption failed".to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt AES-256-GCM output; fails on any authentication tag mismatch
pub fn decrypt_with_key(key: &SecretKey, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(AppError::Crypto("Invalid nonce length".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| AppError::Crypto("Cipher initialization failed".to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| AppError::Crypto("Decryption failed".to_string()))
}

/// Seal plaintext into a scheme-tagged envelope
pub fn seal(key: &SecretKey, scheme: u8, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let (nonce, ciphertext) = encrypt_with_key(key, plaintext, aad)?;

    let mut blob = Vec::with_capacity(1 + nonce.len() + ciphertext.len());
    blob.push(scheme);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open an envelope produced by [`seal`]. The caller picks the key by
/// looking at [`scheme_of`] first.
pub fn open(key: &SecretKey, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < 1 + NONCE_SIZE {
        return Err(AppError::Crypto("Ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = blob[1..].split_at(NONCE_SIZE);
    decrypt_with_key(key, nonce, ciphertext, aad)
}

/// Scheme tag of an envelope, if it has one
pub fn scheme_of(blob: &[u8]) -> Option<u8> {
    blob.first().copied()
}

/// Keyed SHA-256 digest, hex encoded. Used where equality must be
/// checkable without storing plaintext (tag labels, task lines).
pub fn keyed_digest(key: &SecretKey, domain: &str, data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
