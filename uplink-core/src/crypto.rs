//! Cryptographic primitives for the uplink
//!
//! Provides:
//! - Blake3 content hashing (piece integrity)
//! - Root key handling, per-segment key derivation and random key salts
//! - Block ciphers: AES-256-GCM and XChaCha20-Poly1305 ("secret box")
//! - Passphrase-based root key derivation using Argon2

use crate::error::{Result, UplinkError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Symmetric key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (12 bytes / 96 bits)
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits)
pub const SECRETBOX_NONCE_SIZE: usize = 24;

/// Authentication tag size, identical for both ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

const STREAM_KEY_CONTEXT: &str = "uplink 2019-04-01 stream content key";
const SEGMENT_KEY_CONTEXT: &str = "uplink 2019-04-01 segment content key";
const SALTED_KEY_CONTEXT: &str = "uplink 2019-04-01 salted segment content key";

/// Blake3 hash wrapper for content addressing
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// Compute Blake3 hash of data using multiple threads (for large data)
    pub fn compute_parallel(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        Self(hasher.finalize())
    }

    /// Wrap a finished streaming hash
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        Self(hasher.finalize())
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        let computed = Self::compute(data);
        self == &computed
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid hash length"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(blake3::Hash::from_bytes(arr)))
    }
}

/// 256-bit symmetric key (root key or derived content key)
#[derive(Clone)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Generate a new random key
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(UplinkError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    /// Derive a root key from a passphrase using Argon2
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> Result<Self> {
        use argon2::password_hash::SaltString;
        use argon2::{Argon2, PasswordHasher};

        // Salt string must be base64-encoded
        let salt_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, salt);
        let salt_string = SaltString::from_b64(&salt_b64)
            .map_err(|e| UplinkError::Encryption(e.to_string()))?;

        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(passphrase, &salt_string)
            .map_err(|e| UplinkError::Encryption(e.to_string()))?;

        let hash_bytes = password_hash
            .hash
            .ok_or_else(|| UplinkError::Encryption("No hash output".to_string()))?;

        Self::from_slice(hash_bytes.as_bytes())
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key([REDACTED])")
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Derive the content key of a stream from the root key and its path
pub fn derive_stream_key(root: &Key, stream_path: &str) -> Key {
    let mut hasher = blake3::Hasher::new_derive_key(STREAM_KEY_CONTEXT);
    hasher.update(root.as_bytes());
    hasher.update(stream_path.as_bytes());
    Key(*hasher.finalize().as_bytes())
}

/// Derive the key of one segment position.
///
/// The content key is this key mixed with the segment's [`KeySalt`], so block
/// nonces only need to be unique within a segment.
pub fn derive_segment_key(root: &Key, stream_path: &str, segment_index: u32) -> Key {
    let stream_key = derive_stream_key(root, stream_path);
    let mut hasher = blake3::Hasher::new_derive_key(SEGMENT_KEY_CONTEXT);
    hasher.update(stream_key.as_bytes());
    hasher.update(&segment_index.to_le_bytes());
    Key(*hasher.finalize().as_bytes())
}

/// Random salt drawn for every segment upload.
///
/// Stored in the segment's pointer and mixed into its content key, so
/// re-uploading the same path never reuses a (key, nonce) pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySalt([u8; KEY_SIZE]);

impl KeySalt {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Content key actually used to seal the segment's blocks
    pub fn content_key(&self, segment_key: &Key) -> Key {
        let mut hasher = blake3::Hasher::new_derive_key(SALTED_KEY_CONTEXT);
        hasher.update(segment_key.as_bytes());
        hasher.update(&self.0);
        Key(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for KeySalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySalt({})", &bs58::encode(&self.0[..8]).into_string())
    }
}

/// Supported content ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherKind {
    /// AES-256-GCM
    AesGcm,
    /// XChaCha20-Poly1305 secret box
    SecretBox,
}

impl CipherKind {
    /// Numeric code used in configuration (1=AES-GCM, 2=SecretBox)
    pub fn code(&self) -> u8 {
        match self {
            CipherKind::AesGcm => 1,
            CipherKind::SecretBox => 2,
        }
    }
}

impl TryFrom<u8> for CipherKind {
    type Error = UplinkError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(CipherKind::AesGcm),
            2 => Ok(CipherKind::SecretBox),
            other => Err(UplinkError::Configuration(format!(
                "unknown cipher code {} (1=AES-GCM, 2=SecretBox)",
                other
            ))),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::AesGcm => write!(f, "aes-gcm"),
            CipherKind::SecretBox => write!(f, "secretbox"),
        }
    }
}

/// Cipher kind plus plaintext block size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionScheme {
    pub cipher: CipherKind,
    pub block_size: usize,
}

impl EncryptionScheme {
    pub fn new(cipher: CipherKind, block_size: usize) -> Result<Self> {
        let scheme = Self { cipher, block_size };
        scheme.validate()?;
        Ok(scheme)
    }

    /// Fields are public, so schemes from callers or decoded records are
    /// checked again before use
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(UplinkError::Configuration(
                "encryption block_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Size of one full ciphertext block
    pub fn encrypted_block_size(&self) -> usize {
        self.block_size + TAG_SIZE
    }

    /// Number of blocks a plaintext of `plain_len` bytes encrypts to.
    /// An empty plaintext still produces one tag-only block.
    pub fn block_count(&self, plain_len: u64) -> u64 {
        plain_len.div_ceil(self.block_size as u64).max(1)
    }

    /// Ciphertext length for a plaintext of `plain_len` bytes
    pub fn encrypted_size(&self, plain_len: u64) -> u64 {
        plain_len + self.block_count(plain_len) * TAG_SIZE as u64
    }
}

/// Authenticated block cipher keyed for one segment
pub enum BlockCipher {
    AesGcm(Box<Aes256Gcm>),
    SecretBox(Box<XChaCha20Poly1305>),
}

impl BlockCipher {
    /// Create a cipher of the given kind (validates key length)
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(UplinkError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        let cipher = match kind {
            CipherKind::AesGcm => BlockCipher::AesGcm(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| UplinkError::Encryption(e.to_string()))?,
            )),
            CipherKind::SecretBox => BlockCipher::SecretBox(Box::new(
                XChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| UplinkError::Encryption(e.to_string()))?,
            )),
        };
        Ok(cipher)
    }

    pub fn kind(&self) -> CipherKind {
        match self {
            BlockCipher::AesGcm(_) => CipherKind::AesGcm,
            BlockCipher::SecretBox(_) => CipherKind::SecretBox,
        }
    }

    /// Nonce length of the cipher
    pub fn nonce_size(&self) -> usize {
        match self {
            BlockCipher::AesGcm(_) => AES_GCM_NONCE_SIZE,
            BlockCipher::SecretBox(_) => SECRETBOX_NONCE_SIZE,
        }
    }

    /// Encrypt with a caller-chosen nonce of [`Self::nonce_size`] bytes
    pub(crate) fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != self.nonce_size() {
            return Err(UplinkError::Encryption(format!(
                "nonce must be {} bytes, got {}",
                self.nonce_size(),
                nonce.len()
            )));
        }
        let result = match self {
            BlockCipher::AesGcm(cipher) => cipher.encrypt(Nonce::from_slice(nonce), plaintext),
            BlockCipher::SecretBox(cipher) => cipher.encrypt(XNonce::from_slice(nonce), plaintext),
        };
        result.map_err(|e| UplinkError::Encryption(e.to_string()))
    }

    /// Decrypt what [`Self::seal`] produced
    pub(crate) fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != self.nonce_size() || ciphertext.len() < TAG_SIZE {
            return Err(UplinkError::Decryption(
                "sealed value has a bad nonce or is too short".to_string(),
            ));
        }
        let result = match self {
            BlockCipher::AesGcm(cipher) => cipher.decrypt(Nonce::from_slice(nonce), ciphertext),
            BlockCipher::SecretBox(cipher) => cipher.decrypt(XNonce::from_slice(nonce), ciphertext),
        };
        result.map_err(|_| UplinkError::Decryption("authentication failed".to_string()))
    }

    /// Encrypt one block; the nonce is derived from `block_index`
    pub fn encrypt_block(&self, block_index: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let result = match self {
            BlockCipher::AesGcm(cipher) => {
                let nonce = aes_gcm_nonce(block_index);
                cipher.encrypt(Nonce::from_slice(&nonce), plaintext)
            }
            BlockCipher::SecretBox(cipher) => {
                let nonce = secretbox_nonce(block_index);
                cipher.encrypt(XNonce::from_slice(&nonce), plaintext)
            }
        };
        result.map_err(|e| UplinkError::Encryption(e.to_string()))
    }

    /// Decrypt and authenticate one block
    pub fn decrypt_block(&self, block_index: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(UplinkError::Decryption(format!(
                "block {} too short for authentication tag",
                block_index
            )));
        }
        let result = match self {
            BlockCipher::AesGcm(cipher) => {
                let nonce = aes_gcm_nonce(block_index);
                cipher.decrypt(Nonce::from_slice(&nonce), ciphertext)
            }
            BlockCipher::SecretBox(cipher) => {
                let nonce = secretbox_nonce(block_index);
                cipher.decrypt(XNonce::from_slice(&nonce), ciphertext)
            }
        };
        result.map_err(|_| {
            UplinkError::Decryption(format!("authentication failed for block {}", block_index))
        })
    }
}

impl fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockCipher({})", self.kind())
    }
}

/// Encrypt a single block with a raw key
pub fn encrypt_block(
    key: &[u8],
    kind: CipherKind,
    block_index: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    BlockCipher::new(kind, key)?.encrypt_block(block_index, plaintext)
}

/// Decrypt a single block with a raw key
pub fn decrypt_block(
    key: &[u8],
    kind: CipherKind,
    block_index: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    BlockCipher::new(kind, key)?.decrypt_block(block_index, ciphertext)
}

fn aes_gcm_nonce(block_index: u64) -> [u8; AES_GCM_NONCE_SIZE] {
    let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
    nonce[..8].copy_from_slice(&block_index.to_le_bytes());
    nonce
}

fn secretbox_nonce(block_index: u64) -> [u8; SECRETBOX_NONCE_SIZE] {
    let mut nonce = [0u8; SECRETBOX_NONCE_SIZE];
    nonce[..8].copy_from_slice(&block_index.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let data = b"hello world";
        let hash = ContentHash::compute(data);

        assert_eq!(hash, ContentHash::compute(data));
        assert_ne!(hash, ContentHash::compute(b"different data"));

        assert!(hash.verify(data));
        assert!(!hash.verify(b"wrong data"));
    }

    #[test]
    fn test_content_hash_parallel() {
        let data = vec![0u8; 1024 * 1024];
        assert_eq!(
            ContentHash::compute(&data),
            ContentHash::compute_parallel(&data)
        );
    }

    #[test]
    fn test_encrypt_block_deterministic() {
        let key = Key::generate();
        for kind in [CipherKind::AesGcm, CipherKind::SecretBox] {
            let a = encrypt_block(key.as_bytes(), kind, 7, b"block payload").unwrap();
            let b = encrypt_block(key.as_bytes(), kind, 7, b"block payload").unwrap();
            assert_eq!(a, b);

            // Different block index changes the nonce
            let c = encrypt_block(key.as_bytes(), kind, 8, b"block payload").unwrap();
            assert_ne!(a, c);

            let plain = decrypt_block(key.as_bytes(), kind, 7, &a).unwrap();
            assert_eq!(plain, b"block payload");
            assert_eq!(a.len(), b"block payload".len() + TAG_SIZE);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = Key::generate();
        let key2 = Key::generate();
        let ciphertext = encrypt_block(key1.as_bytes(), CipherKind::AesGcm, 0, b"secret").unwrap();

        let result = decrypt_block(key2.as_bytes(), CipherKind::AesGcm, 0, &ciphertext);
        assert!(matches!(result, Err(UplinkError::Decryption(_))));
    }

    #[test]
    fn test_wrong_block_index_fails() {
        let key = Key::generate();
        let ciphertext =
            encrypt_block(key.as_bytes(), CipherKind::SecretBox, 3, b"secret").unwrap();
        assert!(decrypt_block(key.as_bytes(), CipherKind::SecretBox, 4, &ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = Key::generate();
        let mut ciphertext =
            encrypt_block(key.as_bytes(), CipherKind::AesGcm, 0, b"secret").unwrap();
        ciphertext[0] ^= 0xFF;

        assert!(decrypt_block(key.as_bytes(), CipherKind::AesGcm, 0, &ciphertext).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        let result = BlockCipher::new(CipherKind::AesGcm, &[0u8; 16]);
        assert!(matches!(
            result,
            Err(UplinkError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
        assert!(Key::from_slice(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_segment_key_derivation() {
        let root = Key::from_bytes([9u8; KEY_SIZE]);

        let k0 = derive_segment_key(&root, "photos/cat.jpg", 0);
        let k0_again = derive_segment_key(&root, "photos/cat.jpg", 0);
        let k1 = derive_segment_key(&root, "photos/cat.jpg", 1);
        let other = derive_segment_key(&root, "photos/dog.jpg", 0);

        assert_eq!(k0.as_bytes(), k0_again.as_bytes());
        assert_ne!(k0.as_bytes(), k1.as_bytes());
        assert_ne!(k0.as_bytes(), other.as_bytes());
        assert_ne!(k0.as_bytes(), root.as_bytes());
    }

    #[test]
    fn test_salted_content_keys() {
        let segment_key = derive_segment_key(&Key::from_bytes([9u8; KEY_SIZE]), "b/k", 0);
        let salt = KeySalt::from_bytes([1u8; KEY_SIZE]);

        let a = salt.content_key(&segment_key);
        let b = salt.content_key(&segment_key);
        let other = KeySalt::from_bytes([2u8; KEY_SIZE]).content_key(&segment_key);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), other.as_bytes());
        assert_ne!(a.as_bytes(), segment_key.as_bytes());

        assert_ne!(KeySalt::random(), KeySalt::random());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = Key::from_bytes([0xAB; KEY_SIZE]);
        let rendered = format!("{:?}", key);
        assert_eq!(rendered, "Key([REDACTED])");
    }

    #[test]
    fn test_passphrase_derivation_is_stable() {
        let a = Key::derive_from_passphrase(b"correct horse", b"uplink-salt-0001").unwrap();
        let b = Key::derive_from_passphrase(b"correct horse", b"uplink-salt-0001").unwrap();
        let c = Key::derive_from_passphrase(b"battery staple", b"uplink-salt-0001").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_cipher_codes() {
        assert_eq!(CipherKind::try_from(1).unwrap(), CipherKind::AesGcm);
        assert_eq!(CipherKind::try_from(2).unwrap(), CipherKind::SecretBox);
        assert!(CipherKind::try_from(0).is_err());
        assert_eq!(CipherKind::SecretBox.code(), 2);
    }

    #[test]
    fn test_encrypted_size() {
        let scheme = EncryptionScheme::new(CipherKind::AesGcm, 1024).unwrap();
        assert_eq!(scheme.encrypted_size(0), TAG_SIZE as u64);
        assert_eq!(scheme.encrypted_size(1024), 1024 + TAG_SIZE as u64);
        assert_eq!(scheme.encrypted_size(1025), 1025 + 2 * TAG_SIZE as u64);
        assert!(EncryptionScheme::new(CipherKind::AesGcm, 0).is_err());

        let zero = EncryptionScheme {
            cipher: CipherKind::AesGcm,
            block_size: 0,
        };
        assert!(matches!(zero.validate(), Err(UplinkError::Configuration(_))));
    }
}
