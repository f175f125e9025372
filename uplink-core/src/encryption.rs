//! Block-wise segment encryption
//!
//! Plaintext is cut into fixed-size blocks, each sealed independently with
//! its block index as nonce. Independent blocks let a range read decrypt only
//! the blocks it covers.

use crate::crypto::{BlockCipher, EncryptionScheme};
use crate::error::{Result, UplinkError};
use bytes::Bytes;
use std::io::{ErrorKind, Read};
use std::ops::Range;

/// Ciphertext length for a plaintext of `plain_len` bytes
pub fn encrypted_size(plain_len: u64, scheme: &EncryptionScheme) -> u64 {
    scheme.encrypted_size(plain_len)
}

/// Lazy iterator of ciphertext blocks over a plaintext reader.
///
/// Finite and not restartable. The final block may be short; an empty source
/// yields exactly one tag-only block.
pub struct Encryptor<R> {
    reader: R,
    cipher: BlockCipher,
    block_size: usize,
    block_index: u64,
    done: bool,
}

impl<R: Read> Encryptor<R> {
    pub fn new(reader: R, cipher: BlockCipher, block_size: usize) -> Self {
        Self {
            reader,
            cipher,
            block_size,
            block_index: 0,
            done: false,
        }
    }

    /// Blocks produced so far
    pub fn blocks_emitted(&self) -> u64 {
        self.block_index
    }
}

impl<R: Read> Iterator for Encryptor<R> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut block = vec![0u8; self.block_size];
        let filled = match read_full(&mut self.reader, &mut block) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };

        // Source ended exactly on a block boundary
        if filled == 0 && self.block_index > 0 {
            self.done = true;
            return None;
        }
        if filled < self.block_size {
            self.done = true;
        }
        block.truncate(filled);

        let sealed = self.cipher.encrypt_block(self.block_index, &block);
        self.block_index += 1;
        if sealed.is_err() {
            self.done = true;
        }
        Some(sealed.map(Bytes::from))
    }
}

/// Encrypt a whole in-memory segment
pub fn encrypt_segment(cipher: BlockCipher, block_size: usize, plaintext: &[u8]) -> Result<Bytes> {
    if block_size == 0 {
        return Err(UplinkError::Configuration(
            "encryption block_size must be > 0".to_string(),
        ));
    }
    let blocks = Encryptor::new(plaintext, cipher, block_size).collect::<Result<Vec<Bytes>>>()?;
    let mut out = Vec::with_capacity(blocks.iter().map(|b| b.len()).sum());
    for block in &blocks {
        out.extend_from_slice(block);
    }
    Ok(Bytes::from(out))
}

/// Decrypts the ciphertext of one segment.
///
/// Iterating yields plaintext blocks in order; [`Decryptor::decrypt_range`]
/// decrypts only the blocks covering a plaintext range.
pub struct Decryptor {
    cipher: BlockCipher,
    scheme: EncryptionScheme,
    ciphertext: Bytes,
    plain_size: u64,
    next_block: u64,
}

impl Decryptor {
    /// Checks the ciphertext length against the expected plaintext size
    pub fn new(
        cipher: BlockCipher,
        scheme: EncryptionScheme,
        ciphertext: Bytes,
        plain_size: u64,
    ) -> Result<Self> {
        scheme.validate()?;
        let expected = scheme.encrypted_size(plain_size);
        if ciphertext.len() as u64 != expected {
            return Err(UplinkError::Decryption(format!(
                "ciphertext is {} bytes, expected {} for {} plaintext bytes",
                ciphertext.len(),
                expected,
                plain_size
            )));
        }
        Ok(Self {
            cipher,
            scheme,
            ciphertext,
            plain_size,
            next_block: 0,
        })
    }

    pub fn plain_size(&self) -> u64 {
        self.plain_size
    }

    pub fn block_count(&self) -> u64 {
        self.scheme.block_count(self.plain_size)
    }

    /// Block indices holding the bytes of `range`
    pub fn covering_blocks(&self, range: &Range<u64>) -> Range<u64> {
        let block_size = self.scheme.block_size as u64;
        if range.start >= range.end {
            let at = range.start / block_size;
            return at..at;
        }
        (range.start / block_size)..range.end.div_ceil(block_size)
    }

    /// Decrypt only the blocks covering `range`, trimmed to the range
    pub fn decrypt_range(&self, range: Range<u64>) -> Result<Bytes> {
        if range.start > range.end || range.end > self.plain_size {
            return Err(UplinkError::InvalidRange {
                start: range.start,
                end: range.end,
                size: self.plain_size,
            });
        }

        // An empty segment is a single tag-only block; still authenticate it
        if self.plain_size == 0 {
            self.decrypt_at(0)?;
            return Ok(Bytes::new());
        }

        let block_size = self.scheme.block_size as u64;
        let mut out = Vec::with_capacity((range.end - range.start) as usize);
        for index in self.covering_blocks(&range) {
            let plain = self.decrypt_at(index)?;
            let block_start = index * block_size;
            let lo = (range.start.max(block_start) - block_start) as usize;
            let hi = (range.end.min(block_start + plain.len() as u64) - block_start) as usize;
            out.extend_from_slice(&plain[lo..hi]);
        }
        Ok(Bytes::from(out))
    }

    /// Decrypt the whole segment
    pub fn decrypt_all(&self) -> Result<Bytes> {
        self.decrypt_range(0..self.plain_size)
    }

    fn decrypt_at(&self, index: u64) -> Result<Vec<u8>> {
        let block_size = self.scheme.block_size as u64;
        let sealed_size = self.scheme.encrypted_block_size() as u64;

        let start = index * sealed_size;
        let end = (start + sealed_size).min(self.ciphertext.len() as u64);
        if start >= end {
            return Err(UplinkError::Decryption(format!(
                "block {} beyond end of ciphertext",
                index
            )));
        }

        let plain = self
            .cipher
            .decrypt_block(index, &self.ciphertext[start as usize..end as usize])?;

        let expected = self.plain_size.saturating_sub(index * block_size).min(block_size);
        if plain.len() as u64 != expected {
            return Err(UplinkError::Decryption(format!(
                "block {} decrypted to {} bytes, expected {}",
                index,
                plain.len(),
                expected
            )));
        }
        Ok(plain)
    }
}

impl Iterator for Decryptor {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_block >= self.block_count() {
            return None;
        }
        let index = self.next_block;
        self.next_block += 1;
        Some(self.decrypt_at(index).map(Bytes::from))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, Key, TAG_SIZE};

    const BLOCK: usize = 64;

    fn scheme(kind: CipherKind) -> EncryptionScheme {
        EncryptionScheme::new(kind, BLOCK).unwrap()
    }

    fn cipher(kind: CipherKind, key: &Key) -> BlockCipher {
        BlockCipher::new(kind, key.as_bytes()).unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[test]
    fn test_roundtrip_sizes() {
        let key = Key::generate();
        for kind in [CipherKind::AesGcm, CipherKind::SecretBox] {
            for len in [0, 1, BLOCK - 1, BLOCK, BLOCK + 1, 3 * BLOCK, 3 * BLOCK + 7] {
                let plain = sample(len);
                let ciphertext = encrypt_segment(cipher(kind, &key), BLOCK, &plain).unwrap();
                assert_eq!(
                    ciphertext.len() as u64,
                    encrypted_size(len as u64, &scheme(kind))
                );

                let decryptor =
                    Decryptor::new(cipher(kind, &key), scheme(kind), ciphertext, len as u64)
                        .unwrap();
                assert_eq!(decryptor.decrypt_all().unwrap().as_ref(), plain.as_slice());
            }
        }
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let key = Key::generate();
        let zero = EncryptionScheme {
            cipher: CipherKind::AesGcm,
            block_size: 0,
        };

        assert!(matches!(
            encrypt_segment(cipher(CipherKind::AesGcm, &key), 0, b"data"),
            Err(UplinkError::Configuration(_))
        ));
        assert!(matches!(
            Decryptor::new(cipher(CipherKind::AesGcm, &key), zero, Bytes::new(), 0),
            Err(UplinkError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_source_yields_one_block() {
        let key = Key::generate();
        let blocks: Vec<Bytes> = Encryptor::new(&[][..], cipher(CipherKind::AesGcm, &key), BLOCK)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), TAG_SIZE);
    }

    #[test]
    fn test_block_boundaries() {
        let key = Key::generate();
        let plain = sample(2 * BLOCK);
        let mut encryptor = Encryptor::new(&plain[..], cipher(CipherKind::AesGcm, &key), BLOCK);

        assert_eq!(encryptor.next().unwrap().unwrap().len(), BLOCK + TAG_SIZE);
        assert_eq!(encryptor.next().unwrap().unwrap().len(), BLOCK + TAG_SIZE);
        assert!(encryptor.next().is_none());
        assert!(encryptor.next().is_none());
        assert_eq!(encryptor.blocks_emitted(), 2);
    }

    #[test]
    fn test_decryptor_iterates_blocks() {
        let key = Key::generate();
        let plain = sample(2 * BLOCK + 5);
        let ciphertext = encrypt_segment(cipher(CipherKind::SecretBox, &key), BLOCK, &plain).unwrap();

        let decryptor = Decryptor::new(
            cipher(CipherKind::SecretBox, &key),
            scheme(CipherKind::SecretBox),
            ciphertext,
            plain.len() as u64,
        )
        .unwrap();
        let blocks: Vec<Bytes> = decryptor.collect::<Result<_>>().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].as_ref(), &plain[2 * BLOCK..]);
    }

    #[test]
    fn test_decrypt_range_touches_covering_blocks() {
        let key = Key::generate();
        let plain = sample(10 * BLOCK);
        let ciphertext = encrypt_segment(cipher(CipherKind::AesGcm, &key), BLOCK, &plain).unwrap();
        let decryptor = Decryptor::new(
            cipher(CipherKind::AesGcm, &key),
            scheme(CipherKind::AesGcm),
            ciphertext,
            plain.len() as u64,
        )
        .unwrap();

        assert_eq!(decryptor.covering_blocks(&(10..20)), 0..1);
        assert_eq!(decryptor.covering_blocks(&(60..70)), 0..2);
        assert_eq!(decryptor.covering_blocks(&(128..192)), 2..3);

        let part = decryptor.decrypt_range(70..200).unwrap();
        assert_eq!(part.as_ref(), &plain[70..200]);
        assert!(decryptor.decrypt_range(5..5).unwrap().is_empty());
    }

    #[test]
    fn test_range_out_of_bounds() {
        let key = Key::generate();
        let plain = sample(100);
        let ciphertext = encrypt_segment(cipher(CipherKind::AesGcm, &key), BLOCK, &plain).unwrap();
        let decryptor = Decryptor::new(
            cipher(CipherKind::AesGcm, &key),
            scheme(CipherKind::AesGcm),
            ciphertext,
            100,
        )
        .unwrap();

        assert!(matches!(
            decryptor.decrypt_range(50..101),
            Err(UplinkError::InvalidRange { size: 100, .. })
        ));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let key = Key::generate();
        let plain = sample(3 * BLOCK);
        let ciphertext = encrypt_segment(cipher(CipherKind::AesGcm, &key), BLOCK, &plain).unwrap();
        let truncated = ciphertext.slice(..ciphertext.len() - 1);

        assert!(matches!(
            Decryptor::new(
                cipher(CipherKind::AesGcm, &key),
                scheme(CipherKind::AesGcm),
                truncated,
                plain.len() as u64,
            ),
            Err(UplinkError::Decryption(_))
        ));
    }

    #[test]
    fn test_tampered_block_rejected() {
        let key = Key::generate();
        let plain = sample(3 * BLOCK);
        let ciphertext = encrypt_segment(cipher(CipherKind::AesGcm, &key), BLOCK, &plain).unwrap();
        let mut tampered = ciphertext.to_vec();
        tampered[BLOCK + TAG_SIZE + 3] ^= 0x01;

        let decryptor = Decryptor::new(
            cipher(CipherKind::AesGcm, &key),
            scheme(CipherKind::AesGcm),
            Bytes::from(tampered),
            plain.len() as u64,
        )
        .unwrap();

        // First block is intact, second is not
        assert!(decryptor.decrypt_range(0..BLOCK as u64).is_ok());
        assert!(decryptor.decrypt_all().is_err());
    }

    #[test]
    fn test_swapped_blocks_rejected() {
        let key = Key::generate();
        let plain = sample(2 * BLOCK);
        let ciphertext = encrypt_segment(cipher(CipherKind::AesGcm, &key), BLOCK, &plain).unwrap();
        let sealed = BLOCK + TAG_SIZE;
        let mut swapped = ciphertext[sealed..].to_vec();
        swapped.extend_from_slice(&ciphertext[..sealed]);

        let decryptor = Decryptor::new(
            cipher(CipherKind::AesGcm, &key),
            scheme(CipherKind::AesGcm),
            Bytes::from(swapped),
            plain.len() as u64,
        )
        .unwrap();
        assert!(decryptor.decrypt_all().is_err());
    }
}
