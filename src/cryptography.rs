use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key and IV must be {AES_BLOCK_SIZE} bytes")]
    InvalidKeyLength,
    #[error("invalid ciphertext padding")]
    InvalidPadding,
}

/// AES-128-CBC with PKCS#7 padding.
///
/// The IV is fixed per instance, so two encryptions of the same plaintext
/// produce the same ciphertext. That is acceptable for the single local
/// password file this cipher protects, and it keeps the file format free of
/// a header.
pub struct AesCbc {
    key: [u8; AES_BLOCK_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
}

impl AesCbc {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let key = key.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        let iv = iv.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self { key, iv })
    }

    /// Pads the payload to the block size and encrypts it. Output length is
    /// always a non-zero multiple of the block size.
    pub fn encrypt(&self, payload: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(payload)
    }

    /// Decrypts and strips the padding. Fails on ciphertext that is not
    /// block-aligned or whose padding does not verify (wrong key, corrupted
    /// file).
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(payload)
            .map_err(|_| CryptoError::InvalidPadding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 16] = b"0123456789abcdef";
    const IV: &[u8; 16] = b"fedcba9876543210";

    fn cipher() -> AesCbc {
        AesCbc::new(KEY, IV).expect("valid key and IV")
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = cipher();
        let plaintext = b"Hello, World! This is a test message.";

        let encrypted = cipher.encrypt(plaintext);

        // Ciphertext is padded up to the next block boundary
        assert_eq!(encrypted.len() % AES_BLOCK_SIZE, 0);
        assert!(encrypted.len() > plaintext.len());

        let decrypted = cipher.decrypt(&encrypted).expect("decryption should succeed");
        assert_eq!(&decrypted[..], plaintext);
    }

    #[test]
    fn test_encrypt_empty_payload() {
        let cipher = cipher();

        let encrypted = cipher.encrypt(b"");

        // Even an empty payload gets a full padding block
        assert_eq!(encrypted.len(), AES_BLOCK_SIZE);

        let decrypted = cipher.decrypt(&encrypted).expect("decryption should succeed");
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_block_aligned_payload_grows_one_block() {
        let cipher = cipher();
        let plaintext = [0x42u8; AES_BLOCK_SIZE * 2];

        let encrypted = cipher.encrypt(&plaintext);
        assert_eq!(encrypted.len(), plaintext.len() + AES_BLOCK_SIZE);

        let decrypted = cipher.decrypt(&encrypted).expect("decryption should succeed");
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn test_decrypt_with_wrong_key_does_not_recover_plaintext() {
        let plaintext = b"Secret message";
        let encrypted = cipher().encrypt(plaintext);

        let other = AesCbc::new(b"another-16b-key!", IV).expect("valid key and IV");
        let result = other.decrypt(&encrypted);

        // Wrong key either fails padding verification or yields garbage,
        // never the original plaintext.
        assert_ne!(result.ok().as_deref(), Some(&plaintext[..]));
    }

    #[test]
    fn test_decrypt_unaligned_ciphertext_fails() {
        let result = cipher().decrypt(b"short");
        assert!(result.is_err(), "non-block-aligned input should fail");
    }

    #[test]
    fn test_decrypt_tampered_ciphertext_fails_or_differs() {
        let cipher = cipher();
        let plaintext = b"Important data";

        let mut encrypted = cipher.encrypt(plaintext);
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;

        // Flipping a byte in the final block corrupts the padding or the
        // recovered plaintext.
        assert_ne!(cipher.decrypt(&encrypted).ok().as_deref(), Some(&plaintext[..]));
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(AesCbc::new(b"short", IV).is_err());
        assert!(AesCbc::new(KEY, b"short").is_err());
    }

    #[test]
    fn test_same_input_same_output() {
        let cipher = cipher();
        let plaintext = b"deterministic";

        // Fixed IV means encryption is deterministic per instance.
        assert_eq!(cipher.encrypt(plaintext), cipher.encrypt(plaintext));
    }
}
