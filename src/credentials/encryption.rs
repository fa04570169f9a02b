//! AES-256-GCM primitives for credential tokens.
//!
//! `seal`/`open` take raw key and nonce bytes and check their lengths
//! instead of truncating or padding. `open` fails closed: anything that
//! does not verify is `AuthenticationFailure`, never partial plaintext.

use crate::error::{Result, VaultError};
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Context};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

pub type NonceBytes = [u8; NONCE_SIZE];

/// Decodes a 64-character hex key into 32 bytes.
///
/// Input is taken verbatim; surrounding whitespace is a length error.
pub fn decode_key_hex(key_hex: &str) -> anyhow::Result<Zeroizing<[u8; KEY_SIZE]>> {
    if key_hex.len() != KEY_SIZE * 2 {
        return Err(anyhow!(
            "encryption key must be {} hex characters ({} bytes), got {} characters",
            KEY_SIZE * 2,
            KEY_SIZE,
            key_hex.len()
        ));
    }

    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    hex::decode_to_slice(key_hex, bytes.as_mut_slice())
        .context("encryption key is not valid hex")?;
    Ok(bytes)
}

/// Draws a fresh nonce from the OS CSPRNG.
pub fn generate_nonce() -> NonceBytes {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn cipher_for(key: &[u8], nonce: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_SIZE {
        return Err(VaultError::config(format!(
            "encryption key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(VaultError::config(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }

    Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::config(format!("failed to create cipher: {}", e)))
}

/// Encrypts `plaintext` under `key` and `nonce`.
///
/// Returns `ciphertext || tag`. The caller owns nonce uniqueness: a nonce
/// must never be reused with the same key.
pub fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key, nonce)?;

    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| VaultError::config("encryption failed"))
}

/// Decrypts and verifies `ciphertext` (with appended tag).
///
/// # Errors
/// - `Configuration` if key or nonce have the wrong length
/// - `AuthenticationFailure` on truncation, tag mismatch, wrong key or wrong nonce
pub fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key, nonce)?;

    if ciphertext.len() < TAG_SIZE {
        return Err(VaultError::AuthenticationFailure);
    }

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::AuthenticationFailure)
}

/// Like [`open`], for secrets that were sealed from UTF-8 strings.
pub fn open_string(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<String> {
    let plaintext = open(key, nonce, ciphertext)?;
    // Only UTF-8 is ever sealed; anything else did not come from this vault.
    String::from_utf8(plaintext).map_err(|_| VaultError::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0u8; 32];

    #[test]
    fn test_key_decoding() {
        let valid = "00".repeat(32);
        assert_eq!(*decode_key_hex(&valid).unwrap(), [0u8; 32]);

        let upper = "AB".repeat(32);
        assert_eq!(*decode_key_hex(&upper).unwrap(), [0xabu8; 32]);

        // Too short
        assert!(decode_key_hex(&"00".repeat(16)).is_err());

        // Too long
        assert!(decode_key_hex(&"00".repeat(64)).is_err());

        // Invalid hex
        assert!(decode_key_hex(&"g0".repeat(32)).is_err());

        // Padded entries are not exactly 64 characters
        assert!(decode_key_hex(&format!(" {} ", "00".repeat(32))).is_err());
        assert!(decode_key_hex(&format!("{}\n", "00".repeat(32))).is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let nonce = generate_nonce();
        let plaintext = "ya29.a0AfH6SMBx-access-token";

        let ciphertext = seal(&KEY, &nonce, plaintext.as_bytes()).expect("Encryption failed");
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);
        assert_ne!(&ciphertext[..plaintext.len()], plaintext.as_bytes());

        let decrypted = open_string(&KEY, &nonce, &ciphertext).expect("Decryption failed");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let nonce = generate_nonce();
        let ciphertext = seal(&KEY, &nonce, b"").unwrap();
        assert_eq!(ciphertext.len(), TAG_SIZE);
        assert_eq!(open(&KEY, &nonce, &ciphertext).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_generated_nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = generate_nonce();
        let ciphertext = seal(&KEY, &nonce, b"secret").unwrap();

        let result = open(&[1u8; 32], &nonce, &ciphertext);
        assert!(matches!(result, Err(VaultError::AuthenticationFailure)));
    }

    #[test]
    fn test_every_ciphertext_bit_flip_fails() {
        let nonce = generate_nonce();
        let ciphertext = seal(&KEY, &nonce, b"refresh-token").unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = ciphertext.clone();
                tampered[byte] ^= 1 << bit;
                assert!(matches!(
                    open(&KEY, &nonce, &tampered),
                    Err(VaultError::AuthenticationFailure)
                ));
            }
        }
    }

    #[test]
    fn test_every_nonce_bit_flip_fails() {
        let nonce = generate_nonce();
        let ciphertext = seal(&KEY, &nonce, b"refresh-token").unwrap();

        for byte in 0..NONCE_SIZE {
            for bit in 0..8 {
                let mut tampered = nonce;
                tampered[byte] ^= 1 << bit;
                assert!(matches!(
                    open(&KEY, &tampered, &ciphertext),
                    Err(VaultError::AuthenticationFailure)
                ));
            }
        }
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let nonce = generate_nonce();
        let ciphertext = seal(&KEY, &nonce, b"secret").unwrap();

        for len in 0..ciphertext.len() {
            assert!(matches!(
                open(&KEY, &nonce, &ciphertext[..len]),
                Err(VaultError::AuthenticationFailure)
            ));
        }
    }

    #[test]
    fn test_bad_lengths_are_configuration_errors() {
        let nonce = generate_nonce();

        assert!(matches!(
            seal(&[0u8; 16], &nonce, b"x"),
            Err(VaultError::Configuration(_))
        ));
        assert!(matches!(
            seal(&KEY, &[0u8; 16], b"x"),
            Err(VaultError::Configuration(_))
        ));
        assert!(matches!(
            open(&KEY, &nonce[..11], &[0u8; 32]),
            Err(VaultError::Configuration(_))
        ));
    }

    #[test]
    fn test_non_utf8_plaintext_rejected() {
        let nonce = generate_nonce();
        let ciphertext = seal(&KEY, &nonce, &[0xff, 0xfe, 0xfd]).unwrap();

        assert!(open(&KEY, &nonce, &ciphertext).is_ok());
        assert!(matches!(
            open_string(&KEY, &nonce, &ciphertext),
            Err(VaultError::AuthenticationFailure)
        ));
    }
}
