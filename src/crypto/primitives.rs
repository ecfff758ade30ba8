//! Fixed cryptographic primitives.
//!
//! The protocol has no algorithm agility: SHA-256 everywhere, AES-256-CCM
//! with an 8-byte nonce on the wire, RSA-2048-OAEP-SHA256 for key
//! delivery, and an AES-256-GCM envelope for data at rest (the contacts
//! file and invitation blobs).

use aes::Aes256;
use aes_gcm::Aes256Gcm;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U16, U8};
use ccm::Ccm;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{AES_KEY_LEN, NONCE_LEN, RSA_KEY_BITS, SHA_LEN};

/// AES-256-CCM with the protocol's 8-byte nonce and 16-byte tag.
type Aes256Ccm = Ccm<Aes256, U16, U8>;

/// Nonce length of the at-rest AES-GCM envelope.
const GCM_NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("symmetric encryption failed")]
    Encrypt,

    #[error("symmetric decryption failed")]
    Decrypt,

    #[error("envelope too short to hold a nonce and tag")]
    EnvelopeTooShort,

    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("bad RSA private key encoding: {0}")]
    PrivateKeyDer(#[from] rsa::pkcs1::Error),

    #[error("bad RSA public key encoding: {0}")]
    PublicKeyDer(#[from] rsa::pkcs8::spki::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

pub fn sha256(data: &[u8]) -> [u8; SHA_LEN] {
    Sha256::digest(data).into()
}

/// The file/invitation key is the passphrase hashed once.
pub fn passphrase_key(passphrase: &str) -> [u8; AES_KEY_LEN] {
    sha256(passphrase.as_bytes())
}

pub fn ccm_encrypt(
    key: &[u8; AES_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plain: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Ccm::new(key.into());
    cipher.encrypt(nonce.into(), plain).map_err(|_| CryptoError::Encrypt)
}

pub fn ccm_decrypt(
    key: &[u8; AES_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    cipher_text: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Ccm::new(key.into());
    cipher
        .decrypt(nonce.into(), cipher_text)
        .map_err(|_| CryptoError::Decrypt)
}

/// Seal arbitrary-length data under a 32-byte key.
/// Output: `nonce(12) ‖ ciphertext‖tag`.
pub fn envelope_seal(key: &[u8; AES_KEY_LEN], plain: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher_text = cipher
        .encrypt(GenericArray::from_slice(&nonce), plain)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(GCM_NONCE_LEN + cipher_text.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&cipher_text);
    Ok(out)
}

/// Open a sealed envelope. Any tampering, including a wrong key, fails
/// authentication and surfaces as [`CryptoError::Decrypt`].
pub fn envelope_open(key: &[u8; AES_KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < GCM_NONCE_LEN + 16 {
        return Err(CryptoError::EnvelopeTooShort);
    }
    let (nonce, cipher_text) = data.split_at(GCM_NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(GenericArray::from_slice(nonce), cipher_text)
        .map_err(|_| CryptoError::Decrypt)
}

/// Generate an RSA-2048 private key, PKCS#1 DER encoded.
pub fn rsa_generate_private_der() -> Result<Vec<u8>> {
    let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)?;
    Ok(key.to_pkcs1_der()?.as_bytes().to_vec())
}

/// Derive the SubjectPublicKeyInfo DER from a PKCS#1 private DER.
pub fn rsa_public_der(private_der: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPrivateKey::from_pkcs1_der(private_der)?;
    Ok(key.to_public_key().to_public_key_der()?.as_bytes().to_vec())
}

/// OAEP-SHA256 encryption of a short block under an SPKI public key.
pub fn rsa_oaep_encrypt(public_der: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPublicKey::from_public_key_der(public_der)?;
    Ok(key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), plain)?)
}

/// OAEP-SHA256 decryption under a PKCS#1 private key.
pub fn rsa_oaep_decrypt(private_der: &[u8], cipher_text: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPrivateKey::from_pkcs1_der(private_der)?;
    Ok(key.decrypt(Oaep::new::<Sha256>(), cipher_text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RSA_BLOCK_LEN, RSA_PUBLIC_DER_LEN};

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn ccm_roundtrip_and_tag_length() {
        let key = [0x11u8; AES_KEY_LEN];
        let nonce = [0x22u8; NONCE_LEN];
        let plain = b"the quick brown fox";

        let cipher = ccm_encrypt(&key, &nonce, plain).unwrap();
        assert_eq!(cipher.len(), plain.len() + 16);
        assert_eq!(ccm_decrypt(&key, &nonce, &cipher).unwrap(), plain);
    }

    #[test]
    fn ccm_rejects_tampering() {
        let key = [0x11u8; AES_KEY_LEN];
        let nonce = [0x22u8; NONCE_LEN];
        let mut cipher = ccm_encrypt(&key, &nonce, b"payload").unwrap();
        cipher[0] ^= 1;
        assert!(matches!(
            ccm_decrypt(&key, &nonce, &cipher),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn envelope_roundtrip() {
        let key = passphrase_key("hello");
        let sealed = envelope_seal(&key, b"user list").unwrap();
        assert_eq!(envelope_open(&key, &sealed).unwrap(), b"user list");
    }

    #[test]
    fn envelope_rejects_wrong_key() {
        let sealed = envelope_seal(&passphrase_key("hello"), b"user list").unwrap();
        assert!(matches!(
            envelope_open(&passphrase_key("Hello"), &sealed),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn envelope_rejects_truncation() {
        assert!(matches!(
            envelope_open(&passphrase_key("hello"), &[0u8; 10]),
            Err(CryptoError::EnvelopeTooShort)
        ));
    }

    #[test]
    fn rsa_derive_encrypt_decrypt() {
        let private_der = rsa_generate_private_der().unwrap();
        let public_der = rsa_public_der(&private_der).unwrap();
        assert_eq!(public_der.len(), RSA_PUBLIC_DER_LEN);

        let block = b"exchange key material";
        let cipher = rsa_oaep_encrypt(&public_der, block).unwrap();
        assert_eq!(cipher.len(), RSA_BLOCK_LEN);
        assert_eq!(rsa_oaep_decrypt(&private_der, &cipher).unwrap(), block);
    }
}
