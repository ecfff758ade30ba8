//! SteganoChat: covert messaging through cover images.
//!
//! Plaintext is encrypted with a forward-secure pairwise protocol, split
//! into chunks, and each chunk is hidden in the least significant bits of
//! a cover image, spread over the image's highest-entropy tiles. The
//! receiver extracts the chunks, decrypts them, and reassembles the
//! message.
//!
//! Pipeline (compose): plaintext → [`distribution::split`] →
//! [`crypto::ratchet::Ratchet::send`] per chunk → [`stego::StegoEngine::embed`].
//! Pipeline (read): [`stego::StegoEngine::extract`] per image →
//! [`crypto::ratchet::Ratchet::receive`] → [`distribution::merge`].

pub mod codec;
pub mod crypto;
pub mod distribution;
pub mod stego;
pub mod storage;
pub mod types;

pub use types::*;

/// AES-256 key length in bytes.
pub const AES_KEY_LEN: usize = 32;

/// Nonce length for the wire AEAD (AES-CCM).
pub const NONCE_LEN: usize = 8;

/// RSA modulus size in bits.
pub const RSA_KEY_BITS: usize = 2048;

/// One RSA block (and one OAEP ciphertext): the modulus size in bytes.
pub const RSA_BLOCK_LEN: usize = RSA_KEY_BITS / 8;

/// SubjectPublicKeyInfo DER length for an RSA-2048 public key.
pub const RSA_PUBLIC_DER_LEN: usize = 294;

/// SHA-256 digest length.
pub const SHA_LEN: usize = 32;

/// AES-CCM authentication tag length.
pub const CCM_TAG_LEN: usize = 16;

/// Dynamic identifier length in bytes.
pub const DYNAMIC_ID_LEN: usize = 8;

/// Number of dynamic identifiers exchanged with each key generation.
pub const DYNAMIC_ID_COUNT: usize = 32;
