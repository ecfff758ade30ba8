//! Key material for the ratchet window.
//!
//! A [`KeySet`] is one generation: a symmetric key, an RSA key, and the
//! 32 routing tokens the peer may address us with. [`KeySets`] is the
//! rotating three-slot window over generations:
//! - `new`: the freshly generated owned set, advertised at every send;
//! - `crt`: the peer's currently active set (public side);
//! - `pst`: the previous `new` after promotion, kept so in-flight
//!   messages encrypted against it still decrypt.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::{ByteReader, ByteWriter, Result as CodecResult};
use crate::crypto::primitives::{self, Result as CryptoResult};
use crate::types::{DynamicId, UserStatus};
use crate::{AES_KEY_LEN, DYNAMIC_ID_COUNT, DYNAMIC_ID_LEN};

/// One ratchet generation.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    pub aes_key: [u8; AES_KEY_LEN],
    /// PKCS#1 private DER when owned; SubjectPublicKeyInfo DER when it
    /// is the peer's side of the exchange.
    pub rsa_key: Vec<u8>,
    /// Always [`DYNAMIC_ID_COUNT`] entries. Routing tokens, not secret.
    #[zeroize(skip)]
    pub dynamic_ids: Vec<DynamicId>,
}

impl KeySet {
    /// Generate an owned key set: fresh AES key, fresh RSA-2048 keypair.
    /// The dynamic ids come from the contacts store, which enforces
    /// their global uniqueness.
    pub fn generate(dynamic_ids: Vec<DynamicId>) -> CryptoResult<Self> {
        let mut aes_key = [0u8; AES_KEY_LEN];
        OsRng.fill_bytes(&mut aes_key);
        let rsa_key = primitives::rsa_generate_private_der()?;
        Ok(Self {
            aes_key,
            rsa_key,
            dynamic_ids,
        })
    }

    /// The transmissible view: same AES key and dynamic ids, with the
    /// private key replaced by its public encoding.
    pub fn public_view(&self) -> CryptoResult<Self> {
        Ok(Self {
            aes_key: self.aes_key,
            rsa_key: primitives::rsa_public_der(&self.rsa_key)?,
            dynamic_ids: self.dynamic_ids.clone(),
        })
    }

    /// `aes_key ‖ concat(dynamic_ids) ‖ rsa_key`. The RSA field is the
    /// trailing remainder; its length is whatever the DER encodes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            AES_KEY_LEN + DYNAMIC_ID_COUNT * DYNAMIC_ID_LEN + self.rsa_key.len(),
        );
        out.extend_from_slice(&self.aes_key);
        for id in &self.dynamic_ids {
            out.extend_from_slice(id.as_bytes());
        }
        out.extend_from_slice(&self.rsa_key);
        out
    }

    pub fn from_bytes(data: &[u8]) -> CodecResult<Self> {
        let mut r = ByteReader::new(data);
        let aes_key = r.read_array()?;
        let mut dynamic_ids = Vec::with_capacity(DYNAMIC_ID_COUNT);
        for _ in 0..DYNAMIC_ID_COUNT {
            dynamic_ids.push(DynamicId::from_bytes(r.read_array()?));
        }
        let rsa_key = r.read_remaining().to_vec();
        Ok(Self {
            aes_key,
            rsa_key,
            dynamic_ids,
        })
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't leak key material, just the shape
        write!(
            f,
            "KeySet {{ rsa_key: {} bytes, dynamic_ids: {} }}",
            self.rsa_key.len(),
            self.dynamic_ids.len()
        )
    }
}

/// The `new`/`crt`/`pst` window. Rotation is a value-level reassignment,
/// driven by the ratchet on the refresh path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySets {
    pub new: Option<KeySet>,
    pub crt: Option<KeySet>,
    pub pst: Option<KeySet>,
}

impl KeySets {
    /// Per slot: u16 length then the slot bytes, zero length = absent.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        for slot in [&self.new, &self.crt, &self.pst] {
            w.put_block(slot.as_ref().map(KeySet::to_bytes).as_deref());
        }
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> CodecResult<Self> {
        let mut r = ByteReader::new(data);
        let mut slots = [None, None, None];
        for slot in &mut slots {
            *slot = r.read_block()?.map(|b| KeySet::from_bytes(&b)).transpose()?;
        }
        let [new, crt, pst] = slots;
        Ok(Self { new, crt, pst })
    }

    pub fn status(&self) -> UserStatus {
        match (&self.new, &self.crt, &self.pst) {
            (Some(_), Some(_), Some(_)) => UserStatus::Normal,
            (Some(_), None, None) => UserStatus::InvitationSent,
            (Some(_), Some(_), None) => UserStatus::InvitationReceived,
            _ => UserStatus::Invalid,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// A structurally valid key set with opaque stand-in DER bytes.
    /// The wire format treats `rsa_key` as an uninterpreted tail, so
    /// serialization tests don't have to pay for real RSA keygen.
    pub(crate) fn stub_keyset(seed: u64) -> KeySet {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut aes_key = [0u8; AES_KEY_LEN];
        rng.fill_bytes(&mut aes_key);
        let mut rsa_key = vec![0u8; 1190];
        rng.fill_bytes(&mut rsa_key);
        let dynamic_ids = (0..DYNAMIC_ID_COUNT)
            .map(|_| DynamicId::random(&mut rng))
            .collect();
        KeySet {
            aes_key,
            rsa_key,
            dynamic_ids,
        }
    }

    #[test]
    fn keyset_roundtrip() {
        let keyset = stub_keyset(42);
        let recovered = KeySet::from_bytes(&keyset.to_bytes()).unwrap();
        assert_eq!(recovered, keyset);
    }

    #[test]
    fn keyset_rejects_truncated_input() {
        let keyset = stub_keyset(42);
        let bytes = keyset.to_bytes();
        assert!(KeySet::from_bytes(&bytes[..100]).is_err());
    }

    #[test]
    fn keysets_roundtrip_all_occupancies() {
        let cases = [
            KeySets {
                new: Some(stub_keyset(1)),
                crt: Some(stub_keyset(2)),
                pst: Some(stub_keyset(3)),
            },
            KeySets {
                new: Some(stub_keyset(4)),
                crt: None,
                pst: None,
            },
            KeySets {
                new: Some(stub_keyset(5)),
                crt: Some(stub_keyset(6)),
                pst: None,
            },
            KeySets::default(),
        ];
        for keysets in cases {
            let recovered = KeySets::from_bytes(&keysets.to_bytes()).unwrap();
            assert_eq!(recovered, keysets);
        }
    }

    #[test]
    fn debug_does_not_leak_keys() {
        let keyset = stub_keyset(7);
        let rendered = format!("{keyset:?}");
        assert!(!rendered.contains(&hex::encode(keyset.aes_key)));
    }
}
