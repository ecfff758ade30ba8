//! Peer identity: stable id, display name, and the rotating key window.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

use crate::codec::{ByteReader, ByteWriter, Result as CodecResult};
use crate::types::KeySets;
use crate::DYNAMIC_ID_LEN;

/// One of the 32 per-generation routing tokens. Its presence in a
/// ciphertext prefix selects the target user without revealing the
/// stable id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicId([u8; DYNAMIC_ID_LEN]);

impl DynamicId {
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; DYNAMIC_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DYNAMIC_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DYNAMIC_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for DynamicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DynamicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynamicId({})", hex::encode(self.0))
    }
}

/// Stable user identifier, unique within one contacts store.
/// Rendered and parsed as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct UserId(u64);

impl UserId {
    pub fn random(rng: &mut impl RngCore) -> Self {
        Self(rng.next_u64())
    }

    pub fn from_u64(v: u64) -> Self {
        Self(v)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u64::from_str_radix(s, 16)?))
    }
}

/// Protocol state of a peer, derived from which key-window slots are
/// occupied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserStatus {
    /// Steady state: at least one exchange completed in each direction.
    Normal,
    /// We invited the peer and are waiting for their first message.
    InvitationSent,
    /// We accepted an invitation; the first inbound refresh upgrades to Normal.
    InvitationReceived,
    /// Any other slot combination. A bug marker, never legal to send against.
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub keys: KeySets,
}

impl User {
    pub fn status(&self) -> UserStatus {
        self.keys.status()
    }

    /// `id(8) ‖ name_len(2) ‖ name ‖ keys_len(2) ‖ keys`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.id.as_u64());
        w.put_string(&self.name);
        let keys = self.keys.to_bytes();
        w.put_u16(keys.len() as u16);
        w.put_bytes(&keys);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> CodecResult<Self> {
        let mut r = ByteReader::new(data);
        let id = UserId::from_u64(r.read_u64()?);
        let name = r.read_string()?;
        let keys_len = r.read_u16()? as usize;
        let keys = KeySets::from_bytes(&r.read_vec(keys_len)?)?;
        Ok(Self { id, name, keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::keyset::tests::stub_keyset;
    use rand::rngs::OsRng;

    #[test]
    fn user_id_hex_roundtrip() {
        let id = UserId::from_u64(0xDEAD_BEEF_0042_1337);
        let rendered = id.to_string();
        assert_eq!(rendered, "deadbeef00421337");
        assert_eq!(rendered.parse::<UserId>().unwrap(), id);
    }

    #[test]
    fn status_follows_slot_occupancy() {
        let mut user = User {
            id: UserId::random(&mut OsRng),
            name: "TestUser".into(),
            keys: KeySets {
                new: Some(stub_keyset(1)),
                crt: None,
                pst: None,
            },
        };
        assert_eq!(user.status(), UserStatus::InvitationSent);

        user.keys.crt = Some(stub_keyset(2));
        assert_eq!(user.status(), UserStatus::InvitationReceived);

        user.keys.pst = Some(stub_keyset(3));
        assert_eq!(user.status(), UserStatus::Normal);

        user.keys.new = None;
        assert_eq!(user.status(), UserStatus::Invalid);
    }

    #[test]
    fn user_roundtrip() {
        let user = User {
            id: UserId::random(&mut OsRng),
            name: "TestUser".into(),
            keys: KeySets {
                new: Some(stub_keyset(1)),
                crt: Some(stub_keyset(2)),
                pst: Some(stub_keyset(3)),
            },
        };
        let recovered = User::from_bytes(&user.to_bytes()).unwrap();
        assert_eq!(recovered, user);
    }

    #[test]
    fn user_with_empty_name_roundtrip() {
        let user = User {
            id: UserId::from_u64(7),
            name: String::new(),
            keys: KeySets {
                new: Some(stub_keyset(9)),
                crt: None,
                pst: None,
            },
        };
        let recovered = User::from_bytes(&user.to_bytes()).unwrap();
        assert_eq!(recovered, user);
    }
}
