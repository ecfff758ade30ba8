//! Forward-secure pairwise message protocol.
//!
//! Every outbound message carries an inner exchange section delivering
//! the sender's next key generation; every inbound message sent against
//! our latest advertised generation rotates the local window
//! (`pst ← new`, `crt ← delivered`, `new ← fresh`). Past generations
//! stop decrypting new traffic one rotation later, giving forward
//! secrecy per message.
//!
//! Wire layout of one message, in order:
//! - `dynamic_id` (8): random pick from the peer's current tokens
//! - `nonce` (8): shared by both CCM encryptions below (distinct keys)
//! - RSA-OAEP block (256): `exchange_key(32) ‖ exchange_len(2)` under
//!   the peer's current public key
//! - exchange section: CCM under `exchange_key` of
//!   `aes_key ‖ 32×dynamic_id ‖ public_key_der`
//! - SHA-256 of the exchange plaintext (32, in the clear)
//! - body: CCM under the peer's current AES key
//! - SHA-256 of the body plaintext (32, in the clear)
//!
//! The two clear hashes let a receiver tell exchange-section corruption
//! from body corruption independently of the CCM tags.

use log::debug;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::codec::{ByteReader, CodecError};
use crate::crypto::primitives::{self, CryptoError};
use crate::storage::{Contacts, ContactsError};
use crate::types::{DynamicId, KeySet, User, UserId, UserStatus};
use crate::{
    AES_KEY_LEN, CCM_TAG_LEN, DYNAMIC_ID_COUNT, DYNAMIC_ID_LEN, NONCE_LEN, RSA_BLOCK_LEN,
    RSA_PUBLIC_DER_LEN, SHA_LEN,
};

/// Exchange-section plaintext: AES key, 32 dynamic ids, public key DER.
pub const EXCHANGE_PLAIN_LEN: usize =
    AES_KEY_LEN + DYNAMIC_ID_COUNT * DYNAMIC_ID_LEN + RSA_PUBLIC_DER_LEN;

/// Fixed overhead one message adds above its plaintext: dynamic id,
/// nonce, RSA block, exchange ciphertext with tag, both clear hashes,
/// and the body's CCM tag.
pub const ENVELOPE_OVERHEAD: usize = DYNAMIC_ID_LEN
    + NONCE_LEN
    + RSA_BLOCK_LEN
    + (EXCHANGE_PLAIN_LEN + CCM_TAG_LEN)
    + SHA_LEN
    + CCM_TAG_LEN
    + SHA_LEN;

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("no user owns dynamic id {0}")]
    UnknownDynamicId(DynamicId),

    #[error("the invitation of user {0} has not been confirmed")]
    InvitationNotConfirmed(UserId),

    #[error("user {0} has an invalid key-set configuration")]
    InvalidUser(UserId),

    #[error("no past generation to decrypt the body against")]
    InvalidState,

    #[error("exchange section hash mismatch")]
    ExchangeHashMismatch,

    #[error("body hash mismatch")]
    BodyHashMismatch,

    #[error(transparent)]
    Contacts(#[from] ContactsError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, RatchetError>;

/// The encryption engine. Owns the contacts store and mutates it on
/// `invite`, `receive_invitation`, and the refresh path of `receive`;
/// nothing else may touch the store while a ratchet is active.
pub struct Ratchet {
    contacts: Contacts,
}

impl Ratchet {
    pub fn new(contacts: Contacts) -> Self {
        Self { contacts }
    }

    /// Open an existing contacts store at `path`.
    pub fn open(path: impl Into<std::path::PathBuf>, passphrase: &str) -> Result<Self> {
        Ok(Self::new(Contacts::open(path, passphrase)?))
    }

    pub fn contacts(&self) -> &Contacts {
        &self.contacts
    }

    pub fn save(&self) -> Result<()> {
        Ok(self.contacts.save()?)
    }

    /// Persist and release the store.
    pub fn close(self) -> Result<()> {
        self.save()
    }

    // ========================================================================
    // Pairing
    // ========================================================================

    /// Invite a peer. Registers them as InvitationSent and returns the
    /// invitation blob: the public view of our fresh generation, sealed
    /// under `passphrase` for out-of-band delivery.
    pub fn invite(&mut self, name: &str, passphrase: &str) -> Result<(Vec<u8>, User)> {
        let user = self.contacts.invite(name)?;
        let new = user.keys.new.as_ref().ok_or(RatchetError::InvalidUser(user.id))?;
        let public = new.public_view()?;
        let blob = primitives::envelope_seal(
            &primitives::passphrase_key(passphrase),
            &public.to_bytes(),
        )?;
        debug!("invited {} as {}", name, user.id);
        Ok((blob, user))
    }

    /// Accept an invitation blob. Registers the peer as
    /// InvitationReceived: their advertised generation in `crt`, a fresh
    /// local generation in `new`.
    pub fn receive_invitation(
        &mut self,
        blob: &[u8],
        name: &str,
        passphrase: &str,
    ) -> Result<User> {
        let plain =
            primitives::envelope_open(&primitives::passphrase_key(passphrase), blob)?;
        let crt = KeySet::from_bytes(&plain)?;
        let user = self.contacts.receive_invitation(name, crt)?;
        debug!("accepted invitation from {} as {}", name, user.id);
        Ok(user)
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Encrypt `plain` for the user with stable id `id`. Does not mutate
    /// local state: our `new` rotates only when the peer's next message
    /// confirms they installed it.
    pub fn send(&self, plain: &[u8], id: UserId) -> Result<Vec<u8>> {
        let user = self
            .contacts
            .find_by_id(id)
            .ok_or(RatchetError::UserNotFound(id))?;
        match user.status() {
            UserStatus::Normal | UserStatus::InvitationReceived => {}
            UserStatus::InvitationSent => {
                return Err(RatchetError::InvitationNotConfirmed(id))
            }
            UserStatus::Invalid => return Err(RatchetError::InvalidUser(id)),
        }
        // status() guarantees both slots
        let crt = user.keys.crt.as_ref().ok_or(RatchetError::InvalidUser(id))?;
        let new = user.keys.new.as_ref().ok_or(RatchetError::InvalidUser(id))?;

        let mut rng = OsRng;
        let dynamic_id = crt.dynamic_ids[rng.gen_range(0..crt.dynamic_ids.len())];
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let mut exchange_key = [0u8; AES_KEY_LEN];
        rng.fill_bytes(&mut exchange_key);

        // exchange section: our next generation, public side
        let exchange_plain = new.public_view()?.to_bytes();
        let exchange_hash = primitives::sha256(&exchange_plain);
        let exchange_cipher = primitives::ccm_encrypt(&exchange_key, &nonce, &exchange_plain)?;

        let mut key_block = Vec::with_capacity(AES_KEY_LEN + 2);
        key_block.extend_from_slice(&exchange_key);
        key_block.extend_from_slice(&(exchange_cipher.len() as u16).to_le_bytes());
        let key_cipher = primitives::rsa_oaep_encrypt(&crt.rsa_key, &key_block)?;

        let body_hash = primitives::sha256(plain);
        let body_cipher = primitives::ccm_encrypt(&crt.aes_key, &nonce, plain)?;

        let mut out = Vec::with_capacity(plain.len() + ENVELOPE_OVERHEAD);
        out.extend_from_slice(dynamic_id.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&key_cipher);
        out.extend_from_slice(&exchange_cipher);
        out.extend_from_slice(&exchange_hash);
        out.extend_from_slice(&body_cipher);
        out.extend_from_slice(&body_hash);
        Ok(out)
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Decrypt an inbound message, rotating the sender's key window when
    /// the message was sent against our latest advertised generation.
    /// Returns the plaintext and the (possibly rotated) user.
    pub fn receive(&mut self, cipher: &[u8]) -> Result<(Vec<u8>, User)> {
        let mut r = ByteReader::new(cipher);

        let dynamic_id = DynamicId::from_bytes(r.read_array()?);
        let (found, refresh) = self.contacts.find_by_dynamic_id(dynamic_id);
        let Some(found) = found else {
            // A token from a peer's current set marks traffic we
            // addressed to them, not traffic for us. Against an entry
            // with no past generation (a pending pairing) that spurious
            // message has no key to decrypt the body with; surface the
            // state error here instead of faulting deep in the decrypt.
            if self.spurious_peer_token(dynamic_id) {
                return Err(RatchetError::InvalidState);
            }
            return Err(RatchetError::UnknownDynamicId(dynamic_id));
        };
        let mut user = found.clone();

        let nonce: [u8; NONCE_LEN] = r.read_array()?;

        // The sender encrypted against the public key we advertised as
        // `new`, so the matching private key lives there.
        let new = user.keys.new.as_ref().ok_or(RatchetError::InvalidUser(user.id))?;
        let key_cipher = r.read_vec(RSA_BLOCK_LEN)?;
        let key_block = primitives::rsa_oaep_decrypt(&new.rsa_key, &key_cipher)?;
        let mut kb = ByteReader::new(&key_block);
        let exchange_key: [u8; AES_KEY_LEN] = kb.read_array()?;
        let exchange_len = kb.read_u16()? as usize;

        let exchange_cipher = r.read_vec(exchange_len)?;
        let exchange_plain = primitives::ccm_decrypt(&exchange_key, &nonce, &exchange_cipher)?;
        let received_hash: [u8; SHA_LEN] = r.read_array()?;
        let expected_hash = primitives::sha256(&exchange_plain);
        if !bool::from(expected_hash.as_slice().ct_eq(received_hash.as_slice())) {
            return Err(RatchetError::ExchangeHashMismatch);
        }

        if refresh {
            // The peer confirmed our latest generation: promote it to
            // `pst`, install theirs as `crt`, advertise a fresh `new`.
            let mut ex = ByteReader::new(&exchange_plain);
            let aes_key: [u8; AES_KEY_LEN] = ex.read_array()?;
            let mut dynamic_ids = Vec::with_capacity(DYNAMIC_ID_COUNT);
            for _ in 0..DYNAMIC_ID_COUNT {
                dynamic_ids.push(DynamicId::from_bytes(ex.read_array()?));
            }
            let rsa_key = ex.read_remaining().to_vec();
            let delivered = KeySet {
                aes_key,
                rsa_key,
                dynamic_ids,
            };

            let fresh = KeySet::generate(self.contacts.generate_dynamic_ids())?;
            user.keys.pst = user.keys.new.take();
            user.keys.crt = Some(delivered);
            user.keys.new = Some(fresh);
            debug!("rotated key window for user {}", user.id);
        }
        // Without the refresh flag the sender used stale state; the
        // exchange section is authenticated but carries nothing new.

        let rest = r.read_remaining();
        if rest.len() < SHA_LEN {
            return Err(RatchetError::Malformed(CodecError::UnexpectedEof {
                wanted: SHA_LEN,
                have: rest.len(),
            }));
        }
        let (body_cipher, body_hash) = rest.split_at(rest.len() - SHA_LEN);

        // Rotation first, body second: on the refresh path the body key
        // just moved into `pst`; on the non-refresh path it already
        // lived there.
        let pst = user.keys.pst.as_ref().ok_or(RatchetError::InvalidState)?;
        let plain = primitives::ccm_decrypt(&pst.aes_key, &nonce, body_cipher)?;
        if !bool::from(primitives::sha256(&plain).as_slice().ct_eq(body_hash)) {
            return Err(RatchetError::BodyHashMismatch);
        }

        self.contacts.update_user(user.clone())?;
        Ok((plain, user))
    }

    /// True when `id` belongs to the current set of a peer we have no
    /// past generation for: a non-refresh message that nothing local
    /// can decrypt.
    fn spurious_peer_token(&self, id: DynamicId) -> bool {
        self.contacts.users().iter().any(|user| {
            user.keys.pst.is_none()
                && user
                    .keys
                    .crt
                    .as_ref()
                    .is_some_and(|crt| crt.dynamic_ids.contains(&id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ratchet(dir: &TempDir, name: &str) -> Ratchet {
        Ratchet::new(Contacts::create(dir.path().join(name), "Hello, World").unwrap())
    }

    // The full pairing flow from both sides: invite, accept, first
    // message each way, then tampering checks against an established
    // session. One test so the expensive RSA keygens are paid once.
    #[test]
    fn pairing_message_flow() {
        let dir = TempDir::new().unwrap();
        let key = "Hello, World";
        let mut alice = ratchet(&dir, "alice.db");
        let mut bob = ratchet(&dir, "bob.db");

        let (invitation, bob_at_alice) = alice.invite("TestUser2", key).unwrap();
        let alice_at_bob = bob
            .receive_invitation(&invitation, "TestUser1", key)
            .unwrap();
        assert_eq!(bob_at_alice.status(), UserStatus::InvitationSent);
        assert_eq!(alice_at_bob.status(), UserStatus::InvitationReceived);

        // the inviter cannot send until the peer has confirmed
        assert!(matches!(
            alice.send(b"x", bob_at_alice.id),
            Err(RatchetError::InvitationNotConfirmed(_))
        ));

        // first message, invitee to inviter
        let msg = bob.send(b"ping", alice_at_bob.id).unwrap();
        assert_eq!(msg.len(), b"ping".len() + ENVELOPE_OVERHEAD);
        let (plain, bob_rotated) = alice.receive(&msg).unwrap();
        assert_eq!(plain, b"ping");
        assert_eq!(bob_rotated.id, bob_at_alice.id);
        assert_eq!(bob_rotated.status(), UserStatus::Normal);

        // reply, inviter to invitee
        let msg = alice.send(b"pong", bob_at_alice.id).unwrap();
        let (plain, alice_rotated) = bob.receive(&msg).unwrap();
        assert_eq!(plain, b"pong");
        assert_eq!(alice_rotated.id, alice_at_bob.id);
        assert_eq!(alice_rotated.status(), UserStatus::Normal);

        // both directions keep working across further rotations
        let msg = bob.send(b"again", alice_at_bob.id).unwrap();
        let (plain, _) = alice.receive(&msg).unwrap();
        assert_eq!(plain, b"again");

        // tampering with the trailing body hash
        let good = alice.send(b"secret", bob_at_alice.id).unwrap();
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert!(matches!(
            bob.receive(&bad),
            Err(RatchetError::BodyHashMismatch)
        ));

        // tampering with the clear exchange hash
        let mut bad = good.clone();
        let hash_at = DYNAMIC_ID_LEN
            + NONCE_LEN
            + RSA_BLOCK_LEN
            + EXCHANGE_PLAIN_LEN
            + CCM_TAG_LEN;
        bad[hash_at] ^= 1;
        assert!(matches!(
            bob.receive(&bad),
            Err(RatchetError::ExchangeHashMismatch)
        ));

        // intact message still decrypts after the failed attempts
        let (plain, _) = bob.receive(&good).unwrap();
        assert_eq!(plain, b"secret");
    }

    // Spec §4.3 open question: a non-refresh message against a user
    // with no past generation must surface a clean state error. Right
    // after accepting an invitation, Bob's entry for Alice has `new`
    // and `crt` but no `pst`; the only non-refresh ciphertext
    // addressable at him carries one of his peer's current tokens,
    // i.e. an outbound message fed back in.
    #[test]
    fn non_refresh_without_past_generation_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let key = "Hello, World";
        let mut alice = ratchet(&dir, "alice.db");
        let mut bob = ratchet(&dir, "bob.db");

        let (invitation, _) = alice.invite("TestUser2", key).unwrap();
        let alice_at_bob = bob
            .receive_invitation(&invitation, "TestUser1", key)
            .unwrap();
        assert_eq!(alice_at_bob.status(), UserStatus::InvitationReceived);

        let echoed = bob.send(b"hello", alice_at_bob.id).unwrap();
        assert!(matches!(
            bob.receive(&echoed),
            Err(RatchetError::InvalidState)
        ));

        // the spurious message leaves the pairing untouched
        let entry = bob.contacts().find_by_id(alice_at_bob.id).unwrap();
        assert_eq!(entry.status(), UserStatus::InvitationReceived);
    }

    #[test]
    fn unknown_dynamic_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ratchet = ratchet(&dir, "contacts.db");
        let cipher = vec![0xA5u8; 600];
        assert!(matches!(
            ratchet.receive(&cipher),
            Err(RatchetError::UnknownDynamicId(_))
        ));
    }
}
