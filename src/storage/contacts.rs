//! Encrypted contacts store.
//!
//! The full user list is framed into one little-endian blob and sealed
//! with AES-256-GCM under SHA-256(passphrase). The file is read in full
//! at open and atomically replaced at save; a handle assumes exclusive
//! access for its lifetime.
//!
//! Two uniqueness invariants are enforced at generation time:
//! - every stable id is unique within the store;
//! - every dynamic id across all users' `new` and `pst` slots is unique,
//!   so reverse lookup by dynamic id can never be ambiguous.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::codec::{ByteReader, ByteWriter, CodecError};
use crate::crypto::primitives::{self, CryptoError};
use crate::types::{DynamicId, KeySet, KeySets, User, UserId};
use crate::{AES_KEY_LEN, DYNAMIC_ID_COUNT};

#[derive(Debug, Error)]
pub enum ContactsError {
    #[error("bad passphrase or corrupted contacts file")]
    BadPassphrase,

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed contacts data: {0}")]
    Malformed(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, ContactsError>;

pub struct Contacts {
    users: Vec<User>,
    file_key: [u8; AES_KEY_LEN],
    path: PathBuf,
}

impl Contacts {
    /// Create an empty store, truncating anything already at `path`.
    pub fn create(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let contacts = Self {
            users: Vec::new(),
            file_key: primitives::passphrase_key(passphrase),
            path: path.into(),
        };
        contacts.save()?;
        Ok(contacts)
    }

    /// Open and decrypt an existing store. A wrong passphrase and a
    /// corrupted file are indistinguishable: the envelope fails
    /// authentication either way.
    pub fn open(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let path = path.into();
        let sealed = fs::read(&path)?;
        let file_key = primitives::passphrase_key(passphrase);
        let plain = primitives::envelope_open(&file_key, &sealed)
            .map_err(|_| ContactsError::BadPassphrase)?;
        let users = Self::parse_users(&plain)?;
        debug!("opened {} with {} users", path.display(), users.len());
        Ok(Self {
            users,
            file_key,
            path,
        })
    }

    /// Serialize, seal, and atomically replace the backing file.
    pub fn save(&self) -> Result<()> {
        let sealed = primitives::envelope_seal(&self.file_key, &self.serialize_users())?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &sealed)?;
        fs::rename(&tmp, &self.path)?;
        debug!("saved {} users to {}", self.users.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    /// `users_count(2) ‖ (user_len(2) ‖ user_bytes)*`
    fn serialize_users(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u16(self.users.len() as u16);
        for user in &self.users {
            let bytes = user.to_bytes();
            w.put_u16(bytes.len() as u16);
            w.put_bytes(&bytes);
        }
        w.into_bytes()
    }

    fn parse_users(data: &[u8]) -> std::result::Result<Vec<User>, CodecError> {
        let mut r = ByteReader::new(data);
        let count = r.read_u16()? as usize;
        let mut users = Vec::with_capacity(count);
        for _ in 0..count {
            let len = r.read_u16()? as usize;
            users.push(User::from_bytes(&r.read_vec(len)?)?);
        }
        Ok(users)
    }

    /// Register a peer we are inviting: fresh stable id, fresh owned
    /// key set, empty `crt`/`pst` (InvitationSent).
    pub fn invite(&mut self, name: &str) -> Result<User> {
        let keys = KeySets {
            new: Some(KeySet::generate(self.generate_dynamic_ids())?),
            crt: None,
            pst: None,
        };
        let user = User {
            id: self.generate_id(),
            name: name.to_string(),
            keys,
        };
        self.users.push(user.clone());
        Ok(user)
    }

    /// Register a peer whose invitation we received: like [`invite`],
    /// but their advertised key set lands in `crt` (InvitationReceived).
    ///
    /// [`invite`]: Contacts::invite
    pub fn receive_invitation(&mut self, name: &str, crt: KeySet) -> Result<User> {
        let keys = KeySets {
            new: Some(KeySet::generate(self.generate_dynamic_ids())?),
            crt: Some(crt),
            pst: None,
        };
        let user = User {
            id: self.generate_id(),
            name: name.to_string(),
            keys,
        };
        self.users.push(user.clone());
        Ok(user)
    }

    pub fn find_by_id(&self, id: UserId) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    /// First user with this name, in insertion order. Names are not
    /// required to be unique; the stable id is the real key.
    pub fn find_by_name(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Reverse lookup for an inbound message. Per user, `pst` ids match
    /// first (the sender used a generation we already promoted, no
    /// refresh needed), then `new` ids (the sender used our latest
    /// advertised generation, so the message delivers a refresh).
    pub fn find_by_dynamic_id(&self, id: DynamicId) -> (Option<&User>, bool) {
        for user in &self.users {
            if let Some(pst) = &user.keys.pst {
                if pst.dynamic_ids.contains(&id) {
                    return (Some(user), false);
                }
            }
            if let Some(new) = &user.keys.new {
                if new.dynamic_ids.contains(&id) {
                    return (Some(user), true);
                }
            }
        }
        (None, false)
    }

    /// Replace the stored user with the same stable id.
    pub fn update_user(&mut self, updated: User) -> Result<()> {
        match self.users.iter_mut().find(|u| u.id == updated.id) {
            Some(slot) => {
                *slot = updated;
                Ok(())
            }
            None => Err(ContactsError::UserNotFound(updated.id)),
        }
    }

    /// Uniformly random stable id, rejection-sampled against the store.
    pub fn generate_id(&self) -> UserId {
        loop {
            let id = UserId::random(&mut OsRng);
            if self.find_by_id(id).is_none() {
                return id;
            }
        }
    }

    /// 32 fresh dynamic ids, unique within the batch and against every
    /// dynamic id currently live in any user's `new` or `pst` slot.
    pub fn generate_dynamic_ids(&self) -> Vec<DynamicId> {
        let mut fresh = Vec::with_capacity(DYNAMIC_ID_COUNT);
        while fresh.len() < DYNAMIC_ID_COUNT {
            let id = DynamicId::random(&mut OsRng);
            if fresh.contains(&id) || self.dynamic_id_in_use(id) {
                continue;
            }
            fresh.push(id);
        }
        fresh
    }

    fn dynamic_id_in_use(&self, id: DynamicId) -> bool {
        self.users.iter().any(|user| {
            [&user.keys.new, &user.keys.pst].into_iter().any(|slot| {
                slot.as_ref()
                    .is_some_and(|keyset| keyset.dynamic_ids.contains(&id))
            })
        })
    }
}
