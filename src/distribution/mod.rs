//! Chunk distributor.
//!
//! One logical message is split across chunks sized by the caller (the
//! stego engine's capacity plan), each prefixed with a 32-byte envelope:
//! `msg_id(8 random) ‖ total(8) ‖ index(8) ‖ timestamp(8)`, all integers
//! little-endian. The message id is random and never recorded; 8 bytes
//! is enough to keep concurrent messages apart.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Envelope prepended to every chunk.
pub const CHUNK_HEADER_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    #[error("chunk lengths sum to {expected} but the data is {actual} bytes")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid chunk size: {0} < 32")]
    BadChunkSize(usize),

    #[error("chunk timestamp {timestamp} is in the future (now {now})")]
    FutureTimestamp { timestamp: u64, now: u64 },

    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u64, total: u64 },

    #[error("no chunks to merge")]
    Empty,

    #[error("chunks belong to {0} different messages")]
    MultipleMessages(usize),

    #[error("repeated chunk index {0}")]
    Duplicate(u64),

    #[error("incomplete message: {have} of {total} chunks")]
    Incomplete { have: u64, total: u64 },
}

pub type Result<T> = std::result::Result<T, DistributionError>;

/// Identity of one logical message. Unique per `split` call thanks to
/// the random id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageTag {
    pub msg_id: [u8; 8],
    pub total: u64,
    pub timestamp: u64,
}

fn unix_now() -> u64 {
    // a clock before the epoch reads as 0
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Split `data` into chunks of exactly `chunk_lengths` payload bytes,
/// each carrying the shared envelope. The lengths must cover the data
/// exactly.
pub fn split(data: &[u8], chunk_lengths: &[usize]) -> Result<Vec<Vec<u8>>> {
    let expected: usize = chunk_lengths.iter().sum();
    if expected != data.len() {
        return Err(DistributionError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }

    let mut msg_id = [0u8; 8];
    OsRng.fill_bytes(&mut msg_id);
    let timestamp = unix_now();
    let total = chunk_lengths.len() as u64;

    let mut chunks = Vec::with_capacity(chunk_lengths.len());
    let mut offset = 0usize;
    for (index, &len) in chunk_lengths.iter().enumerate() {
        let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + len);
        chunk.extend_from_slice(&msg_id);
        chunk.extend_from_slice(&total.to_le_bytes());
        chunk.extend_from_slice(&(index as u64).to_le_bytes());
        chunk.extend_from_slice(&timestamp.to_le_bytes());
        chunk.extend_from_slice(&data[offset..offset + len]);
        offset += len;
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Group chunks by message and sort each group by index, validating
/// every envelope. Returns `{tag: [(index, payload), ...]}` with each
/// group in ascending index order.
pub fn check(chunks: &[Vec<u8>]) -> Result<BTreeMap<MessageTag, Vec<(u64, Vec<u8>)>>> {
    let now = unix_now();
    let mut groups: BTreeMap<MessageTag, Vec<(u64, Vec<u8>)>> = BTreeMap::new();

    for chunk in chunks {
        if chunk.len() < CHUNK_HEADER_LEN {
            return Err(DistributionError::BadChunkSize(chunk.len()));
        }
        let mut msg_id = [0u8; 8];
        msg_id.copy_from_slice(&chunk[..8]);
        let total = le_u64(&chunk[8..16]);
        let index = le_u64(&chunk[16..24]);
        let timestamp = le_u64(&chunk[24..32]);

        if timestamp > now {
            return Err(DistributionError::FutureTimestamp { timestamp, now });
        }
        if index >= total {
            return Err(DistributionError::IndexOutOfRange { index, total });
        }

        groups
            .entry(MessageTag {
                msg_id,
                total,
                timestamp,
            })
            .or_default()
            .push((index, chunk[CHUNK_HEADER_LEN..].to_vec()));
    }

    for group in groups.values_mut() {
        group.sort_by_key(|(index, _)| *index);
    }
    Ok(groups)
}

/// Reassemble exactly one complete message from its chunks.
pub fn merge(chunks: &[Vec<u8>]) -> Result<Vec<u8>> {
    if chunks.is_empty() {
        return Err(DistributionError::Empty);
    }

    let mut groups = check(chunks)?;
    if groups.len() > 1 {
        return Err(DistributionError::MultipleMessages(groups.len()));
    }
    let (tag, group) = groups.pop_first().ok_or(DistributionError::Empty)?;

    for pair in group.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(DistributionError::Duplicate(pair[0].0));
        }
    }
    if group.len() as u64 != tag.total {
        return Err(DistributionError::Incomplete {
            have: group.len() as u64,
            total: tag.total,
        });
    }
    // sorted, distinct, all below total, count equal: indices are 0..total

    let mut data = Vec::new();
    for (_, payload) in group {
        data.extend_from_slice(&payload);
    }
    Ok(data)
}
