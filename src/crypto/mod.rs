pub mod primitives;
pub mod ratchet;

pub use ratchet::Ratchet;
