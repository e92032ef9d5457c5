mod bitfield;
mod info_hash;
mod peer_id;

pub use bitfield::Bitfield;
pub use info_hash::InfoHash;
pub use peer_id::PeerId;
