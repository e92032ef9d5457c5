use crate::prelude::*;
use crate::torrent::{InfoHash, PeerId};

#[derive(Debug, Clone, PartialEq)]
#[repr(C)] // makes sure the struct fields are arranged in the same order, there's also no padding
           // in between because all the fields are byte aligned. (i.e this can be treated as a
           // simple array of bytes).
pub struct PeerHandshake {
    protocol_prefix_length: u8,
    protocol_prefix: [u8; 19],
    reserved_bytes: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl AsRef<[u8; std::mem::size_of::<PeerHandshake>()]> for PeerHandshake {
    fn as_ref(&self) -> &[u8; std::mem::size_of::<Self>()] {
        unsafe { std::mem::transmute::<&Self, &[u8; std::mem::size_of::<Self>()]>(self) }
    }
}

impl PeerHandshake {
    pub const PROTOCOL_PREFIX: [u8; 19] = *b"BitTorrent protocol";
    pub const HANDSHAKE_SIZE: usize = std::mem::size_of::<Self>();

    // reserved bit announcing support for the extended-message
    // sub-protocol channel.
    const EXTENSION_BYTE: usize = 5;
    const EXTENSION_BIT: u8 = 0x10;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved_bytes = [0; 8];
        reserved_bytes[Self::EXTENSION_BYTE] |= Self::EXTENSION_BIT;
        Self {
            protocol_prefix_length: Self::PROTOCOL_PREFIX.len() as u8,
            protocol_prefix: Self::PROTOCOL_PREFIX,
            reserved_bytes,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved_bytes[Self::EXTENSION_BYTE] & Self::EXTENSION_BIT != 0
    }

    // the unsafe is fine becuase the struct is just plain old data, any sequence of bits is valid.
    pub fn from_bytes(bytes: [u8; std::mem::size_of::<Self>()]) -> anyhow::Result<Self> {
        let handshake =
            unsafe { std::mem::transmute::<[u8; std::mem::size_of::<Self>()], Self>(bytes) };
        if handshake.protocol_prefix != Self::PROTOCOL_PREFIX {
            warn!(
                "unknown protocol prefix in handshake '{}'",
                String::from_utf8_lossy(&handshake.protocol_prefix[..])
            );
            anyhow::bail!("handshake protocol prefix mismatch");
        }

        Ok(handshake)
    }
    // the unsafe is fine becuase the struct is just plain old data, any sequence of bits is valid.
    pub fn into_bytes(self) -> [u8; std::mem::size_of::<Self>()] {
        unsafe { std::mem::transmute::<Self, [u8; std::mem::size_of::<Self>()]>(self) }
    }
}
