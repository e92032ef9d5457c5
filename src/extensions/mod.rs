pub mod metadata;

pub use metadata::MetadataExtension;

use crate::peer_protocol::extended::ExtendedHandshake;
use crate::peers::PeerAddr;
use crate::torrent::InfoHash;

/// A capability-negotiated sub-protocol speaking over the extended-message
/// channel. Implementations are injected into the session at construction
/// (never registered globally) and addressed by the capability name they
/// advertise in the extended handshake's `m` map.
pub trait Extension: Send {
    /// Capability name negotiated in the extended handshake.
    fn key(&self) -> &'static str;

    /// A peer finished the extended capability handshake.
    fn on_peer_capabilities(
        &mut self,
        ctx: &mut ExtensionCtx<'_>,
        addr: PeerAddr,
        remote: &ExtendedHandshake,
    ) -> anyhow::Result<()>;

    /// A frame arrived on this extension's negotiated code.
    fn handle_message(
        &mut self,
        ctx: &mut ExtensionCtx<'_>,
        addr: PeerAddr,
        payload: &[u8],
    ) -> anyhow::Result<()>;

    fn on_peer_disconnected(&mut self, addr: PeerAddr);
}

/// An extended-channel frame an extension wants delivered. The session
/// resolves `key` to the code the remote registered for it.
#[derive(Debug)]
pub struct OutboundExtended {
    pub addr: PeerAddr,
    pub key: &'static str,
    pub payload: Vec<u8>,
}

/// What an extension sees of the session while handling an event: the
/// content identifier and an outbox of frames to deliver once the handler
/// returns.
pub struct ExtensionCtx<'a> {
    pub info_hash: &'a InfoHash,
    outbox: Vec<OutboundExtended>,
}

impl<'a> ExtensionCtx<'a> {
    pub fn new(info_hash: &'a InfoHash) -> Self {
        Self {
            info_hash,
            outbox: Vec::new(),
        }
    }

    pub fn send(&mut self, addr: PeerAddr, key: &'static str, payload: Vec<u8>) {
        self.outbox.push(OutboundExtended { addr, key, payload });
    }

    pub fn into_outbox(self) -> Vec<OutboundExtended> {
        self.outbox
    }
}
