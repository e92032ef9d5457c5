pub mod connection;
pub mod rate;

pub use connection::{run_peer, PeerConnection, PeerConnector, PeerLink};

use crate::torrent::PeerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub type PeerAddr = std::net::SocketAddr;
pub type PieceIndex = usize;
pub type PieceLength = u32;
pub type BlockOffset = u32;
pub type BlockLength = u32;

/// Buffering on the session -> peer command channel.
pub const COMMAND_BUFFER_SIZE: usize = 32;

pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

/// Instructions from the session to one peer connection task.
#[derive(Debug)]
pub enum PeerCommand {
    /// Ask the remote for a chunk.
    Request {
        index: u32,
        begin: BlockOffset,
        length: BlockLength,
    },
    /// Announce or retract local interest.
    SetInterested(bool),
    /// Tell the remote we now have a piece.
    Have(u32),
    /// Answer a previously alerted remote request.
    ServeChunk {
        index: u32,
        begin: BlockOffset,
        chunk: Vec<u8>,
    },
    /// The session will not serve a previously alerted remote request;
    /// frees its serve-queue slot.
    DeclineServe,
    /// Raw extended-channel frame (code already remote-negotiated).
    Extended { code: u8, payload: Vec<u8> },
    Shutdown,
}

/// Events one peer connection task raises towards the session.
#[derive(Debug)]
pub enum PeerAlert {
    /// Handshake completed; steady-state loop is running.
    Connected {
        addr: PeerAddr,
        remote_id: PeerId,
        supports_extensions: bool,
    },
    /// Remote replaced its whole availability map.
    AvailabilityReplaced { addr: PeerAddr, bitfield: Vec<u8> },
    /// Remote gained one piece.
    AvailabilityGained { addr: PeerAddr, index: u32 },
    /// Unchoked while interested: the peer can be asked for chunks.
    Ready { addr: PeerAddr },
    /// Remote choked us; outstanding requests may never be answered.
    Choked { addr: PeerAddr },
    /// A requested chunk arrived.
    ChunkReceived {
        addr: PeerAddr,
        index: u32,
        begin: BlockOffset,
        chunk: Vec<u8>,
    },
    /// Remote asked us for a chunk (already rate-limited by the
    /// connection).
    ChunkRequested {
        addr: PeerAddr,
        index: u32,
        begin: BlockOffset,
        length: BlockLength,
    },
    /// Extended-channel frame received (any code, including the
    /// capability handshake).
    Extended {
        addr: PeerAddr,
        code: u8,
        payload: Vec<u8>,
    },
    /// Periodic transfer-rate sample, bytes per second.
    Rates {
        addr: PeerAddr,
        download: f64,
        upload: f64,
    },
    /// Terminal: the task is gone. `clean` distinguishes an orderly remote
    /// close from a protocol/transport failure.
    Disconnected { addr: PeerAddr, clean: bool },
}

pub type PeerCommandSender = mpsc::Sender<PeerCommand>;
pub type PeerAlertSender = mpsc::Sender<PeerAlert>;
