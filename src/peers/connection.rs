use super::{PeerAddr, PeerAlert, PeerAlertSender, PeerCommand, PeerStream};
use crate::peer_protocol::codec::{self, PeerFrames, PeerMessage};
use crate::peer_protocol::handshake::PeerHandshake;
use crate::prelude::*;
use crate::peers::rate::RateEstimator;
use crate::torrent::{InfoHash, PeerId};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Duration, Instant};

/// Remote requests queued beyond this are dropped so a greedy peer cannot
/// stall the frame-processing loop.
const MAX_PENDING_SERVES: usize = 16;

const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Disconnected,
}

pub struct PeerConnector<S: PeerStream> {
    peer_addr: PeerAddr,
    stream: S,
}

impl PeerConnector<TcpStream> {
    #[instrument(name = "connect to peer", level = "info", fields(%peer_addr), skip_all)]
    pub async fn connect(peer_addr: PeerAddr) -> anyhow::Result<Self> {
        info!("connecting to peer");
        let stream = TcpStream::connect(peer_addr).await.inspect_err(|_| {
            error!("failed to connect to peer");
        })?;

        Ok(Self::from_parts(peer_addr, stream))
    }
}

impl<S: PeerStream> PeerConnector<S> {
    pub fn from_parts(peer_addr: PeerAddr, stream: S) -> Self {
        Self { peer_addr, stream }
    }

    /// Exchanges the fixed 68-byte preambles and verifies the remote is
    /// speaking the same protocol about the same content set.
    #[instrument(name = "handshake mode", level = "info", skip_all)]
    pub async fn handshake(self, handshake: PeerHandshake) -> anyhow::Result<PeerLink<S>> {
        let Self {
            peer_addr,
            mut stream,
        } = self;
        let local_info_hash = handshake.info_hash.clone();
        let mut bytes = handshake.into_bytes();

        info!("sending handshake to peer");
        stream.write_all(&bytes).await?;

        info!("waiting for peer handshake");
        stream.read_exact(&mut bytes).await?;

        let handshake = PeerHandshake::from_bytes(bytes)?;
        if handshake.info_hash != local_info_hash {
            anyhow::bail!(
                "peer answered for a different content set: {}",
                handshake.info_hash
            );
        }
        info!("peer handshake received");
        debug!(peer_handshake_reply = ?handshake);

        let supports_extensions = handshake.supports_extensions();
        Ok(PeerLink {
            peer_addr,
            remote_id: handshake.peer_id,
            supports_extensions,
            stream,
        })
    }
}

/// A handshaken transport, ready to be upgraded into the steady-state
/// message loop.
#[derive(Debug)]
pub struct PeerLink<S: PeerStream> {
    pub peer_addr: PeerAddr,
    pub remote_id: PeerId,
    pub supports_extensions: bool,
    pub stream: S,
}

/// One duplex peer connection in its steady state: parses inbound frames
/// into alerts for the session, turns session commands into outbound
/// frames, keeps the link alive and samples transfer rates.
pub struct PeerConnection<S: PeerStream> {
    addr: PeerAddr,
    remote_id: PeerId,
    supports_extensions: bool,
    frames: PeerFrames<S>,
    commands_rx: mpsc::Receiver<PeerCommand>,
    alerts_tx: PeerAlertSender,
    remote_choked_us: bool,
    remote_interested: bool,
    am_interested: bool,
    pending_serves: usize,
    download_rate: RateEstimator,
    upload_rate: RateEstimator,
    keep_alive_period: Duration,
    keep_alive_deadline: Instant,
}

impl<S: PeerStream> PeerConnection<S> {
    pub fn new(
        link: PeerLink<S>,
        commands_rx: mpsc::Receiver<PeerCommand>,
        alerts_tx: PeerAlertSender,
        keep_alive_period: Duration,
    ) -> Self {
        let PeerLink {
            peer_addr,
            remote_id,
            supports_extensions,
            stream,
        } = link;
        Self {
            addr: peer_addr,
            remote_id,
            supports_extensions,
            frames: codec::upgrade_stream(stream),
            commands_rx,
            alerts_tx,
            remote_choked_us: true,
            remote_interested: false,
            am_interested: false,
            pending_serves: 0,
            download_rate: RateEstimator::new(RATE_SAMPLE_INTERVAL.as_secs_f64()),
            upload_rate: RateEstimator::new(RATE_SAMPLE_INTERVAL.as_secs_f64()),
            keep_alive_period,
            keep_alive_deadline: Instant::now() + keep_alive_period,
        }
    }

    /// Runs the steady-state loop until the remote closes (returns
    /// `Ok(true)`), the session orders a shutdown (`Ok(false)`), or a
    /// protocol/transport failure surfaces (`Err`).
    #[instrument(name = "peer loop", level = "info", fields(addr = %self.addr), skip_all)]
    pub async fn run(
        &mut self,
        local_bitfield: Vec<u8>,
        extended_handshake: Option<Vec<u8>>,
    ) -> anyhow::Result<bool> {
        self.alerts_tx
            .send(PeerAlert::Connected {
                addr: self.addr,
                remote_id: self.remote_id.clone(),
                supports_extensions: self.supports_extensions,
            })
            .await?;

        self.send(Some(PeerMessage::Bitfield(local_bitfield))).await?;
        if self.supports_extensions {
            if let Some(payload) = extended_handshake {
                debug!("sending extended capability handshake");
                self.send(Some(PeerMessage::Extended { code: 0, payload }))
                    .await?;
            }
        }

        let mut rate_tick = interval(RATE_SAMPLE_INTERVAL);
        rate_tick.reset();

        enum Wake {
            Frame(Option<anyhow::Result<Option<PeerMessage>>>),
            Command(Option<PeerCommand>),
            KeepAlive,
            RateTick,
        }

        loop {
            // borrow the channels apart from the rest of the connection so
            // the handlers below get the whole &mut self back.
            let wake = {
                let Self {
                    frames,
                    commands_rx,
                    keep_alive_deadline,
                    ..
                } = &mut *self;
                tokio::select! {
                    frame = frames.next() => Wake::Frame(frame),
                    command = commands_rx.recv() => Wake::Command(command),
                    _ = sleep_until(*keep_alive_deadline) => Wake::KeepAlive,
                    _ = rate_tick.tick() => Wake::RateTick,
                }
            };

            match wake {
                Wake::Frame(None) => {
                    info!("peer closed connection");
                    return Ok(true);
                }
                Wake::Frame(Some(Err(violation))) => return Err(violation),
                Wake::Frame(Some(Ok(None))) => trace!("keep-alive received"),
                Wake::Frame(Some(Ok(Some(msg)))) => self.handle_message(msg).await?,

                Wake::Command(Some(command)) => {
                    if !self.handle_command(command).await? {
                        info!("received shutdown signal, shutting down");
                        return Ok(false);
                    }
                }
                // session went away; nothing left to drive this connection.
                Wake::Command(None) => {
                    info!("command channel closed, shutting down");
                    return Ok(false);
                }

                Wake::KeepAlive => {
                    trace!("idle period elapsed, sending keep-alive");
                    self.send(None).await?;
                }

                Wake::RateTick => {
                    let download = self.download_rate.sample();
                    let upload = self.upload_rate.sample();
                    self.alerts_tx
                        .send(PeerAlert::Rates {
                            addr: self.addr,
                            download,
                            upload,
                        })
                        .await?;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: PeerMessage) -> anyhow::Result<()> {
        type PM = PeerMessage;
        match msg {
            PM::Choke => {
                debug!("peer choked us");
                self.remote_choked_us = true;
                self.alert(PeerAlert::Choked { addr: self.addr }).await?;
            }
            PM::Unchoke => {
                debug!("peer unchoked us");
                self.remote_choked_us = false;
                if self.am_interested {
                    self.alert(PeerAlert::Ready { addr: self.addr }).await?;
                }
            }
            PM::Interested => {
                self.remote_interested = true;
                debug!("peer interested in us: {}", self.remote_interested);
            }
            PM::NotInterested => {
                self.remote_interested = false;
                debug!("peer interested in us: {}", self.remote_interested);
            }
            PM::Have(index) => {
                self.alert(PeerAlert::AvailabilityGained {
                    addr: self.addr,
                    index,
                })
                .await?;
            }
            PM::Bitfield(bitfield) => {
                self.alert(PeerAlert::AvailabilityReplaced {
                    addr: self.addr,
                    bitfield,
                })
                .await?;
            }
            PM::Request {
                index,
                begin,
                length,
            } => {
                if self.pending_serves >= MAX_PENDING_SERVES {
                    warn!("dropping remote request, serve queue full");
                    return Ok(());
                }
                self.pending_serves += 1;
                self.alert(PeerAlert::ChunkRequested {
                    addr: self.addr,
                    index,
                    begin,
                    length,
                })
                .await?;
            }
            PM::Piece {
                index,
                begin,
                chunk,
            } => {
                self.download_rate.record(chunk.len());
                self.alert(PeerAlert::ChunkReceived {
                    addr: self.addr,
                    index,
                    begin,
                    chunk,
                })
                .await?;
            }
            msg @ (PM::Cancel { .. } | PM::Port(_)) => {
                debug!("ignoring advisory message {:?}", msg);
            }
            PM::Extended { code, payload } => {
                self.alert(PeerAlert::Extended {
                    addr: self.addr,
                    code,
                    payload,
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: PeerCommand) -> anyhow::Result<bool> {
        type PC = PeerCommand;
        match command {
            PC::Request {
                index,
                begin,
                length,
            } => {
                trace!("requesting chunk {} of piece {}", begin, index);
                self.send(Some(PeerMessage::Request {
                    index,
                    begin,
                    length,
                }))
                .await?;
            }
            PC::SetInterested(interested) => {
                if interested && !self.am_interested {
                    debug!("sending unchoke and interested");
                    self.am_interested = true;
                    // reciprocate up front so the remote can request from
                    // us as well; there is no choking policy beyond this.
                    self.send(Some(PeerMessage::Unchoke)).await?;
                    self.send(Some(PeerMessage::Interested)).await?;
                    if !self.remote_choked_us {
                        self.alert(PeerAlert::Ready { addr: self.addr }).await?;
                    }
                } else if !interested && self.am_interested {
                    debug!("sending not interested");
                    self.am_interested = false;
                    self.send(Some(PeerMessage::NotInterested)).await?;
                }
            }
            PC::Have(index) => {
                self.send(Some(PeerMessage::Have(index))).await?;
            }
            PC::ServeChunk {
                index,
                begin,
                chunk,
            } => {
                self.pending_serves = self.pending_serves.saturating_sub(1);
                self.upload_rate.record(chunk.len());
                self.send(Some(PeerMessage::Piece {
                    index,
                    begin,
                    chunk,
                }))
                .await?;
            }
            PC::DeclineServe => {
                self.pending_serves = self.pending_serves.saturating_sub(1);
            }
            PC::Extended { code, payload } => {
                self.send(Some(PeerMessage::Extended { code, payload }))
                    .await?;
            }
            PC::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    // every real outbound frame also pushes the keep-alive deadline out.
    async fn send(&mut self, frame: Option<PeerMessage>) -> anyhow::Result<()> {
        self.frames.send(frame).await?;
        self.keep_alive_deadline = Instant::now() + self.keep_alive_period;
        Ok(())
    }

    async fn alert(&self, alert: PeerAlert) -> anyhow::Result<()> {
        self.alerts_tx.send(alert).await?;
        Ok(())
    }
}

/// Connects, handshakes and drives one peer to its end of life, reporting
/// the terminal disconnect to the session. Spawned per discovered address.
pub async fn run_peer(
    addr: PeerAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    local_bitfield: Vec<u8>,
    extended_handshake: Option<Vec<u8>>,
    commands_rx: mpsc::Receiver<PeerCommand>,
    alerts_tx: PeerAlertSender,
    keep_alive_period: Duration,
) {
    let outcome = async {
        debug!(state = ?ConnectionState::Connecting, %addr, "peer lifecycle");
        let connector = PeerConnector::connect(addr).await?;

        debug!(state = ?ConnectionState::Handshaking, %addr, "peer lifecycle");
        let link = connector
            .handshake(PeerHandshake::new(info_hash, peer_id))
            .await?;

        debug!(state = ?ConnectionState::Ready, %addr, "peer lifecycle");
        let mut connection =
            PeerConnection::new(link, commands_rx, alerts_tx.clone(), keep_alive_period);
        connection.run(local_bitfield, extended_handshake).await
    }
    .await;
    debug!(state = ?ConnectionState::Disconnected, %addr, "peer lifecycle");

    let clean = match outcome {
        Ok(clean) => clean,
        Err(reason) => {
            warn!("peer {} failed: {:#}", addr, reason);
            false
        }
    };
    let _ = alerts_tx
        .send(PeerAlert::Disconnected { addr, clean })
        .await;
}
