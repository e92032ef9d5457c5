use crate::config::Config;
use crate::extensions::{Extension, ExtensionCtx, OutboundExtended};
use crate::metainfo::Metainfo;
use crate::peer_protocol::extended::{ExtendedHandshake, EXTENDED_HANDSHAKE_CODE};
use crate::peers::{
    run_peer, PeerAddr, PeerAlert, PeerCommand, PeerCommandSender, COMMAND_BUFFER_SIZE,
};
use crate::piece::{ChunkOutcome, Piece, CHUNK_LENGTH};
use crate::piece_picker::PiecePicker;
use crate::prelude::*;
use crate::storage::Storage;
use crate::torrent::{Bitfield, InfoHash, PeerId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ALERT_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ready,
    Complete,
    Error,
}

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
}

/// Instructions from the outside world: discovery collaborators feed
/// addresses in, control surfaces stop the session.
#[derive(Debug)]
pub enum SessionCommand {
    AddPeer(PeerAddr),
    Stop,
}

/// The session's view of one peer: the command channel into its connection
/// task plus the request-cycle state the selector works against. Pieces
/// are referenced by index only; the session is the sole owner of the
/// piece array and its bitfields.
struct PeerHandle {
    commands_tx: PeerCommandSender,
    connected: bool,
    remote_id: Option<PeerId>,
    supports_extensions: bool,
    remote_extensions: Option<ExtendedHandshake>,
    availability: Bitfield,
    assigned_pieces: BTreeSet<usize>,
    in_flight: HashMap<(u32, u32), Instant>,
    am_interested: bool,
    ready: bool,
    download_rate: f64,
    upload_rate: f64,
}

impl PeerHandle {
    fn new(commands_tx: PeerCommandSender, piece_count: usize) -> Self {
        Self {
            commands_tx,
            connected: false,
            remote_id: None,
            supports_extensions: false,
            remote_extensions: None,
            availability: Bitfield::new(piece_count),
            assigned_pieces: BTreeSet::new(),
            in_flight: HashMap::new(),
            am_interested: false,
            ready: false,
            download_rate: 0.0,
            upload_rate: 0.0,
        }
    }
}

/// Cloneable handle for feeding a running session commands and stopping
/// it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub commands_tx: mpsc::Sender<SessionCommand>,
    pub shutdown: CancellationToken,
}

/// Orchestrates one content set: owns the pieces, the completion and
/// active bitfields, the backing storage and the peer set, and drives
/// piece selection, chunk routing, have propagation and completion.
pub struct TorrentSession {
    info_hash: InfoHash,
    peer_id: PeerId,
    config: Config,
    name: String,
    pieces: Vec<Piece>,
    completion: Bitfield,
    picker: PiecePicker,
    storage: Storage,
    peers: HashMap<PeerAddr, PeerHandle>,
    extensions: Vec<Box<dyn Extension>>,
    extension_map: BTreeMap<String, u8>,
    metadata_size: u64,
    status: SessionStatus,
    stats: SessionStats,
    rng: StdRng,
    reconnects: HashMap<PeerAddr, u32>,
    alerts_tx: mpsc::Sender<PeerAlert>,
    alerts_rx: Option<mpsc::Receiver<PeerAlert>>,
    commands_tx: mpsc::Sender<SessionCommand>,
    commands_rx: Option<mpsc::Receiver<SessionCommand>>,
    shutdown: CancellationToken,
}

impl TorrentSession {
    /// Builds the session from a decoded descriptor: opens and pre-sizes
    /// storage, constructs the piece array and seeds completion from
    /// whatever valid data is already on disk. Storage failure here is
    /// fatal to the whole session.
    pub async fn create(
        metainfo: &Metainfo,
        config: Config,
        extensions: Vec<Box<dyn Extension>>,
    ) -> anyhow::Result<Self> {
        let info = &metainfo.file_info;
        let info_hash = info.info_hash()?;
        let piece_length = info.piece_length();
        let total_length = info.total_length();
        let hashes = info.piece_hashes();
        anyhow::ensure!(
            hashes.len() as u64 == total_length.div_ceil(piece_length),
            "descriptor carries {} piece digests for {} pieces",
            hashes.len(),
            total_length.div_ceil(piece_length),
        );

        let mut storage = Storage::create(&config.download_root, &info.file_entries()).await?;

        let mut pieces = Vec::with_capacity(hashes.len());
        for (index, hash) in hashes.iter().enumerate() {
            let offset = index as u64 * piece_length;
            let length = std::cmp::min(piece_length, total_length - offset) as u32;
            pieces.push(Piece::new(index, offset, length, *hash));
        }

        // resume: whatever already validates on disk counts as done.
        let mut completion = Bitfield::new(pieces.len());
        for piece in &mut pieces {
            if piece.is_valid(&mut storage).await? {
                piece.mark_complete();
                completion.set(piece.index());
            }
        }
        if completion.cardinality() > 0 {
            info!(
                "resumed with {}/{} pieces already on disk",
                completion.cardinality(),
                pieces.len()
            );
        }

        let extension_map = extensions
            .iter()
            .enumerate()
            .map(|(index, extension)| (extension.key().to_string(), index as u8 + 1))
            .collect();
        let metadata_size = serde_bencode::to_bytes(info)
            .map(|encoded| encoded.len() as u64)
            .unwrap_or(0);

        let piece_count = pieces.len();
        let status = if completion.all_set() {
            SessionStatus::Complete
        } else {
            SessionStatus::Ready
        };
        let (alerts_tx, alerts_rx) = mpsc::channel(ALERT_BUFFER_SIZE);
        let (commands_tx, commands_rx) = mpsc::channel(ALERT_BUFFER_SIZE);

        info!(
            "session ready: {} ({} pieces of {} bytes, info hash {})",
            info.name(),
            piece_count,
            piece_length,
            info_hash
        );
        Ok(Self {
            info_hash,
            peer_id: PeerId::with_random_suffix(),
            config,
            name: info.name().to_string(),
            pieces,
            completion,
            picker: PiecePicker::new(piece_count),
            storage,
            peers: HashMap::new(),
            extensions,
            extension_map,
            metadata_size,
            status,
            stats: SessionStats::default(),
            rng: StdRng::from_entropy(),
            reconnects: HashMap::new(),
            alerts_tx,
            alerts_rx: Some(alerts_rx),
            commands_tx,
            commands_rx: Some(commands_rx),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands_tx: self.commands_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_complete(&self) -> bool {
        self.completion.all_set()
    }

    /// Event loop: peer alerts and session commands, until stopped.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut alerts_rx = self
            .alerts_rx
            .take()
            .expect("session can only be run once");
        let mut commands_rx = self
            .commands_rx
            .take()
            .expect("session can only be run once");
        let shutdown = self.shutdown.clone();

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),

                Some(alert) = alerts_rx.recv() => {
                    if let Err(err) = self.handle_alert(alert).await {
                        break Err(err);
                    }
                }

                Some(command) = commands_rx.recv() => match command {
                    SessionCommand::AddPeer(addr) => self.spawn_peer(addr),
                    SessionCommand::Stop => break Ok(()),
                },
            }
        };

        if let Err(err) = &outcome {
            // whatever was already flushed stays on disk for a future
            // resume; peers and discovery stop here.
            error!("session {} failed: {:#}", self.name, err);
            self.status = SessionStatus::Error;
        }
        self.stop().await;
        outcome
    }

    /// Dials a discovered peer address. Idempotent for already-known
    /// peers.
    pub fn spawn_peer(&mut self, addr: PeerAddr) {
        if self.peers.contains_key(&addr) {
            debug!("peer {} already connected, ignoring", addr);
            return;
        }
        if self.status == SessionStatus::Error {
            return;
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        self.peers
            .insert(addr, PeerHandle::new(commands_tx, self.pieces.len()));

        let extended_handshake = (!self.extension_map.is_empty())
            .then(|| {
                ExtendedHandshake {
                    m: self.extension_map.clone(),
                    port: Some(self.config.listen_port),
                    v: Some(concat!("skein-torrent ", env!("CARGO_PKG_VERSION")).to_string()),
                    metadata_size: Some(self.metadata_size),
                }
                .to_bencode()
                .ok()
            })
            .flatten();

        tokio::spawn(run_peer(
            addr,
            self.info_hash.clone(),
            self.peer_id.clone(),
            self.completion.to_bytes(),
            extended_handshake,
            commands_rx,
            self.alerts_tx.clone(),
            self.config.keep_alive_period,
        ));
    }

    async fn stop(&mut self) {
        info!("stopping session {}", self.name);
        for handle in self.peers.values() {
            let _ = handle.commands_tx.send(PeerCommand::Shutdown).await;
        }
        self.peers.clear();
    }

    async fn handle_alert(&mut self, alert: PeerAlert) -> anyhow::Result<()> {
        match alert {
            PeerAlert::Connected {
                addr,
                remote_id,
                supports_extensions,
            } => {
                debug!("peer {} connected as {}", addr, remote_id);
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.connected = true;
                    handle.remote_id = Some(remote_id);
                    handle.supports_extensions = supports_extensions;
                }
                self.reconnects.remove(&addr);
            }

            PeerAlert::AvailabilityReplaced { addr, bitfield } => {
                let piece_count = self.pieces.len();
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.availability = Bitfield::from_bytes(&bitfield, piece_count);
                }
                self.update_interest(addr).await;
            }

            PeerAlert::AvailabilityGained { addr, index } => {
                if index as usize >= self.pieces.len() {
                    warn!("peer {} announced out-of-range piece {}", addr, index);
                    return Ok(());
                }
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.availability.set(index as usize);
                }
                self.update_interest(addr).await;
            }

            PeerAlert::Ready { addr } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.ready = true;
                }
                self.pump_requests(addr).await;
            }

            PeerAlert::Choked { addr } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.ready = false;
                }
            }

            PeerAlert::ChunkReceived {
                addr,
                index,
                begin,
                chunk,
            } => {
                self.on_chunk(addr, index, begin, chunk).await?;
            }

            PeerAlert::ChunkRequested {
                addr,
                index,
                begin,
                length,
            } => {
                self.serve_chunk(addr, index, begin, length).await;
            }

            PeerAlert::Extended {
                addr,
                code,
                payload,
            } => {
                self.on_extended(addr, code, payload).await;
            }

            PeerAlert::Rates {
                addr,
                download,
                upload,
            } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.download_rate = download;
                    handle.upload_rate = upload;
                }
                self.stats.download_rate =
                    self.peers.values().map(|handle| handle.download_rate).sum();
                self.stats.upload_rate =
                    self.peers.values().map(|handle| handle.upload_rate).sum();
            }

            PeerAlert::Disconnected { addr, clean } => {
                self.on_disconnect(addr, clean);
            }
        }
        Ok(())
    }

    /// Local interest follows what the peer has that we still need:
    /// `peer_has ^ (peer_has & complete)` non-empty.
    async fn update_interest(&mut self, addr: PeerAddr) {
        let Some(handle) = self.peers.get_mut(&addr) else {
            return;
        };
        let wanted = handle
            .availability
            .xor(&handle.availability.and(&self.completion));
        let interested = wanted.any();
        if interested != handle.am_interested {
            debug!(
                "{} in peer {}",
                if interested { "interested" } else { "no longer interested" },
                addr
            );
            handle.am_interested = interested;
            let _ = handle
                .commands_tx
                .send(PeerCommand::SetInterested(interested))
                .await;
        }
    }

    /// Keeps a ready peer's request pipeline full: picks pieces and pulls
    /// chunks until the per-peer budget is reached or the peer has nothing
    /// we can use (in which case interest is withdrawn once its pipeline
    /// drains).
    async fn pump_requests(&mut self, addr: PeerAddr) {
        loop {
            let Some(handle) = self.peers.get_mut(&addr) else {
                return;
            };
            if !handle.connected || !handle.ready {
                return;
            }
            if handle.in_flight.len() >= self.config.max_peer_requests {
                return;
            }

            let Some(piece_index) = self.picker.next_piece(
                &handle.availability,
                &self.pieces,
                &self.completion,
                &mut self.rng,
            ) else {
                if handle.in_flight.is_empty() && handle.am_interested {
                    debug!("no usable pieces at peer {}, withdrawing interest", addr);
                    handle.am_interested = false;
                    let _ = handle
                        .commands_tx
                        .send(PeerCommand::SetInterested(false))
                        .await;
                }
                return;
            };

            let Some((begin, length)) = self.pieces[piece_index].next_chunk() else {
                // everything in that piece is complete or in flight.
                return;
            };

            handle.assigned_pieces.insert(piece_index);
            handle
                .in_flight
                .insert((piece_index as u32, begin), Instant::now());
            if handle
                .commands_tx
                .send(PeerCommand::Request {
                    index: piece_index as u32,
                    begin,
                    length,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    async fn on_chunk(
        &mut self,
        addr: PeerAddr,
        index: u32,
        begin: u32,
        chunk: Vec<u8>,
    ) -> anyhow::Result<()> {
        let Some(handle) = self.peers.get_mut(&addr) else {
            return Ok(());
        };
        if handle.in_flight.remove(&(index, begin)).is_none() {
            warn!(
                "chunk received for inactive request ({}, {}) from {}",
                index, begin, addr
            );
            return Ok(());
        }
        if index as usize >= self.pieces.len() {
            warn!("chunk for out-of-range piece {} from {}", index, addr);
            return Ok(());
        }

        self.stats.downloaded += chunk.len() as u64;
        let piece = &mut self.pieces[index as usize];
        if !piece.is_complete() {
            match piece.set_data(begin, &chunk, &mut self.storage).await {
                Ok(ChunkOutcome::Completed) => self.on_piece_complete(index as usize).await,
                Ok(ChunkOutcome::Invalid) => self.on_piece_invalid(index as usize),
                Ok(_) => {}
                Err(err) => {
                    // chunk bitsets are untouched; the piece stays pending
                    // and the flush will be retried when storage recovers.
                    error!("storage failure saving piece {}: {:#}", index, err);
                }
            }
        }

        // pipelining: a delivered chunk immediately funds the next request.
        self.pump_requests(addr).await;
        Ok(())
    }

    async fn on_piece_complete(&mut self, piece_index: usize) {
        self.completion.set(piece_index);
        self.picker.release(piece_index);

        for handle in self.peers.values_mut() {
            handle.assigned_pieces.remove(&piece_index);
            handle
                .in_flight
                .retain(|(index, _), _| *index as usize != piece_index);
        }

        info!(
            "piece {} durable, progress {}/{}",
            piece_index,
            self.completion.cardinality(),
            self.pieces.len()
        );

        for handle in self.peers.values() {
            if handle.connected {
                let _ = handle
                    .commands_tx
                    .send(PeerCommand::Have(piece_index as u32))
                    .await;
            }
        }

        // completing a piece can extinguish interest in peers that only
        // had that piece.
        let addrs: Vec<_> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr).await;
        }

        if self.completion.all_set() {
            info!("content set {} complete", self.name);
            self.status = SessionStatus::Complete;
        }
    }

    fn on_piece_invalid(&mut self, piece_index: usize) {
        // the piece reset itself; release it back into the selection pool
        // and drop whatever the peers still had in flight against it.
        self.picker.release(piece_index);
        for handle in self.peers.values_mut() {
            handle.assigned_pieces.remove(&piece_index);
            handle
                .in_flight
                .retain(|(index, _), _| *index as usize != piece_index);
        }
    }

    async fn serve_chunk(&mut self, addr: PeerAddr, index: u32, begin: u32, length: u32) {
        let serveable = (index as usize) < self.pieces.len()
            && self.completion.is_set(index as usize)
            && length <= CHUNK_LENGTH
            && begin as u64 + length as u64 <= self.pieces[index as usize].length() as u64;
        let Some(handle) = self.peers.get(&addr) else {
            return;
        };
        if !serveable {
            warn!(
                "declining unserveable request ({}, {}, {}) from {}",
                index, begin, length, addr
            );
            let _ = handle.commands_tx.send(PeerCommand::DeclineServe).await;
            return;
        }

        let offset = self.pieces[index as usize].offset() + begin as u64;
        let mut chunk = vec![0u8; length as usize];
        if let Err(err) = self.storage.read_at_with_retry(offset, &mut chunk).await {
            warn!("failed reading chunk to serve: {:#}", err);
            let _ = handle.commands_tx.send(PeerCommand::DeclineServe).await;
            return;
        }

        self.stats.uploaded += chunk.len() as u64;
        let _ = handle
            .commands_tx
            .send(PeerCommand::ServeChunk {
                index,
                begin,
                chunk,
            })
            .await;
    }

    async fn on_extended(&mut self, addr: PeerAddr, code: u8, payload: Vec<u8>) {
        let mut extensions = std::mem::take(&mut self.extensions);
        let mut ctx = ExtensionCtx::new(&self.info_hash);

        if code == EXTENDED_HANDSHAKE_CODE {
            match ExtendedHandshake::from_bencode(&payload) {
                Ok(remote) => {
                    debug!("peer {} capabilities: {:?}", addr, remote.m);
                    if let Some(handle) = self.peers.get_mut(&addr) {
                        handle.remote_extensions = Some(remote.clone());
                    }
                    for extension in extensions.iter_mut() {
                        if let Err(err) = extension.on_peer_capabilities(&mut ctx, addr, &remote) {
                            warn!(
                                "extension {} failed on capabilities: {:#}",
                                extension.key(),
                                err
                            );
                        }
                    }
                }
                Err(err) => warn!("bad extended handshake from {}: {:#}", addr, err),
            }
        } else {
            // non-zero codes are the ones we advertised: extension n is
            // registered under code n + 1.
            match code
                .checked_sub(1)
                .and_then(|index| extensions.get_mut(index as usize))
            {
                Some(extension) => {
                    if let Err(err) = extension.handle_message(&mut ctx, addr, &payload) {
                        warn!("extension {} failed: {:#}", extension.key(), err);
                    }
                }
                None => warn!("extended message for unregistered code {}", code),
            }
        }

        let outbox = ctx.into_outbox();
        self.extensions = extensions;
        self.flush_extension_outbox(outbox).await;
    }

    async fn flush_extension_outbox(&mut self, outbox: Vec<OutboundExtended>) {
        for OutboundExtended { addr, key, payload } in outbox {
            let Some(handle) = self.peers.get(&addr) else {
                continue;
            };
            let remote_code = handle
                .remote_extensions
                .as_ref()
                .and_then(|remote| remote.code_for(key));
            match remote_code {
                Some(code) => {
                    let _ = handle
                        .commands_tx
                        .send(PeerCommand::Extended { code, payload })
                        .await;
                }
                None => debug!("peer {} does not speak {}, dropping frame", addr, key),
            }
        }
    }

    /// A gone peer releases everything it was working on: its in-flight
    /// chunks become requestable again and its active pieces return to the
    /// selection pool. A clean close while we were still interested earns
    /// a delayed reconnect attempt.
    fn on_disconnect(&mut self, addr: PeerAddr, clean: bool) {
        let Some(handle) = self.peers.remove(&addr) else {
            return;
        };
        debug!("peer {} disconnected (clean: {})", addr, clean);

        for (index, begin) in handle.in_flight.keys() {
            if let Some(piece) = self.pieces.get_mut(*index as usize) {
                piece.cancel_request(*begin);
            }
        }
        for piece_index in &handle.assigned_pieces {
            self.picker.release(*piece_index);
        }
        for extension in self.extensions.iter_mut() {
            extension.on_peer_disconnected(addr);
        }

        if clean && handle.am_interested && self.status == SessionStatus::Ready {
            let attempts = self.reconnects.entry(addr).or_insert(0);
            if *attempts < self.config.max_reconnects {
                *attempts += 1;
                debug!("scheduling reconnect to {} (attempt {})", addr, attempts);
                let commands_tx = self.commands_tx.clone();
                let wait = self.config.reconnect_wait;
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = commands_tx.send(SessionCommand::AddPeer(addr)).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metainfo::DownloadInfo;
    use crate::peer_protocol::extended::METADATA_BLOCK_SIZE;
    use sha1_smol::Sha1;
    use std::net::{Ipv4Addr, SocketAddr};

    fn addr() -> PeerAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 6881))
    }

    fn patterned(length: usize) -> Vec<u8> {
        (0..length).map(|i| (i % 251) as u8).collect()
    }

    fn test_metainfo(name: &str, content: &[u8], piece_length: u64) -> Metainfo {
        let pieces = content
            .chunks(piece_length as usize)
            .map(|piece| Sha1::from(piece).digest().bytes())
            .collect();
        Metainfo {
            announce: None,
            file_info: DownloadInfo::SingleFile {
                filename: name.into(),
                length: content.len() as u64,
                md5sum: None,
                piece_length,
                pieces,
                private: None,
            },
            announce_list: None,
            creation_date: None,
            created_by: None,
            comment: None,
            encoding: None,
        }
    }

    async fn test_session(
        content: &[u8],
        piece_length: u64,
    ) -> (tempfile::TempDir, TorrentSession) {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = test_metainfo("blob.bin", content, piece_length);
        let config = Config {
            download_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        let session = TorrentSession::create(&metainfo, config, Vec::new())
            .await
            .unwrap();
        (dir, session)
    }

    impl TorrentSession {
        fn insert_test_peer(&mut self, addr: PeerAddr) -> mpsc::Receiver<PeerCommand> {
            let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
            let mut handle = PeerHandle::new(commands_tx, self.pieces.len());
            handle.connected = true;
            self.peers.insert(addr, handle);
            commands_rx
        }
    }

    fn drain_requests(
        commands_rx: &mut mpsc::Receiver<PeerCommand>,
        pending: &mut Vec<(u32, u32, u32)>,
        other: &mut Vec<PeerCommand>,
    ) {
        while let Ok(command) = commands_rx.try_recv() {
            match command {
                PeerCommand::Request {
                    index,
                    begin,
                    length,
                } => pending.push((index, begin, length)),
                command => other.push(command),
            }
        }
    }

    // single 1 MiB content set, 262144-byte pieces, 16 chunks per piece:
    // delivering all 16 chunks of piece 0 (in whatever order the pipeline
    // requests them, answered newest-first) must complete exactly piece 0.
    #[tokio::test]
    async fn test_piece_zero_completes_through_alert_cycle() {
        let content = patterned(1 << 20);
        let (_dir, mut session) = test_session(&content, 1 << 18).await;
        assert_eq!(session.pieces.len(), 4);

        let mut commands_rx = session.insert_test_peer(addr());

        // peer only has piece 0.
        session
            .handle_alert(PeerAlert::AvailabilityReplaced {
                addr: addr(),
                bitfield: vec![0b1000_0000],
            })
            .await
            .unwrap();

        let mut pending = Vec::new();
        let mut other = Vec::new();
        drain_requests(&mut commands_rx, &mut pending, &mut other);
        assert!(matches!(other.as_slice(), [PeerCommand::SetInterested(true)]));
        other.clear();

        session
            .handle_alert(PeerAlert::Ready { addr: addr() })
            .await
            .unwrap();
        drain_requests(&mut commands_rx, &mut pending, &mut other);
        assert_eq!(pending.len(), session.config.max_peer_requests);
        assert!(pending.iter().all(|(index, ..)| *index == 0));

        let mut delivered = 0;
        while let Some((index, begin, length)) = pending.pop() {
            session
                .handle_alert(PeerAlert::ChunkReceived {
                    addr: addr(),
                    index,
                    begin,
                    chunk: content[begin as usize..(begin + length) as usize].to_vec(),
                })
                .await
                .unwrap();
            delivered += 1;
            drain_requests(&mut commands_rx, &mut pending, &mut other);
        }

        assert_eq!(delivered, 16);
        assert_eq!(session.completion.set_indices(), vec![0]);
        assert!(session.pieces[0].is_complete());
        assert!(!session.picker.is_active(0));
        assert_eq!(session.stats.downloaded, 1 << 18);

        // completion broadcast a have notice, then interest was withdrawn
        // because the peer has nothing else we need.
        assert!(other.iter().any(|command| matches!(command, PeerCommand::Have(0))));
        assert!(other
            .iter()
            .any(|command| matches!(command, PeerCommand::SetInterested(false))));

        // the finished piece is durable on disk.
        let on_disk = std::fs::read(_dir.path().join("blob.bin")).unwrap();
        assert_eq!(&on_disk[..1 << 18], &content[..1 << 18]);
    }

    // mid-request disconnect: the chunk at (piece 1, offset 32768) must be
    // released for re-request and the piece dropped from the active set.
    #[tokio::test]
    async fn test_disconnect_releases_in_flight_chunks() {
        let content = patterned(1 << 20);
        let (_dir, mut session) = test_session(&content, 1 << 18).await;
        let mut commands_rx = session.insert_test_peer(addr());

        // peer only has piece 1.
        session
            .handle_alert(PeerAlert::AvailabilityReplaced {
                addr: addr(),
                bitfield: vec![0b0100_0000],
            })
            .await
            .unwrap();
        session
            .handle_alert(PeerAlert::Ready { addr: addr() })
            .await
            .unwrap();

        let mut pending = Vec::new();
        let mut other = Vec::new();
        drain_requests(&mut commands_rx, &mut pending, &mut other);
        assert!(pending.contains(&(1, 32_768, CHUNK_LENGTH)));
        assert!(session.picker.is_active(1));
        assert_eq!(
            session.pieces[1].requested_chunk_cardinality(),
            session.config.max_peer_requests
        );

        session
            .handle_alert(PeerAlert::Disconnected {
                addr: addr(),
                clean: false,
            })
            .await
            .unwrap();

        assert!(session.peers.is_empty());
        assert!(!session.picker.is_active(1));
        assert_eq!(session.pieces[1].requested_chunk_cardinality(), 0);
        // the freed chunk can be handed to another peer.
        assert_eq!(session.pieces[1].next_chunk(), Some((0, CHUNK_LENGTH)));
    }

    #[tokio::test]
    async fn test_resume_seeds_completion_from_disk() {
        let content = patterned(1 << 19);
        let piece_length = 1 << 18;

        let dir = tempfile::tempdir().unwrap();
        // piece 0 already on disk, piece 1 zeroed (the file is pre-sized).
        std::fs::write(dir.path().join("blob.bin"), &content[..piece_length]).unwrap();

        let metainfo = test_metainfo("blob.bin", &content, piece_length as u64);
        let config = Config {
            download_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        let session = TorrentSession::create(&metainfo, config, Vec::new())
            .await
            .unwrap();

        assert_eq!(session.completion.set_indices(), vec![0]);
        assert_eq!(session.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn test_serves_complete_pieces_and_declines_rest() {
        let content = patterned(1 << 19);
        let piece_length = 1 << 18;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), &content[..piece_length]).unwrap();
        let metainfo = test_metainfo("blob.bin", &content, piece_length as u64);
        let config = Config {
            download_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        let mut session = TorrentSession::create(&metainfo, config, Vec::new())
            .await
            .unwrap();
        let mut commands_rx = session.insert_test_peer(addr());

        session
            .handle_alert(PeerAlert::ChunkRequested {
                addr: addr(),
                index: 0,
                begin: 16_384,
                length: 16_384,
            })
            .await
            .unwrap();
        match commands_rx.try_recv().unwrap() {
            PeerCommand::ServeChunk {
                index,
                begin,
                chunk,
            } => {
                assert_eq!((index, begin), (0, 16_384));
                assert_eq!(chunk, &content[16_384..32_768]);
            }
            other => panic!("expected a served chunk, got {:?}", other),
        }
        assert_eq!(session.stats.uploaded, 16_384);

        // piece 1 is not complete: the request is declined.
        session
            .handle_alert(PeerAlert::ChunkRequested {
                addr: addr(),
                index: 1,
                begin: 0,
                length: 16_384,
            })
            .await
            .unwrap();
        assert!(matches!(
            commands_rx.try_recv().unwrap(),
            PeerCommand::DeclineServe
        ));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_leaves_progress_unchanged() {
        let content = patterned(1 << 20);
        let (_dir, mut session) = test_session(&content, 1 << 18).await;
        let mut commands_rx = session.insert_test_peer(addr());

        session
            .handle_alert(PeerAlert::AvailabilityReplaced {
                addr: addr(),
                bitfield: vec![0b1000_0000],
            })
            .await
            .unwrap();
        session
            .handle_alert(PeerAlert::Ready { addr: addr() })
            .await
            .unwrap();

        let mut pending = Vec::new();
        let mut other = Vec::new();
        drain_requests(&mut commands_rx, &mut pending, &mut other);
        let (index, begin, length) = pending[0];

        for _ in 0..2 {
            session
                .handle_alert(PeerAlert::ChunkReceived {
                    addr: addr(),
                    index,
                    begin,
                    chunk: content[begin as usize..(begin + length) as usize].to_vec(),
                })
                .await
                .unwrap();
        }

        // the second delivery hit the inactive-request guard: the in-flight
        // entry was already cleared, so chunk accounting is unchanged.
        assert_eq!(session.pieces[0].complete_chunk_cardinality(), 1);
        assert_eq!(session.stats.downloaded, length as u64);
    }

    #[tokio::test]
    async fn test_extended_handshake_routes_to_extensions() {
        let content = patterned(1 << 18);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), &content).unwrap();

        let metainfo = test_metainfo("blob.bin", &content, 1 << 18);
        let encoded_info = serde_bencode::to_bytes(&metainfo.file_info).unwrap();
        let info_hash = metainfo.file_info.info_hash().unwrap();
        let config = Config {
            download_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        let extensions: Vec<Box<dyn Extension>> = vec![Box::new(
            crate::extensions::MetadataExtension::serving(info_hash, encoded_info.clone()),
        )];
        let mut session = TorrentSession::create(&metainfo, config, extensions)
            .await
            .unwrap();
        let mut commands_rx = session.insert_test_peer(addr());

        // remote advertises ut_metadata under its code 7.
        let remote = ExtendedHandshake {
            m: [("ut_metadata".to_string(), 7u8)].into_iter().collect(),
            metadata_size: Some(encoded_info.len() as u64),
            ..Default::default()
        };
        session
            .handle_alert(PeerAlert::Extended {
                addr: addr(),
                code: EXTENDED_HANDSHAKE_CODE,
                payload: remote.to_bencode().unwrap(),
            })
            .await
            .unwrap();

        // remote asks for metadata block 0 on OUR advertised code (1).
        let request = crate::peer_protocol::extended::MetadataMessage::Request { piece: 0 };
        session
            .handle_alert(PeerAlert::Extended {
                addr: addr(),
                code: 1,
                payload: request.to_bytes().unwrap(),
            })
            .await
            .unwrap();

        match commands_rx.try_recv().unwrap() {
            PeerCommand::Extended { code, payload } => {
                // outbound frames use the REMOTE's code for the key.
                assert_eq!(code, 7);
                match crate::peer_protocol::extended::MetadataMessage::from_bytes(&payload)
                    .unwrap()
                {
                    crate::peer_protocol::extended::MetadataMessage::Data {
                        piece,
                        total_size,
                        block,
                    } => {
                        assert_eq!(piece, 0);
                        assert_eq!(total_size, encoded_info.len() as u64);
                        let expected =
                            &encoded_info[..std::cmp::min(encoded_info.len(), METADATA_BLOCK_SIZE as usize)];
                        assert_eq!(block, expected);
                    }
                    other => panic!("expected metadata data, got {:?}", other),
                }
            }
            other => panic!("expected extended frame, got {:?}", other),
        }
    }
}
