use crate::metainfo::PieceHash;
use crate::prelude::*;
use crate::storage::Storage;
use crate::torrent::Bitfield;
use sha1_smol::Sha1;

/// Fixed sub-piece transfer size on the wire.
pub const CHUNK_LENGTH: u32 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Pending,
    Validating,
    Complete,
}

/// What a chunk delivery did to the piece.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored, more chunks still outstanding.
    Accepted,
    /// The chunk was already complete; delivery discarded.
    Duplicate,
    /// Final chunk arrived and the assembled piece matched its digest.
    Completed,
    /// Final chunk arrived but the digest did not match; the piece was
    /// reset and is re-requestable from scratch.
    Invalid,
}

/// The unit of verification: a digest-checked range of the aggregate
/// content, assembled from fixed-size chunks.
///
/// The assembly buffer only exists while the piece is incomplete; it is
/// dropped once the bytes are flushed to storage or found corrupt.
#[derive(Debug)]
pub struct Piece {
    index: usize,
    offset: u64,
    length: u32,
    expected_digest: PieceHash,
    complete_chunks: Bitfield,
    requested_chunks: Bitfield,
    buffer: Option<Vec<u8>>,
    state: PieceState,
}

impl Piece {
    pub fn new(index: usize, offset: u64, length: u32, expected_digest: PieceHash) -> Self {
        let chunk_count = (length as usize).div_ceil(CHUNK_LENGTH as usize);
        Self {
            index,
            offset,
            length,
            expected_digest,
            complete_chunks: Bitfield::new(chunk_count),
            requested_chunks: Bitfield::new(chunk_count),
            buffer: None,
            state: PieceState::Pending,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == PieceState::Complete
    }

    pub fn chunk_count(&self) -> usize {
        self.complete_chunks.len()
    }

    /// True while some chunk is neither complete nor in flight, i.e there
    /// is still something to ask a peer for.
    pub fn has_unrequested_chunks(&self) -> bool {
        !self.requested_chunks.or(&self.complete_chunks).all_set()
    }

    /// Picks the lowest chunk that is neither complete nor already
    /// requested, marks it requested, and returns its byte range. `None`
    /// when everything is delivered or in flight (the end-game case
    /// included).
    pub fn next_chunk(&mut self) -> Option<(u32, u32)> {
        let taken = self.requested_chunks.or(&self.complete_chunks);
        let chunk = taken.unset_indices().into_iter().next()?;
        self.requested_chunks.set(chunk);
        Some((chunk as u32 * CHUNK_LENGTH, self.chunk_length(chunk)))
    }

    /// Releases an in-flight chunk (peer disconnected or timed out) so it
    /// becomes eligible for re-request. The complete flag is untouched.
    pub fn cancel_request(&mut self, begin: u32) {
        let chunk = (begin / CHUNK_LENGTH) as usize;
        if chunk < self.requested_chunks.len() {
            self.requested_chunks.unset(chunk);
        }
    }

    /// Accepts a delivered chunk. When the delivery completes the piece,
    /// flushes the assembly buffer to every overlapping span and validates
    /// the digest against storage.
    ///
    /// Hard storage errors propagate with the chunk bitsets unmodified so
    /// the save can be retried; a busy span is retried here with backoff.
    pub async fn set_data(
        &mut self,
        begin: u32,
        data: &[u8],
        storage: &mut Storage,
    ) -> anyhow::Result<ChunkOutcome> {
        anyhow::ensure!(
            begin as usize + data.len() <= self.length as usize,
            "chunk at {} (+{} bytes) exceeds piece {} bounds",
            begin,
            data.len(),
            self.index
        );
        let chunk = (begin / CHUNK_LENGTH) as usize;
        if self.complete_chunks.is_set(chunk) {
            warn!(
                "duplicate chunk for piece {} at offset {}, discarding",
                self.index, begin
            );
            return Ok(ChunkOutcome::Duplicate);
        }

        let length = self.length as usize;
        let buffer = self.buffer.get_or_insert_with(|| vec![0; length]);
        buffer[begin as usize..begin as usize + data.len()].copy_from_slice(data);
        self.complete_chunks.set(chunk);

        if !self.complete_chunks.all_set() {
            return Ok(ChunkOutcome::Accepted);
        }

        self.state = PieceState::Validating;
        match self.flush_and_validate(storage).await {
            Ok(true) => {
                info!("piece {} complete", self.index);
                self.buffer = None;
                self.state = PieceState::Complete;
                Ok(ChunkOutcome::Completed)
            }
            Ok(false) => {
                warn!("piece {} failed digest check, resetting", self.index);
                self.reset();
                Ok(ChunkOutcome::Invalid)
            }
            Err(err) => {
                self.state = PieceState::Pending;
                Err(err)
            }
        }
    }

    /// Re-reads the piece's bytes from backing storage and digests them.
    /// Authoritative completion check, also used at startup for resume
    /// detection. Hashing is chunked so the event loop keeps breathing.
    pub async fn is_valid(&self, storage: &mut Storage) -> anyhow::Result<bool> {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; CHUNK_LENGTH as usize];
        let mut read = 0u64;
        while read < self.length as u64 {
            let step = std::cmp::min(CHUNK_LENGTH as u64, self.length as u64 - read) as usize;
            storage
                .read_at_with_retry(self.offset + read, &mut buf[..step])
                .await?;
            hasher.update(&buf[..step]);
            read += step as u64;
        }
        Ok(hasher.digest().bytes() == self.expected_digest)
    }

    /// Seeds the piece as already durable (resume path).
    pub fn mark_complete(&mut self) {
        self.complete_chunks.set_all();
        self.buffer = None;
        self.state = PieceState::Complete;
    }

    /// Back to scratch: both bitsets cleared, assembly buffer dropped.
    pub fn reset(&mut self) {
        let chunk_count = self.chunk_count();
        self.complete_chunks = Bitfield::new(chunk_count);
        self.requested_chunks = Bitfield::new(chunk_count);
        self.buffer = None;
        self.state = PieceState::Pending;
    }

    pub fn complete_chunk_cardinality(&self) -> usize {
        self.complete_chunks.cardinality()
    }

    pub fn requested_chunk_cardinality(&self) -> usize {
        self.requested_chunks.cardinality()
    }

    async fn flush_and_validate(&mut self, storage: &mut Storage) -> anyhow::Result<bool> {
        let buffer = self
            .buffer
            .as_ref()
            .expect("assembly buffer exists while validating");
        storage.write_at_with_retry(self.offset, buffer).await?;
        self.is_valid(storage).await
    }

    fn chunk_length(&self, chunk: usize) -> u32 {
        std::cmp::min(self.length - chunk as u32 * CHUNK_LENGTH, CHUNK_LENGTH)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;
    use std::path::PathBuf;

    async fn single_span_storage(length: u64) -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(dir.path(), &[(PathBuf::from("blob.bin"), length)])
            .await
            .unwrap();
        (dir, storage)
    }

    fn patterned(length: usize) -> Vec<u8> {
        (0..length).map(|i| (i % 251) as u8).collect()
    }

    fn digest_of(data: &[u8]) -> PieceHash {
        Sha1::from(data).digest().bytes()
    }

    #[rstest]
    fn test_next_chunk_enumerates_each_chunk_once() {
        let length = 40_000u32; // 2 full chunks and a 7232 byte tail
        let mut piece = Piece::new(0, 0, length, [0; 20]);

        let mut offsets = Vec::new();
        while let Some((begin, len)) = piece.next_chunk() {
            assert_eq!(begin % CHUNK_LENGTH, 0);
            assert!(begin + len <= length);
            offsets.push(begin);
        }

        assert_eq!(offsets, vec![0, 16_384, 32_768]);
        assert_eq!(piece.next_chunk(), None);
    }

    #[rstest]
    fn test_cancel_request_makes_chunk_requestable_again() {
        let mut piece = Piece::new(1, 0, 3 * CHUNK_LENGTH, [0; 20]);
        let _ = piece.next_chunk();
        let (second, _) = piece.next_chunk().unwrap();
        assert_eq!(second, 16_384);

        piece.cancel_request(second);
        let (again, _) = piece.next_chunk().unwrap();
        assert_eq!(again, second);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_discarded() {
        let data = patterned(2 * CHUNK_LENGTH as usize);
        let (_dir, mut storage) = single_span_storage(data.len() as u64).await;
        let mut piece = Piece::new(0, 0, data.len() as u32, digest_of(&data));

        let first = &data[..CHUNK_LENGTH as usize];
        let outcome = piece.set_data(0, first, &mut storage).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Accepted);
        let cardinality = piece.complete_chunk_cardinality();

        let outcome = piece.set_data(0, first, &mut storage).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Duplicate);
        assert_eq!(piece.complete_chunk_cardinality(), cardinality);
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_completes_once() {
        let data = patterned(16 * CHUNK_LENGTH as usize);
        let (_dir, mut storage) = single_span_storage(data.len() as u64).await;
        let mut piece = Piece::new(0, 0, data.len() as u32, digest_of(&data));

        // deliver chunks in a shuffled order; only the 16th may complete.
        let order = [5, 0, 15, 3, 8, 1, 12, 7, 2, 14, 6, 11, 4, 10, 9, 13];
        for (nth, chunk) in order.into_iter().enumerate() {
            let begin = chunk * CHUNK_LENGTH as usize;
            let outcome = piece
                .set_data(begin as u32, &data[begin..begin + CHUNK_LENGTH as usize], &mut storage)
                .await
                .unwrap();
            if nth < order.len() - 1 {
                assert_eq!(outcome, ChunkOutcome::Accepted);
            } else {
                assert_eq!(outcome, ChunkOutcome::Completed);
            }
        }

        assert!(piece.is_complete());
        assert!(piece.is_valid(&mut storage).await.unwrap());
    }

    #[tokio::test]
    async fn test_digest_mismatch_resets_piece() {
        let data = patterned(CHUNK_LENGTH as usize + 100);
        let (_dir, mut storage) = single_span_storage(data.len() as u64).await;
        // expected digest belongs to different bytes.
        let mut piece = Piece::new(0, 0, data.len() as u32, digest_of(b"other content"));

        let outcome = piece
            .set_data(0, &data[..CHUNK_LENGTH as usize], &mut storage)
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Accepted);
        let outcome = piece
            .set_data(CHUNK_LENGTH, &data[CHUNK_LENGTH as usize..], &mut storage)
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Invalid);

        assert_eq!(piece.state(), PieceState::Pending);
        assert_eq!(piece.complete_chunk_cardinality(), 0);
        assert_eq!(piece.requested_chunk_cardinality(), 0);
        // re-requestable from scratch.
        assert_eq!(piece.next_chunk(), Some((0, CHUNK_LENGTH)));
    }

    #[tokio::test]
    async fn test_tail_chunk_clipped_to_remainder() {
        let mut piece = Piece::new(3, 0, CHUNK_LENGTH + 10, [0; 20]);
        assert_eq!(piece.next_chunk(), Some((0, CHUNK_LENGTH)));
        assert_eq!(piece.next_chunk(), Some((CHUNK_LENGTH, 10)));
        assert_eq!(piece.next_chunk(), None);
    }

    #[tokio::test]
    async fn test_resume_validation_roundtrip() {
        let data = patterned(3 * CHUNK_LENGTH as usize);
        let (_dir, mut storage) = single_span_storage(data.len() as u64).await;
        storage.write_at(0, &data).await.unwrap();

        let piece = Piece::new(0, 0, data.len() as u32, digest_of(&data));
        assert!(piece.is_valid(&mut storage).await.unwrap());

        let wrong = Piece::new(0, 0, data.len() as u32, digest_of(b"no"));
        assert!(!wrong.is_valid(&mut storage).await.unwrap());
    }
}
