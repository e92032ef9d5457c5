use crate::piece::Piece;
use crate::prelude::*;
use crate::torrent::Bitfield;
use rand::Rng;

/// Decides which piece a ready peer should be asked for.
///
/// Keeps the set of pieces currently assigned to at least one peer's
/// request cycle, preferring to finish those before opening new ones so
/// partially-downloaded pieces stay few and complete fast. New pieces are
/// drawn uniformly at random from what the peer can supply; rarest-first
/// is a possible refinement but not part of this policy.
#[derive(Debug)]
pub struct PiecePicker {
    active: Bitfield,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            active: Bitfield::new(piece_count),
        }
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.active.is_set(index)
    }

    /// Drops a piece from the active set: it completed, failed validation,
    /// or its only peer went away. It re-enters the selection pool (unless
    /// the completion bitfield masks it out).
    pub fn release(&mut self, index: usize) {
        self.active.unset(index);
    }

    /// Picks for a ready peer. Continues an already-active piece the peer
    /// can supply when one still has unrequested chunks; otherwise
    /// activates a random piece among those the peer has that are neither
    /// active nor complete. `None` when the peer has nothing we can use.
    pub fn next_piece<R: Rng>(
        &mut self,
        peer_has: &Bitfield,
        pieces: &[Piece],
        completion: &Bitfield,
        rng: &mut R,
    ) -> Option<usize> {
        for index in self.active.set_indices() {
            if peer_has.is_set(index) && pieces[index].has_unrequested_chunks() {
                trace!("continuing active piece {}", index);
                return Some(index);
            }
        }

        // available = peer_has ^ (peer_has & (active | complete))
        let available = peer_has.xor(&peer_has.and(&self.active.or(completion)));
        let eligible = available.set_indices();
        if eligible.is_empty() {
            return None;
        }

        let index = eligible[rng.gen_range(0..eligible.len())];
        debug!("activating piece {}", index);
        self.active.set(index);
        Some(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::piece::CHUNK_LENGTH;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::*;

    fn pieces(count: usize) -> Vec<Piece> {
        (0..count)
            .map(|index| {
                Piece::new(
                    index,
                    index as u64 * 2 * CHUNK_LENGTH as u64,
                    2 * CHUNK_LENGTH,
                    [0; 20],
                )
            })
            .collect()
    }

    fn bitfield_of(indices: &[usize], length: usize) -> Bitfield {
        let mut field = Bitfield::new(length);
        for index in indices {
            field.set(*index);
        }
        field
    }

    #[fixture]
    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[rstest]
    fn test_prefers_continuing_active_piece(mut rng: StdRng) {
        // peer has {0, 2, 3}, active is {2}, complete is {0}: the picker
        // must continue piece 2 rather than start piece 3.
        let pieces = pieces(4);
        let mut picker = PiecePicker::new(4);
        picker.active.set(2);
        let completion = bitfield_of(&[0], 4);
        let peer_has = bitfield_of(&[0, 2, 3], 4);

        let picked = picker.next_piece(&peer_has, &pieces, &completion, &mut rng);
        assert_eq!(picked, Some(2));
    }

    #[rstest]
    fn test_activates_new_piece_when_active_exhausted(mut rng: StdRng) {
        let mut pieces = pieces(4);
        // drain piece 2's chunks so it cannot be continued.
        while pieces[2].next_chunk().is_some() {}

        let mut picker = PiecePicker::new(4);
        picker.active.set(2);
        let completion = bitfield_of(&[0], 4);
        let peer_has = bitfield_of(&[0, 2, 3], 4);

        let picked = picker.next_piece(&peer_has, &pieces, &completion, &mut rng);
        assert_eq!(picked, Some(3));
        assert!(picker.is_active(3));
    }

    #[rstest]
    fn test_none_when_peer_has_nothing_usable(mut rng: StdRng) {
        let pieces = pieces(3);
        let mut picker = PiecePicker::new(3);
        picker.active.set(1);
        // everything the peer has is complete or already active elsewhere
        // and exhausted.
        let completion = bitfield_of(&[0, 2], 3);
        let peer_has = bitfield_of(&[0, 2], 3);

        assert_eq!(
            picker.next_piece(&peer_has, &pieces, &completion, &mut rng),
            None
        );
    }

    #[rstest]
    fn test_release_returns_piece_to_pool(mut rng: StdRng) {
        let pieces = pieces(2);
        let mut picker = PiecePicker::new(2);
        let completion = Bitfield::new(2);
        let peer_has = bitfield_of(&[1], 2);

        assert_eq!(
            picker.next_piece(&peer_has, &pieces, &completion, &mut rng),
            Some(1)
        );
        // invalidation: active flag cleared, the piece is selectable again.
        picker.release(1);
        assert!(!picker.is_active(1));
        assert_eq!(
            picker.next_piece(&peer_has, &pieces, &completion, &mut rng),
            Some(1)
        );
    }

    #[rstest]
    fn test_random_pick_stays_within_eligible(mut rng: StdRng) {
        let pieces = pieces(8);
        let mut picker = PiecePicker::new(8);
        let completion = bitfield_of(&[1], 8);
        let peer_has = bitfield_of(&[1, 4, 6], 8);

        for _ in 0..16 {
            let picked = picker
                .next_piece(&peer_has, &pieces, &completion, &mut rng)
                .unwrap();
            assert!(picked == 4 || picked == 6);
            picker.release(picked);
        }
    }
}
