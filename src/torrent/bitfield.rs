use bitvec::{order::Msb0, vec::BitVec};

/// Fixed-length bitset over piece or chunk indices.
///
/// Bits are kept most-significant-bit first within each byte, matching the
/// wire encoding of availability maps, so `to_bytes`/`from_bytes` are
/// straight copies of the underlying storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield(BitVec<u8, Msb0>);

impl Bitfield {
    pub fn new(length: usize) -> Self {
        let mut bits = BitVec::with_capacity(length);
        bits.resize(length, false);
        Self(bits)
    }

    /// Decodes a wire availability map. Trailing pad bits beyond `length`
    /// are discarded; short input is padded with zeros.
    pub fn from_bytes(bytes: &[u8], length: usize) -> Self {
        let mut bits = BitVec::from_slice(bytes);
        bits.resize(length, false);
        Self(bits)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.0.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, index: usize) {
        self.0.set(index, true);
    }

    pub fn unset(&mut self, index: usize) {
        self.0.set(index, false);
    }

    pub fn set_all(&mut self) {
        self.0.fill(true);
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.0[index]
    }

    pub fn and(&self, rhs: &Bitfield) -> Bitfield {
        self.zip_with(rhs, |a, b| a & b)
    }

    pub fn or(&self, rhs: &Bitfield) -> Bitfield {
        self.zip_with(rhs, |a, b| a | b)
    }

    pub fn xor(&self, rhs: &Bitfield) -> Bitfield {
        self.zip_with(rhs, |a, b| a ^ b)
    }

    pub fn cardinality(&self) -> usize {
        self.0.count_ones()
    }

    pub fn all_set(&self) -> bool {
        !self.0.is_empty() && self.0.all()
    }

    pub fn any(&self) -> bool {
        self.0.any()
    }

    /// Indices of set bits, ascending. Freshly computed, not a live view.
    pub fn set_indices(&self) -> Vec<usize> {
        self.0.iter_ones().collect()
    }

    /// Indices of unset bits, ascending. Freshly computed, not a live view.
    pub fn unset_indices(&self) -> Vec<usize> {
        self.0.iter_zeros().collect()
    }

    // binary operations clamp to the shorter operand and leave both
    // operands untouched.
    fn zip_with(&self, rhs: &Bitfield, op: impl Fn(bool, bool) -> bool) -> Bitfield {
        let length = std::cmp::min(self.len(), rhs.len());
        let mut out = Bitfield::new(length);
        for index in 0..length {
            out.0.set(index, op(self.0[index], rhs.0[index]));
        }
        out
    }
}
