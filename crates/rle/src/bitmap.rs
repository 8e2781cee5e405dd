//! RLE empty-bitmap
//!
//! The empty-bitmap records which logical cell positions of a chunk are
//! occupied. Set bits come in runs: a segment `(l_position, length,
//! p_position)` says "the `length` logical positions starting at
//! `l_position` are set, and they map to payload indexes `p_position ..
//! p_position + length`". Segments are strictly increasing in both
//! logical and payload position and never overlap.
//!
//! # Packed layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┐
//! │ magic (8)    │ n_segs (8)   │ n_non_empty (8)      │
//! ├──────────────┴──────────────┴──────────────────────┤
//! │ segment 0: l_position (8) length (8) p_position (8)│
//! │ segment 1: ...                                     │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! All fields little-endian. A magic mismatch on unpack fails with
//! `StorageCorrupted`.

use tessera_core::{Result, StorageError};

/// Magic bytes prefixing a packed empty-bitmap.
pub const BITMAP_MAGIC: u64 = u64::from_le_bytes(*b"TSRLEBMP");

/// Byte size of the packed bitmap header.
pub const BITMAP_HEADER_SIZE: usize = 24;

/// Byte size of one packed segment.
pub const BITMAP_SEGMENT_SIZE: usize = 24;

/// One run of set bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapSegment {
    /// First logical position of the run.
    pub l_position: i64,
    /// Number of set bits in the run.
    pub length: i64,
    /// Payload index of the first bit in the run.
    pub p_position: i64,
}

impl BitmapSegment {
    /// Create a segment.
    pub fn new(l_position: i64, length: i64, p_position: i64) -> Self {
        BitmapSegment {
            l_position,
            length,
            p_position,
        }
    }

    /// One past the last logical position.
    pub fn l_end(&self) -> i64 {
        self.l_position + self.length
    }
}

/// RLE-compressed bitmap of occupied cell positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmptyBitmap {
    segments: Vec<BitmapSegment>,
    n_non_empty: u64,
}

impl EmptyBitmap {
    /// Create an empty bitmap (all cells empty).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from segments. Segments must be strictly increasing; adjacent
    /// contiguous runs are merged.
    pub fn from_segments(segments: impl IntoIterator<Item = BitmapSegment>) -> Self {
        let mut bm = Self::new();
        for seg in segments {
            bm.add_segment(seg);
        }
        bm
    }

    /// Build from a dense bit vector of `n` logical positions; payload
    /// indexes are assigned densely in order.
    pub fn from_dense_bits(bits: &[u8], n: usize) -> Self {
        let mut bm = Self::new();
        let mut p_position = 0i64;
        let mut run_start: Option<i64> = None;
        for pos in 0..n {
            let set = bits[pos >> 3] & (1 << (pos & 7)) != 0;
            match (set, run_start) {
                (true, None) => run_start = Some(pos as i64),
                (false, Some(start)) => {
                    let length = pos as i64 - start;
                    bm.add_segment(BitmapSegment::new(start, length, p_position));
                    p_position += length;
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            bm.add_segment(BitmapSegment::new(start, n as i64 - start, p_position));
        }
        bm
    }

    /// Append one run. Must start after the end of the previous run in
    /// both logical and payload position; a run contiguous in both is
    /// merged into its predecessor.
    pub fn add_segment(&mut self, seg: BitmapSegment) {
        debug_assert!(seg.length > 0);
        if let Some(last) = self.segments.last_mut() {
            debug_assert!(seg.l_position >= last.l_end());
            debug_assert!(seg.p_position >= last.p_position + last.length);
            if seg.l_position == last.l_end() && seg.p_position == last.p_position + last.length {
                last.length += seg.length;
                self.n_non_empty += seg.length as u64;
                return;
            }
        }
        self.n_non_empty += seg.length as u64;
        self.segments.push(seg);
    }

    /// Number of segments.
    pub fn n_segments(&self) -> usize {
        self.segments.len()
    }

    /// Segment by index.
    pub fn segment(&self, i: usize) -> &BitmapSegment {
        &self.segments[i]
    }

    /// Total number of set bits (cached).
    pub fn count(&self) -> u64 {
        self.n_non_empty
    }

    /// Index of the first segment whose end is past `pos`.
    ///
    /// Returns `n_segments()` when every segment ends at or before `pos`.
    pub fn find_segment(&self, pos: i64) -> usize {
        self.segments.partition_point(|s| s.l_end() <= pos)
    }

    /// True if the logical position is not covered by any run.
    pub fn is_empty(&self, pos: i64) -> bool {
        let r = self.find_segment(pos);
        r == self.segments.len() || self.segments[r].l_position > pos
    }

    /// Payload index of a set bit, or `None` when the position is empty.
    pub fn value_index(&self, pos: i64) -> Option<i64> {
        let r = self.find_segment(pos);
        if r < self.segments.len() && self.segments[r].l_position <= pos {
            Some(self.segments[r].p_position + pos - self.segments[r].l_position)
        } else {
            None
        }
    }

    /// Size of the packed representation.
    pub fn packed_size(&self) -> usize {
        BITMAP_HEADER_SIZE + self.segments.len() * BITMAP_SEGMENT_SIZE
    }

    /// Serialize into the packed on-disk form.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_size());
        out.extend_from_slice(&BITMAP_MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.n_non_empty.to_le_bytes());
        for seg in &self.segments {
            out.extend_from_slice(&seg.l_position.to_le_bytes());
            out.extend_from_slice(&seg.length.to_le_bytes());
            out.extend_from_slice(&seg.p_position.to_le_bytes());
        }
        out
    }

    /// Parse the packed on-disk form.
    pub fn unpack(src: &[u8]) -> Result<Self> {
        if src.len() < BITMAP_HEADER_SIZE {
            return Err(StorageError::corrupted("empty-bitmap header truncated"));
        }
        let magic = u64::from_le_bytes(src[0..8].try_into().unwrap());
        if magic != BITMAP_MAGIC {
            return Err(StorageError::corrupted("empty-bitmap magic mismatch"));
        }
        let n_segs = u64::from_le_bytes(src[8..16].try_into().unwrap()) as usize;
        let n_non_empty = u64::from_le_bytes(src[16..24].try_into().unwrap());
        let need = BITMAP_HEADER_SIZE + n_segs * BITMAP_SEGMENT_SIZE;
        if src.len() < need {
            return Err(StorageError::corrupted("empty-bitmap segments truncated"));
        }
        let mut segments = Vec::with_capacity(n_segs);
        let mut at = BITMAP_HEADER_SIZE;
        for _ in 0..n_segs {
            let l_position = i64::from_le_bytes(src[at..at + 8].try_into().unwrap());
            let length = i64::from_le_bytes(src[at + 8..at + 16].try_into().unwrap());
            let p_position = i64::from_le_bytes(src[at + 16..at + 24].try_into().unwrap());
            if length <= 0 {
                return Err(StorageError::corrupted("empty-bitmap run of length <= 0"));
            }
            if let Some(prev) = segments.last() {
                let prev: &BitmapSegment = prev;
                if l_position < prev.l_end() || p_position < prev.p_position + prev.length {
                    return Err(StorageError::corrupted("empty-bitmap runs overlap"));
                }
            }
            segments.push(BitmapSegment::new(l_position, length, p_position));
            at += BITMAP_SEGMENT_SIZE;
        }
        Ok(EmptyBitmap {
            segments,
            n_non_empty,
        })
    }

    /// Read the set-bit count out of a packed bitmap without decoding the
    /// segment array.
    pub fn peek_count(src: &[u8]) -> Result<u64> {
        if src.len() < BITMAP_HEADER_SIZE {
            return Err(StorageError::corrupted("empty-bitmap header truncated"));
        }
        let magic = u64::from_le_bytes(src[0..8].try_into().unwrap());
        if magic != BITMAP_MAGIC {
            return Err(StorageError::corrupted("empty-bitmap magic mismatch"));
        }
        Ok(u64::from_le_bytes(src[16..24].try_into().unwrap()))
    }

    /// Restrict the bitmap to a coordinate sub-box.
    ///
    /// The bitmap covers the row-major linearization of the box
    /// `[lower_origin, upper_origin]` (inclusive bounds). The result has
    /// the same shape with every bit outside `[lower_result,
    /// upper_result]` cleared; payload indexes are re-assigned densely to
    /// match a payload filtered the same way.
    pub fn cut(
        &self,
        lower_origin: &[i64],
        upper_origin: &[i64],
        lower_result: &[i64],
        upper_result: &[i64],
    ) -> EmptyBitmap {
        debug_assert_eq!(lower_origin.len(), upper_origin.len());
        debug_assert_eq!(lower_origin.len(), lower_result.len());
        debug_assert_eq!(lower_origin.len(), upper_result.len());
        let extents: Vec<i64> = lower_origin
            .iter()
            .zip(upper_origin)
            .map(|(lo, hi)| hi - lo + 1)
            .collect();
        let inside = |pos: i64| -> bool {
            // Delinearize within the origin box, last dimension fastest.
            let mut rest = pos;
            let mut coords = vec![0i64; extents.len()];
            for d in (0..extents.len()).rev() {
                coords[d] = lower_origin[d] + rest % extents[d];
                rest /= extents[d];
            }
            coords
                .iter()
                .zip(lower_result.iter().zip(upper_result))
                .all(|(c, (lo, hi))| c >= lo && c <= hi)
        };
        let mut out = EmptyBitmap::new();
        let mut p_position = 0i64;
        let mut run: Option<(i64, i64)> = None; // (start, len)
        for (l_pos, _) in self.iter() {
            if !inside(l_pos) {
                continue;
            }
            match run {
                Some((start, len)) if start + len == l_pos => run = Some((start, len + 1)),
                Some((start, len)) => {
                    out.add_segment(BitmapSegment::new(start, len, p_position));
                    p_position += len;
                    run = Some((l_pos, 1));
                }
                None => run = Some((l_pos, 1)),
            }
        }
        if let Some((start, len)) = run {
            out.add_segment(BitmapSegment::new(start, len, p_position));
        }
        out
    }

    /// Cell-level iterator over set bits.
    pub fn iter(&self) -> BitmapCellIterator<'_> {
        BitmapCellIterator::new(self)
    }

    /// Segment-level iterator with partial-consumption support.
    pub fn segment_iter(&self) -> BitmapSegmentIterator<'_> {
        BitmapSegmentIterator::new(self)
    }
}

/// Walks set bits one logical position at a time.
#[derive(Debug, Clone)]
pub struct BitmapCellIterator<'a> {
    bm: &'a EmptyBitmap,
    curr_seg: usize,
    curr_lpos: i64,
}

impl<'a> BitmapCellIterator<'a> {
    fn new(bm: &'a EmptyBitmap) -> Self {
        let mut it = BitmapCellIterator {
            bm,
            curr_seg: 0,
            curr_lpos: -1,
        };
        it.reset();
        it
    }

    /// Rewind to the first set bit.
    pub fn reset(&mut self) {
        self.curr_seg = 0;
        if !self.end() {
            self.curr_lpos = self.bm.segment(0).l_position;
        }
    }

    /// True when all set bits are consumed.
    pub fn end(&self) -> bool {
        self.curr_seg >= self.bm.n_segments()
    }

    /// Current logical position.
    pub fn l_pos(&self) -> i64 {
        debug_assert!(!self.end());
        self.curr_lpos
    }

    /// Current payload position.
    pub fn p_pos(&self) -> i64 {
        debug_assert!(!self.end());
        let seg = self.bm.segment(self.curr_seg);
        seg.p_position + self.curr_lpos - seg.l_position
    }

    /// Advance to the next set bit, crossing segments as needed.
    pub fn advance(&mut self) {
        debug_assert!(!self.end());
        let seg = self.bm.segment(self.curr_seg);
        if self.curr_lpos + 1 < seg.l_end() {
            self.curr_lpos += 1;
        } else {
            self.curr_seg += 1;
            if !self.end() {
                self.curr_lpos = self.bm.segment(self.curr_seg).l_position;
            }
        }
    }

    /// Position on a specific set bit. Fails (leaving the iterator at
    /// end) when the position is not covered by any run.
    pub fn set_position(&mut self, l_pos: i64) -> bool {
        self.curr_seg = self.bm.find_segment(l_pos);
        if self.end() || self.bm.segment(self.curr_seg).l_position > l_pos {
            self.curr_seg = self.bm.n_segments();
            return false;
        }
        self.curr_lpos = l_pos;
        true
    }

    /// Skip `n` set bits; returns false when fewer remain.
    pub fn skip(&mut self, mut n: u64) -> bool {
        while !self.end() && n > 0 {
            let seg = self.bm.segment(self.curr_seg);
            let left = (seg.l_end() - self.curr_lpos) as u64;
            if n < left {
                self.curr_lpos += n as i64;
                return true;
            }
            n -= left;
            self.curr_seg += 1;
            if !self.end() {
                self.curr_lpos = self.bm.segment(self.curr_seg).l_position;
            }
        }
        n == 0 && !self.end()
    }
}

impl Iterator for BitmapCellIterator<'_> {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<(i64, i64)> {
        if self.end() {
            return None;
        }
        let out = (self.l_pos(), self.p_pos());
        self.advance();
        Some(out)
    }
}

/// Iterates segments rather than individual set bits, remembering an
/// offset within the current segment so a caller can take a partial run
/// and treat the remainder as a virtual segment.
#[derive(Debug, Clone)]
pub struct BitmapSegmentIterator<'a> {
    bm: &'a EmptyBitmap,
    curr_seg: usize,
    offset: i64,
}

impl<'a> BitmapSegmentIterator<'a> {
    fn new(bm: &'a EmptyBitmap) -> Self {
        BitmapSegmentIterator {
            bm,
            curr_seg: 0,
            offset: 0,
        }
    }

    /// Rewind to the beginning of the first segment.
    pub fn reset(&mut self) {
        self.curr_seg = 0;
        self.offset = 0;
    }

    /// True when no segments remain.
    pub fn end(&self) -> bool {
        self.curr_seg >= self.bm.n_segments()
    }

    /// The remaining part of the current segment, as a segment in its own
    /// right.
    pub fn virtual_segment(&self) -> BitmapSegment {
        debug_assert!(!self.end());
        let seg = self.bm.segment(self.curr_seg);
        BitmapSegment {
            l_position: seg.l_position + self.offset,
            p_position: seg.p_position + self.offset,
            length: seg.length - self.offset,
        }
    }

    /// Consume `step` positions of the current segment. `step` must be
    /// less than the remaining virtual-segment length; use
    /// [`advance_to_next`](Self::advance_to_next) to finish a segment.
    pub fn advance_within_segment(&mut self, step: i64) {
        debug_assert!(step > 0);
        debug_assert!(!self.end());
        debug_assert!(self.offset + step < self.bm.segment(self.curr_seg).length);
        self.offset += step;
    }

    /// Move to the start of the next segment.
    pub fn advance_to_next(&mut self) {
        debug_assert!(!self.end());
        self.curr_seg += 1;
        self.offset = 0;
    }

    /// Consume `step` positions, finishing the segment exactly when
    /// `step` equals the remaining length.
    pub fn advance_by(&mut self, step: i64) {
        debug_assert!(!self.end());
        let remaining = self.virtual_segment().length;
        debug_assert!(step <= remaining);
        if step == remaining {
            self.advance_to_next();
        } else {
            self.advance_within_segment(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EmptyBitmap {
        EmptyBitmap::from_segments([
            BitmapSegment::new(3, 5, 5),
            BitmapSegment::new(10, 1, 11),
            BitmapSegment::new(13, 3, 14),
        ])
    }

    #[test]
    fn iteration_order() {
        // Segments (3,5,5) (10,1,11) (13,3,14): expected (lPos, pPos) walk.
        let expected = [
            (3, 5),
            (4, 6),
            (5, 7),
            (6, 8),
            (7, 9),
            (10, 11),
            (13, 14),
            (14, 15),
            (15, 16),
        ];
        let got: Vec<(i64, i64)> = sample().iter().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn set_position_inside_and_outside_runs() {
        let bm = sample();
        let mut it = bm.iter();
        assert!(it.set_position(7));
        assert_eq!((it.l_pos(), it.p_pos()), (7, 9));
        assert!(!it.set_position(8));
        assert!(it.end());
        // Recoverable: positioning again works.
        assert!(it.set_position(13));
        assert_eq!((it.l_pos(), it.p_pos()), (13, 14));
    }

    #[test]
    fn emptiness_and_value_index() {
        let bm = sample();
        assert!(bm.is_empty(0));
        assert!(!bm.is_empty(3));
        assert!(!bm.is_empty(7));
        assert!(bm.is_empty(8));
        assert!(bm.is_empty(11));
        assert!(!bm.is_empty(15));
        assert!(bm.is_empty(16));
        assert_eq!(bm.value_index(3), Some(5));
        assert_eq!(bm.value_index(10), Some(11));
        assert_eq!(bm.value_index(8), None);
        assert_eq!(bm.count(), 9);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let bm = sample();
        let bytes = bm.pack();
        assert_eq!(bytes.len(), bm.packed_size());
        let parsed = EmptyBitmap::unpack(&bytes).unwrap();
        assert_eq!(parsed, bm);
    }

    #[test]
    fn unpack_rejects_bad_magic() {
        let mut bytes = sample().pack();
        bytes[0] ^= 0xFF;
        let err = EmptyBitmap::unpack(&bytes).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn unpack_rejects_truncation() {
        let bytes = sample().pack();
        assert!(EmptyBitmap::unpack(&bytes[..bytes.len() - 1]).is_err());
        assert!(EmptyBitmap::unpack(&bytes[..10]).is_err());
    }

    #[test]
    fn peek_count_reads_header_only() {
        let bytes = sample().pack();
        assert_eq!(EmptyBitmap::peek_count(&bytes).unwrap(), 9);
        // Only the header is needed.
        assert_eq!(EmptyBitmap::peek_count(&bytes[..BITMAP_HEADER_SIZE]).unwrap(), 9);
    }

    #[test]
    fn adjacent_runs_merge() {
        let mut bm = EmptyBitmap::new();
        bm.add_segment(BitmapSegment::new(0, 4, 0));
        bm.add_segment(BitmapSegment::new(4, 2, 4));
        assert_eq!(bm.n_segments(), 1);
        assert_eq!(bm.segment(0).length, 6);
        // A gap in payload position prevents the merge.
        bm.add_segment(BitmapSegment::new(6, 1, 8));
        assert_eq!(bm.n_segments(), 2);
    }

    #[test]
    fn from_dense_bits() {
        // Bits 1,2,3 and 6 set out of 8.
        let bm = EmptyBitmap::from_dense_bits(&[0b0100_1110], 8);
        assert_eq!(bm.n_segments(), 2);
        assert_eq!(*bm.segment(0), BitmapSegment::new(1, 3, 0));
        assert_eq!(*bm.segment(1), BitmapSegment::new(6, 1, 3));
        assert_eq!(bm.count(), 4);
    }

    #[test]
    fn segment_iterator_virtual_segments() {
        let bm = sample();
        let mut it = bm.segment_iter();
        assert_eq!(it.virtual_segment(), BitmapSegment::new(3, 5, 5));
        it.advance_within_segment(2);
        assert_eq!(it.virtual_segment(), BitmapSegment::new(5, 3, 7));
        it.advance_by(3); // exactly the remainder: moves to next segment
        assert_eq!(it.virtual_segment(), BitmapSegment::new(10, 1, 11));
        it.advance_to_next();
        assert_eq!(it.virtual_segment(), BitmapSegment::new(13, 3, 14));
        it.advance_to_next();
        assert!(it.end());
    }

    #[test]
    fn cut_restricts_to_sub_box() {
        // A 4x4 chunk at origin (0,0), fully populated.
        let bm = EmptyBitmap::from_segments([BitmapSegment::new(0, 16, 0)]);
        // Keep rows 1..=2, columns 1..=2.
        let cut = bm.cut(&[0, 0], &[3, 3], &[1, 1], &[2, 2]);
        assert_eq!(cut.count(), 4);
        // Positions 5, 6, 9, 10 survive (row-major, row*4+col).
        for pos in [5i64, 6, 9, 10] {
            assert!(!cut.is_empty(pos), "position {pos} should stay set");
        }
        for pos in [0i64, 1, 4, 7, 8, 11, 15] {
            assert!(cut.is_empty(pos));
        }
        // Payload indexes are dense over the survivors.
        assert_eq!(cut.value_index(5), Some(0));
        assert_eq!(cut.value_index(6), Some(1));
        assert_eq!(cut.value_index(9), Some(2));
        assert_eq!(cut.value_index(10), Some(3));
    }

    #[test]
    fn cut_of_sparse_bitmap() {
        // 3x3 box, bits at (0,1)=1, (1,1)=4, (2,2)=8.
        let bm = EmptyBitmap::from_segments([
            BitmapSegment::new(1, 1, 0),
            BitmapSegment::new(4, 1, 1),
            BitmapSegment::new(8, 1, 2),
        ]);
        let cut = bm.cut(&[0, 0], &[2, 2], &[1, 0], &[2, 2]);
        assert_eq!(cut.count(), 2);
        assert!(cut.is_empty(1));
        assert!(!cut.is_empty(4));
        assert!(!cut.is_empty(8));
        assert_eq!(cut.value_index(4), Some(0));
        assert_eq!(cut.value_index(8), Some(1));
    }

    #[test]
    fn cell_skip() {
        let bm = sample();
        let mut it = bm.iter();
        assert!(BitmapCellIterator::skip(&mut it, 5));
        assert_eq!((it.l_pos(), it.p_pos()), (10, 11));
        assert!(BitmapCellIterator::skip(&mut it, 3));
        assert_eq!((it.l_pos(), it.p_pos()), (15, 16));
        assert!(!BitmapCellIterator::skip(&mut it, 1));
        assert!(it.end());
    }
}
