//! RLE payload
//!
//! A payload stores the cell values of one chunk attribute in
//! stride-major order, split into segments. Each segment starts at a
//! physical position and is one of:
//!
//! - a *literal* run: `value_index` points at the first of `length`
//!   consecutive stored values;
//! - a *constant* run (`same`): every cell shares the single value at
//!   `value_index`;
//! - a *null* run (`null`): every cell is missing and `value_index`
//!   carries the missing-reason code.
//!
//! Segment length is implicit: it is the distance to the next segment's
//! physical position, so a terminator segment holding the total element
//! count always follows the last real segment.
//!
//! ```text
//! values:   1 1 1 2 2 3 . . . . . 5 5 5        (. = null reason 0)
//! segments: {0,v0,same} {3,v1,same} {5,v2,same} {6,null 0} {11,v3,same} {14 end}
//! ```
//!
//! # Packed layout
//!
//! ```text
//! ┌───────────┬───────────┬────────────┬────────────┬───────────┬───────┐
//! │ magic (8) │ n_segs (8)│ elem_size(8)│ data_size(8)│ var_offs(8)│ flags │
//! ├───────────┴───────────┴────────────┴────────────┴───────────┴───────┤
//! │ (n_segs + 1) segments: p_position (8) + packed bits (4)             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │ data: fixed part, then var part at var_offs (var-size types only)   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Variable-size data: the fixed part holds one 4-byte offset per stored
//! value, relative to the var part; each var datum is prefixed by a 1-byte
//! length, or a `0` byte followed by a 4-byte length when 256 bytes or
//! more. Boolean data is packed bits.

use crate::value::Value;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tessera_core::{Result, StorageError};

/// Magic bytes prefixing a packed payload.
pub const PAYLOAD_MAGIC: u64 = u64::from_le_bytes(*b"TSRLEPLD");

/// Byte size of the packed payload header.
pub const PAYLOAD_HEADER_SIZE: usize = 48;

/// Byte size of one packed segment.
pub const PAYLOAD_SEGMENT_SIZE: usize = 12;

const VALUE_INDEX_MASK: u32 = (1 << 30) - 1;
const SAME_BIT: u32 = 1 << 30;
const NULL_BIT: u32 = 1 << 31;

/// One payload segment; 30-bit value index plus `same`/`null` flags,
/// exactly as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSegment {
    /// Physical position of the first cell of the segment.
    pub p_position: i64,
    bits: u32,
}

impl PayloadSegment {
    /// General constructor.
    pub fn new(p_position: i64, value_index: u32, same: bool, null: bool) -> Self {
        debug_assert!(value_index <= VALUE_INDEX_MASK);
        let mut bits = value_index & VALUE_INDEX_MASK;
        if same {
            bits |= SAME_BIT;
        }
        if null {
            bits |= NULL_BIT;
        }
        PayloadSegment { p_position, bits }
    }

    /// Literal run of distinct values starting at `value_index`.
    pub fn literal(p_position: i64, value_index: u32) -> Self {
        Self::new(p_position, value_index, false, false)
    }

    /// Constant run sharing the value at `value_index`.
    pub fn constant(p_position: i64, value_index: u32) -> Self {
        Self::new(p_position, value_index, true, false)
    }

    /// Null run with a missing-reason code.
    pub fn null_run(p_position: i64, missing_reason: u8) -> Self {
        Self::new(p_position, missing_reason as u32, true, true)
    }

    /// Terminator carrying the total element count.
    pub fn terminator(count: i64) -> Self {
        PayloadSegment {
            p_position: count,
            bits: 0,
        }
    }

    /// Stored value index (or missing reason for null runs).
    pub fn value_index(&self) -> u32 {
        self.bits & VALUE_INDEX_MASK
    }

    /// True for constant runs.
    pub fn is_same(&self) -> bool {
        self.bits & SAME_BIT != 0
    }

    /// True for null runs.
    pub fn is_null(&self) -> bool {
        self.bits & NULL_BIT != 0
    }

    fn packed_bits(&self) -> u32 {
        self.bits
    }

    fn from_packed(p_position: i64, bits: u32) -> Self {
        PayloadSegment { p_position, bits }
    }
}

/// A virtual segment with explicit length, produced by
/// [`PayloadSegmentIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentWithLength {
    /// Physical position of the first cell.
    pub p_position: i64,
    /// Number of cells in the (virtual) segment.
    pub length: i64,
    /// Effective value index at the start of the virtual segment.
    pub value_index: u32,
    /// Constant-run flag.
    pub same: bool,
    /// Null-run flag.
    pub null: bool,
}

/// RLE-packed cell values of one chunk attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Segments including the terminator (`n_segments() + 1` entries when
    /// non-empty).
    pub(crate) segments: Vec<PayloadSegment>,
    pub(crate) elem_size: u64,
    pub(crate) var_offs: u64,
    pub(crate) is_boolean: bool,
    pub(crate) data: Vec<u8>,
}

impl Payload {
    /// Build a payload from a dense fixed-size value array: one literal
    /// segment covering all `n_elems` cells.
    pub fn from_dense_fixed(raw: Vec<u8>, elem_size: u64, n_elems: u64) -> Self {
        debug_assert!(elem_size > 0);
        debug_assert_eq!(raw.len() as u64, elem_size * n_elems);
        let segments = if n_elems == 0 {
            vec![PayloadSegment::terminator(0)]
        } else {
            vec![
                PayloadSegment::literal(0, 0),
                PayloadSegment::terminator(n_elems as i64),
            ]
        };
        Payload {
            segments,
            elem_size,
            var_offs: 0,
            is_boolean: false,
            data: raw,
        }
    }

    /// Total number of cells covered by the segments.
    pub fn count(&self) -> usize {
        match self.segments.last() {
            Some(t) => t.p_position as usize,
            None => 0,
        }
    }

    /// Number of real (non-terminator) segments.
    pub fn n_segments(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }

    /// Element size in bytes; 0 for variable-size types.
    pub fn elem_size(&self) -> u64 {
        self.elem_size
    }

    /// True for packed-bit boolean payloads.
    pub fn is_boolean(&self) -> bool {
        self.is_boolean
    }

    /// Byte size of the data area (fixed plus var part).
    pub fn data_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Number of stored values in the data area.
    pub fn stored_values(&self) -> usize {
        if self.elem_size == 0 {
            self.var_offs as usize / 4
        } else if self.is_boolean {
            // Bit count is bounded by the data area; exact count lives in
            // the segments.
            self.data.len() * 8
        } else {
            self.data.len() / self.elem_size as usize
        }
    }

    /// Segment by index; index `n_segments()` is the terminator.
    pub fn segment(&self, i: usize) -> &PayloadSegment {
        &self.segments[i]
    }

    /// Length of segment `i`.
    pub fn segment_length(&self, i: usize) -> i64 {
        debug_assert!(i < self.n_segments());
        self.segments[i + 1].p_position - self.segments[i].p_position
    }

    /// Index of the segment containing `pos`, or `n_segments()` when the
    /// position is past the end.
    pub fn find_segment(&self, pos: i64) -> usize {
        let n = self.n_segments();
        let mut l = 0;
        let mut r = n;
        while l < r {
            let m = (l + r) / 2;
            if self.segments[m + 1].p_position <= pos {
                l = m + 1;
            } else {
                r = m;
            }
        }
        r
    }

    /// Raw bytes of a stored fixed-size value.
    pub fn fixed_value(&self, index: usize) -> &[u8] {
        debug_assert!(self.elem_size > 0 && !self.is_boolean);
        let sz = self.elem_size as usize;
        &self.data[index * sz..(index + 1) * sz]
    }

    /// Raw bytes of a stored variable-size value.
    pub fn var_value(&self, index: usize) -> Result<&[u8]> {
        debug_assert!(self.elem_size == 0);
        let fixed = &self.data[..self.var_offs as usize];
        let mut at = &fixed[index * 4..];
        let offset = at.read_u32::<LittleEndian>().map_err(|_| {
            StorageError::corrupted("payload var offset truncated")
        })? as usize;
        let var = &self.data[self.var_offs as usize..];
        read_var_datum(var, offset)
    }

    /// Test a bit of a boolean payload.
    pub fn check_bit(&self, bit: usize) -> bool {
        debug_assert!(self.is_boolean);
        self.data[bit >> 3] & (1 << (bit & 7)) != 0
    }

    /// Materialize the stored value at data index `index`.
    pub fn value_by_index(&self, index: usize) -> Result<Value> {
        if self.is_boolean {
            Ok(Value::boolean(self.check_bit(index)))
        } else if self.elem_size == 0 {
            Ok(Value::Data(self.var_value(index)?.to_vec()))
        } else {
            Ok(Value::Data(self.fixed_value(index).to_vec()))
        }
    }

    /// Materialize the cell at physical position `pos`, or `None` when the
    /// position is past the end.
    pub fn value_at(&self, pos: i64) -> Result<Option<Value>> {
        let mut it = self.iter();
        if !it.set_position(pos) {
            return Ok(None);
        }
        it.item().map(Some)
    }

    /// Size of the packed representation.
    pub fn packed_size(&self) -> usize {
        PAYLOAD_HEADER_SIZE + self.segments.len() * PAYLOAD_SEGMENT_SIZE + self.data.len()
    }

    /// Serialize into the packed on-disk form.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_size());
        out.extend_from_slice(&PAYLOAD_MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.n_segments() as u64).to_le_bytes());
        out.extend_from_slice(&self.elem_size.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.var_offs.to_le_bytes());
        out.push(self.is_boolean as u8);
        out.extend_from_slice(&[0u8; 7]);
        for seg in &self.segments {
            out.extend_from_slice(&seg.p_position.to_le_bytes());
            out.extend_from_slice(&seg.packed_bits().to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse the packed on-disk form.
    pub fn unpack(src: &[u8]) -> Result<Self> {
        if src.len() < PAYLOAD_HEADER_SIZE {
            return Err(StorageError::corrupted("payload header truncated"));
        }
        let magic = u64::from_le_bytes(src[0..8].try_into().unwrap());
        if magic != PAYLOAD_MAGIC {
            return Err(StorageError::corrupted("payload magic mismatch"));
        }
        let n_segs = u64::from_le_bytes(src[8..16].try_into().unwrap()) as usize;
        let elem_size = u64::from_le_bytes(src[16..24].try_into().unwrap());
        let data_size = u64::from_le_bytes(src[24..32].try_into().unwrap()) as usize;
        let var_offs = u64::from_le_bytes(src[32..40].try_into().unwrap());
        let is_boolean = src[40] != 0;
        let seg_bytes = (n_segs + 1) * PAYLOAD_SEGMENT_SIZE;
        let need = PAYLOAD_HEADER_SIZE + seg_bytes + data_size;
        if src.len() < need {
            return Err(StorageError::corrupted("payload body truncated"));
        }
        let mut segments = Vec::with_capacity(n_segs + 1);
        let mut at = PAYLOAD_HEADER_SIZE;
        for _ in 0..=n_segs {
            let p_position = i64::from_le_bytes(src[at..at + 8].try_into().unwrap());
            let bits = u32::from_le_bytes(src[at + 8..at + 12].try_into().unwrap());
            if let Some(prev) = segments.last() {
                let prev: &PayloadSegment = prev;
                if p_position <= prev.p_position {
                    return Err(StorageError::corrupted(
                        "payload segments not strictly increasing",
                    ));
                }
            }
            segments.push(PayloadSegment::from_packed(p_position, bits));
            at += PAYLOAD_SEGMENT_SIZE;
        }
        if var_offs as usize > data_size {
            return Err(StorageError::corrupted("payload var offset out of range"));
        }
        Ok(Payload {
            segments,
            elem_size,
            var_offs,
            is_boolean,
            data: src[at..at + data_size].to_vec(),
        })
    }

    /// Read the element count out of a packed payload by looking at the
    /// terminator segment only.
    pub fn peek_count(src: &[u8]) -> Result<u64> {
        if src.len() < PAYLOAD_HEADER_SIZE {
            return Err(StorageError::corrupted("payload header truncated"));
        }
        let magic = u64::from_le_bytes(src[0..8].try_into().unwrap());
        if magic != PAYLOAD_MAGIC {
            return Err(StorageError::corrupted("payload magic mismatch"));
        }
        let n_segs = u64::from_le_bytes(src[8..16].try_into().unwrap()) as usize;
        let at = PAYLOAD_HEADER_SIZE + n_segs * PAYLOAD_SEGMENT_SIZE;
        if src.len() < at + 8 {
            return Err(StorageError::corrupted("payload terminator truncated"));
        }
        let count = i64::from_le_bytes(src[at..at + 8].try_into().unwrap());
        Ok(count.max(0) as u64)
    }

    /// Cell-level iterator.
    pub fn iter(&self) -> PayloadCellIterator<'_> {
        PayloadCellIterator::new(self)
    }

    /// Segment-level iterator with partial-consumption support.
    pub fn segment_iter(&self) -> PayloadSegmentIterator<'_> {
        PayloadSegmentIterator::new(self)
    }

    /// Materialize every cell; convenience for tests and tile building.
    pub fn values(&self) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(self.count());
        let mut it = self.iter();
        while !it.end() {
            out.push(it.item()?);
            it.advance();
        }
        Ok(out)
    }
}

/// Append one var-size datum (with its 1-or-5-byte length prefix) to a
/// var part and return the datum's offset.
pub(crate) fn push_var_datum(var: &mut Vec<u8>, bytes: &[u8]) -> u32 {
    let offset = var.len() as u32;
    // A zero length byte marks the 5-byte form, so empty datums must use
    // it too.
    if !bytes.is_empty() && bytes.len() < 256 {
        var.push(bytes.len() as u8);
    } else {
        var.push(0);
        var.write_u32::<LittleEndian>(bytes.len() as u32)
            .expect("writing to Vec cannot fail");
    }
    var.extend_from_slice(bytes);
    offset
}

/// Read one var-size datum at `offset` of a var part.
pub(crate) fn read_var_datum(var: &[u8], offset: usize) -> Result<&[u8]> {
    let corrupt = || StorageError::corrupted("payload var datum truncated");
    let first = *var.get(offset).ok_or_else(corrupt)?;
    let (start, len) = if first != 0 {
        (offset + 1, first as usize)
    } else {
        if offset + 5 > var.len() {
            return Err(corrupt());
        }
        let len = (&var[offset + 1..offset + 5])
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupt())? as usize;
        (offset + 5, len)
    };
    var.get(start..start + len).ok_or_else(corrupt)
}

/// Walks payload cells one physical position at a time.
#[derive(Debug, Clone)]
pub struct PayloadCellIterator<'a> {
    payload: &'a Payload,
    curr_seg: usize,
    curr_ppos: i64,
}

impl<'a> PayloadCellIterator<'a> {
    fn new(payload: &'a Payload) -> Self {
        let mut it = PayloadCellIterator {
            payload,
            curr_seg: 0,
            curr_ppos: -1,
        };
        it.reset();
        it
    }

    /// Rewind to the first cell.
    pub fn reset(&mut self) {
        self.curr_seg = 0;
        if !self.end() {
            self.curr_ppos = self.payload.segment(0).p_position;
        }
    }

    /// True when all cells are consumed.
    pub fn end(&self) -> bool {
        self.curr_seg >= self.payload.n_segments()
    }

    fn seg(&self) -> &PayloadSegment {
        self.payload.segment(self.curr_seg)
    }

    fn seg_end(&self) -> i64 {
        self.payload.segment(self.curr_seg + 1).p_position
    }

    /// Current physical position.
    pub fn p_pos(&self) -> i64 {
        debug_assert!(!self.end());
        self.curr_ppos
    }

    /// Current segment index.
    pub fn curr_segment(&self) -> usize {
        self.curr_seg
    }

    /// True inside a null run.
    pub fn is_null(&self) -> bool {
        debug_assert!(!self.end());
        self.seg().is_null()
    }

    /// True inside a constant run.
    pub fn is_same(&self) -> bool {
        debug_assert!(!self.end());
        self.seg().is_same()
    }

    /// Missing-reason code of a null run.
    pub fn missing_reason(&self) -> u8 {
        debug_assert!(self.is_null());
        self.seg().value_index() as u8
    }

    /// Effective data index of the current cell. Constant and null runs
    /// return the stored index; literal runs add the offset into the run.
    pub fn value_index(&self) -> u32 {
        debug_assert!(!self.end());
        let seg = self.seg();
        if seg.is_same() || seg.is_null() {
            seg.value_index()
        } else {
            seg.value_index() + (self.curr_ppos - seg.p_position) as u32
        }
    }

    /// Length of the current segment.
    pub fn segment_length(&self) -> i64 {
        debug_assert!(!self.end());
        self.payload.segment_length(self.curr_seg)
    }

    /// Cells remaining in the current segment from the current position.
    pub fn available(&self) -> i64 {
        debug_assert!(!self.end());
        self.seg_end() - self.curr_ppos
    }

    /// Number of equal cells from the current position: the rest of a
    /// constant run, or 1 inside a literal run.
    pub fn repeat_count(&self) -> i64 {
        debug_assert!(!self.end());
        if self.seg().is_same() {
            self.available()
        } else {
            1
        }
    }

    /// Current bit of a boolean payload.
    pub fn check_bit(&self) -> bool {
        debug_assert!(self.payload.is_boolean);
        let seg = self.seg();
        let idx = seg.value_index() as i64
            + if seg.is_same() {
                0
            } else {
                self.curr_ppos - seg.p_position
            };
        self.payload.check_bit(idx as usize)
    }

    /// Materialize the current cell.
    pub fn item(&self) -> Result<Value> {
        debug_assert!(!self.end());
        if self.is_null() {
            return Ok(Value::Null(self.missing_reason()));
        }
        self.payload.value_by_index(self.value_index() as usize)
    }

    /// Advance one cell, crossing into the next segment at run end.
    pub fn advance(&mut self) {
        debug_assert!(!self.end());
        if self.curr_ppos + 1 < self.seg_end() {
            self.curr_ppos += 1;
        } else {
            self.to_next_segment();
        }
    }

    /// Jump to the start of the next segment.
    pub fn to_next_segment(&mut self) {
        debug_assert!(!self.end());
        self.curr_seg += 1;
        if !self.end() {
            self.curr_ppos = self.seg().p_position;
        }
    }

    /// Position on a physical position; binary-searches the segments.
    /// Returns false (iterator at end) when out of range.
    pub fn set_position(&mut self, p_pos: i64) -> bool {
        self.curr_seg = self.payload.find_segment(p_pos);
        if self.end() || self.seg().p_position > p_pos {
            self.curr_seg = self.payload.n_segments();
            return false;
        }
        self.curr_ppos = p_pos;
        true
    }

    /// Advance by `count` cells, re-searching when the target lies past
    /// the next segment.
    pub fn advance_by(&mut self, count: i64) {
        debug_assert!(!self.end());
        self.curr_ppos += count;
        if self.curr_ppos >= self.seg_end() {
            self.curr_seg += 1;
            if self.curr_seg < self.payload.n_segments()
                && self.curr_ppos < self.seg_end()
                && self.curr_ppos >= self.seg().p_position
            {
                return;
            }
            let target = self.curr_ppos;
            self.set_position(target);
        }
    }

    /// Boolean payloads only: skip `count` cells and return how many of
    /// the skipped bits were set. Keeps a data-tile reader consistent
    /// with its bitmap-tile reader.
    pub fn skip(&mut self, mut count: i64) -> i64 {
        debug_assert!(self.payload.is_boolean);
        let mut set_bits = 0i64;
        while !self.end() {
            let seg = *self.seg();
            let seg_end = self.seg_end();
            if self.curr_ppos + count >= seg_end {
                let tail = seg_end - self.curr_ppos;
                count -= tail;
                set_bits += self.count_bits(&seg, tail);
                self.to_next_segment();
            } else {
                set_bits += self.count_bits(&seg, count);
                self.curr_ppos += count;
                break;
            }
        }
        set_bits
    }

    fn count_bits(&self, seg: &PayloadSegment, n: i64) -> i64 {
        if seg.is_null() {
            return 0;
        }
        if seg.is_same() {
            if self.payload.check_bit(seg.value_index() as usize) {
                n
            } else {
                0
            }
        } else {
            let beg = seg.value_index() as i64 + self.curr_ppos - seg.p_position;
            (beg..beg + n)
                .filter(|&b| self.payload.check_bit(b as usize))
                .count() as i64
        }
    }
}

/// Iterates payload segments, supporting partial consumption via virtual
/// segments. A thin wrapper over the cell iterator.
#[derive(Debug, Clone)]
pub struct PayloadSegmentIterator<'a> {
    it: PayloadCellIterator<'a>,
}

impl<'a> PayloadSegmentIterator<'a> {
    fn new(payload: &'a Payload) -> Self {
        PayloadSegmentIterator {
            it: PayloadCellIterator::new(payload),
        }
    }

    /// Rewind to the beginning.
    pub fn reset(&mut self) {
        self.it.reset();
    }

    /// True when no segments remain.
    pub fn end(&self) -> bool {
        self.it.end()
    }

    /// Current segment index.
    pub fn curr_segment(&self) -> usize {
        self.it.curr_segment()
    }

    /// The remaining part of the current segment.
    pub fn virtual_segment(&self) -> SegmentWithLength {
        debug_assert!(!self.end());
        SegmentWithLength {
            p_position: self.it.p_pos(),
            length: self.it.available(),
            value_index: self.it.value_index(),
            same: self.it.is_same(),
            null: self.it.is_null(),
        }
    }

    /// Consume `step` cells of the current segment; `step` must be less
    /// than the remaining virtual-segment length.
    pub fn advance_within_segment(&mut self, step: i64) {
        debug_assert!(step > 0);
        debug_assert!(!self.end());
        debug_assert!(self.it.available() > step);
        self.it.advance_by(step);
    }

    /// Move to the start of the next segment.
    pub fn advance_to_next(&mut self) {
        debug_assert!(!self.end());
        self.it.to_next_segment();
    }

    /// Consume `step` cells, finishing the segment exactly when `step`
    /// equals the remaining length.
    pub fn advance_by(&mut self, step: i64) {
        debug_assert!(!self.end());
        debug_assert!(step <= self.it.available());
        if step == self.it.available() {
            self.it.to_next_segment();
        } else {
            self.it.advance_by(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PayloadBuilder;

    fn fixed_payload() -> Payload {
        // 1,1,1,2,2,3,<null0 x5>,5,5,5
        let mut b = PayloadBuilder::fixed(8);
        for v in [1i64, 1, 1, 2, 2, 3] {
            b.append(&Value::int64(v));
        }
        for _ in 0..5 {
            b.append(&Value::null());
        }
        for v in [5i64, 5, 5] {
            b.append(&Value::int64(v));
        }
        b.finish()
    }

    #[test]
    fn count_and_segments() {
        let p = fixed_payload();
        assert_eq!(p.count(), 14);
        // 1-run, 2-run, 3 literal, null-run, 5-run.
        assert_eq!(p.n_segments(), 5);
        assert_eq!(p.segment_length(0), 3);
        assert_eq!(p.segment_length(3), 5);
    }

    #[test]
    fn find_segment_boundaries() {
        let p = fixed_payload();
        assert_eq!(p.find_segment(0), 0);
        assert_eq!(p.find_segment(2), 0);
        assert_eq!(p.find_segment(3), 1);
        assert_eq!(p.find_segment(5), 2);
        assert_eq!(p.find_segment(6), 3);
        assert_eq!(p.find_segment(11), 4);
        assert_eq!(p.find_segment(13), 4);
        assert_eq!(p.find_segment(14), 5); // past the end
    }

    #[test]
    fn cell_iterator_values() {
        let p = fixed_payload();
        let got = p.values().unwrap();
        let mut expected: Vec<Value> = [1i64, 1, 1, 2, 2, 3].iter().map(|&v| Value::int64(v)).collect();
        expected.extend(std::iter::repeat(Value::null()).take(5));
        expected.extend([5i64, 5, 5].iter().map(|&v| Value::int64(v)));
        assert_eq!(got, expected);
    }

    #[test]
    fn value_index_accounts_for_run_kinds() {
        let p = fixed_payload();
        let mut it = p.iter();
        // Constant run: index stays put.
        assert!(it.set_position(1));
        assert!(it.is_same());
        assert_eq!(it.value_index(), it.value_index());
        let const_idx = it.value_index();
        it.advance();
        assert_eq!(it.value_index(), const_idx);
        // Null run: reason code.
        assert!(it.set_position(8));
        assert!(it.is_null());
        assert_eq!(it.missing_reason(), 0);
        // Repeat counts.
        assert!(it.set_position(11));
        assert_eq!(it.repeat_count(), 3);
        it.advance();
        assert_eq!(it.repeat_count(), 2);
    }

    #[test]
    fn set_position_out_of_range() {
        let p = fixed_payload();
        let mut it = p.iter();
        assert!(!it.set_position(14));
        assert!(it.end());
        assert!(!it.set_position(1000));
        assert!(it.end());
    }

    #[test]
    fn advance_by_crosses_segments() {
        let p = fixed_payload();
        let mut it = p.iter();
        it.advance_by(4); // into the 2-run
        assert_eq!(it.p_pos(), 4);
        it.advance_by(4); // lands inside the null run
        assert_eq!(it.p_pos(), 8);
        assert!(it.is_null());
        it.advance_by(5); // into the final 5-run
        assert_eq!(it.p_pos(), 13);
        it.advance_by(1);
        assert!(it.end());
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let p = fixed_payload();
        let bytes = p.pack();
        assert_eq!(bytes.len(), p.packed_size());
        let parsed = Payload::unpack(&bytes).unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn unpack_rejects_bad_magic_and_truncation() {
        let p = fixed_payload();
        let mut bytes = p.pack();
        bytes[0] ^= 0xFF;
        assert!(Payload::unpack(&bytes).unwrap_err().is_corruption());
        let bytes = p.pack();
        assert!(Payload::unpack(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn peek_count_matches_count() {
        let p = fixed_payload();
        let bytes = p.pack();
        assert_eq!(Payload::peek_count(&bytes).unwrap(), p.count() as u64);
        assert!(Payload::peek_count(&bytes[..4]).is_err());
    }

    #[test]
    fn var_size_values() {
        let mut b = PayloadBuilder::var_size();
        b.append(&Value::bytes(b"a"));
        b.append(&Value::bytes(b"bb"));
        b.append(&Value::bytes(b"bb"));
        b.append(&Value::bytes(b""));
        let long = vec![7u8; 300];
        b.append(&Value::Data(long.clone()));
        let p = b.finish();
        assert_eq!(p.count(), 5);
        let vals = p.values().unwrap();
        assert_eq!(vals[0], Value::bytes(b"a"));
        assert_eq!(vals[1], Value::bytes(b"bb"));
        assert_eq!(vals[2], Value::bytes(b"bb"));
        assert_eq!(vals[3], Value::bytes(b""));
        assert_eq!(vals[4], Value::Data(long));
        let parsed = Payload::unpack(&p.pack()).unwrap();
        assert_eq!(parsed.values().unwrap(), vals);
    }

    #[test]
    fn boolean_bits_and_skip() {
        let mut b = PayloadBuilder::boolean();
        for v in [true, true, false, true, false, false, true, true] {
            b.append(&Value::boolean(v));
        }
        let p = b.finish();
        assert!(p.is_boolean());
        assert_eq!(p.count(), 8);
        let mut it = p.iter();
        assert_eq!(it.skip(3), 2); // T T F
        assert_eq!(it.p_pos(), 3);
        assert_eq!(it.skip(5), 3); // T F F T T
        assert!(it.end());
    }

    #[test]
    fn segment_iterator_partial_consumption() {
        let p = fixed_payload();
        let mut it = p.segment_iter();
        let s = it.virtual_segment();
        assert_eq!((s.p_position, s.length, s.same, s.null), (0, 3, true, false));
        it.advance_by(3);
        let s = it.virtual_segment();
        assert_eq!((s.p_position, s.length), (3, 2));
        it.advance_within_segment(1);
        let s = it.virtual_segment();
        assert_eq!((s.p_position, s.length), (4, 1));
        it.advance_to_next();
        let s = it.virtual_segment();
        assert_eq!((s.p_position, s.length, s.same), (5, 1, false));
    }

    #[test]
    fn dense_fixed_constructor() {
        let mut raw = Vec::new();
        for v in [10i64, 20, 30] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let p = Payload::from_dense_fixed(raw, 8, 3);
        assert_eq!(p.count(), 3);
        assert_eq!(p.n_segments(), 1);
        assert_eq!(
            p.values().unwrap(),
            vec![Value::int64(10), Value::int64(20), Value::int64(30)]
        );
    }
}
