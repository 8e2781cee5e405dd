//! Incremental payload and bitmap construction
//!
//! [`PayloadBuilder`] accepts one value at a time and coalesces
//! consecutive equal values into constant runs and consecutive equal
//! missing-reasons into null runs. Finishing appends the terminator
//! segment that carries the total element count.
//!
//! [`BitmapBuilder`] accepts strictly increasing set positions and
//! assigns payload indexes densely.

use crate::bitmap::{BitmapSegment, EmptyBitmap};
use crate::payload::{push_var_datum, Payload, PayloadSegment};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Literal,
    Constant,
    Null(u8),
}

#[derive(Debug, Clone)]
struct OpenRun {
    start_ppos: i64,
    value_index: u32,
    kind: RunKind,
    length: i64,
    last: Option<Value>,
}

/// Builds a [`Payload`] by appending values in physical order.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    segments: Vec<PayloadSegment>,
    data: Vec<u8>,
    var_part: Vec<u8>,
    elem_size: u64,
    is_boolean: bool,
    next_ppos: i64,
    values_count: u64,
    open: Option<OpenRun>,
}

impl PayloadBuilder {
    /// Builder for a fixed-size element type.
    pub fn fixed(elem_size: u64) -> Self {
        assert!(elem_size > 0);
        Self::with_layout(elem_size, false)
    }

    /// Builder for a variable-size element type.
    pub fn var_size() -> Self {
        Self::with_layout(0, false)
    }

    /// Builder for packed boolean elements.
    pub fn boolean() -> Self {
        Self::with_layout(1, true)
    }

    fn with_layout(elem_size: u64, is_boolean: bool) -> Self {
        PayloadBuilder {
            segments: Vec::new(),
            data: Vec::new(),
            var_part: Vec::new(),
            elem_size,
            is_boolean,
            next_ppos: 0,
            values_count: 0,
            open: None,
        }
    }

    /// Number of cells appended so far.
    pub fn len(&self) -> usize {
        self.next_ppos as usize
    }

    /// True when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.next_ppos == 0
    }

    /// Append one cell value.
    ///
    /// Consecutive equal values collapse into a constant run; consecutive
    /// nulls with the same reason collapse into a null run.
    pub fn append(&mut self, v: &Value) {
        match v {
            Value::Null(reason) => self.append_null(*reason),
            Value::Data(_) => self.append_data(v),
        }
        self.next_ppos += 1;
    }

    /// Append the same value `count` times.
    pub fn append_repeated(&mut self, v: &Value, count: u64) {
        for _ in 0..count {
            self.append(v);
        }
    }

    fn append_null(&mut self, reason: u8) {
        if let Some(open) = self.open.as_mut() {
            if open.kind == RunKind::Null(reason) {
                open.length += 1;
                return;
            }
        }
        self.close_open();
        self.open = Some(OpenRun {
            start_ppos: self.next_ppos,
            value_index: reason as u32,
            kind: RunKind::Null(reason),
            length: 1,
            last: None,
        });
    }

    fn append_data(&mut self, v: &Value) {
        let equal_to_last = self
            .open
            .as_ref()
            .and_then(|o| o.last.as_ref())
            .map(|last| last == v)
            .unwrap_or(false);

        if let Some(open) = self.open.as_mut() {
            match open.kind {
                RunKind::Constant if equal_to_last => {
                    open.length += 1;
                    return;
                }
                RunKind::Literal if equal_to_last => {
                    // Second occurrence in a row: turn the tail of the
                    // literal run into a constant run.
                    if open.length == 1 {
                        open.kind = RunKind::Constant;
                        open.length = 2;
                    } else {
                        let split = OpenRun {
                            start_ppos: open.start_ppos + open.length - 1,
                            value_index: open.value_index + open.length as u32 - 1,
                            kind: RunKind::Constant,
                            length: 2,
                            last: open.last.clone(),
                        };
                        open.length -= 1;
                        self.close_open();
                        self.open = Some(split);
                    }
                    return;
                }
                RunKind::Literal => {
                    let _idx = self.store_value(v);
                    let open = self.open.as_mut().unwrap();
                    open.length += 1;
                    open.last = Some(v.clone());
                    return;
                }
                _ => {}
            }
        }
        // Close whatever was open and start a fresh literal run.
        self.close_open();
        let idx = self.store_value(v);
        self.open = Some(OpenRun {
            start_ppos: self.next_ppos,
            value_index: idx,
            kind: RunKind::Literal,
            length: 1,
            last: Some(v.clone()),
        });
    }

    fn store_value(&mut self, v: &Value) -> u32 {
        let bytes = v.data().expect("store_value requires a present value");
        let index = self.values_count;
        if self.is_boolean {
            assert_eq!(bytes.len(), 1);
            let bit = index as usize;
            if bit >> 3 >= self.data.len() {
                self.data.push(0);
            }
            if bytes[0] != 0 {
                self.data[bit >> 3] |= 1 << (bit & 7);
            }
        } else if self.elem_size == 0 {
            let offset = push_var_datum(&mut self.var_part, bytes);
            self.data.extend_from_slice(&offset.to_le_bytes());
        } else {
            assert_eq!(bytes.len() as u64, self.elem_size);
            self.data.extend_from_slice(bytes);
        }
        self.values_count += 1;
        debug_assert!(index < (1 << 30));
        index as u32
    }

    fn close_open(&mut self) {
        if let Some(open) = self.open.take() {
            let seg = match open.kind {
                RunKind::Literal => PayloadSegment::literal(open.start_ppos, open.value_index),
                RunKind::Constant => PayloadSegment::constant(open.start_ppos, open.value_index),
                RunKind::Null(reason) => PayloadSegment::null_run(open.start_ppos, reason),
            };
            self.segments.push(seg);
        }
    }

    /// Finish: close the last run, append the terminator and assemble the
    /// payload.
    pub fn finish(mut self) -> Payload {
        self.close_open();
        self.segments
            .push(PayloadSegment::terminator(self.next_ppos));
        let var_offs = if self.elem_size == 0 {
            let fixed_len = self.data.len() as u64;
            self.data.extend_from_slice(&self.var_part);
            fixed_len
        } else {
            0
        };
        Payload {
            segments: self.segments,
            elem_size: self.elem_size,
            var_offs,
            is_boolean: self.is_boolean,
            data: self.data,
        }
    }
}

/// Builds an [`EmptyBitmap`] from strictly increasing set positions.
#[derive(Debug, Clone, Default)]
pub struct BitmapBuilder {
    segments: Vec<BitmapSegment>,
    next_ppos: i64,
}

impl BitmapBuilder {
    /// New empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a logical position as set; positions must arrive in strictly
    /// increasing order. Payload indexes are assigned densely.
    pub fn set(&mut self, l_pos: i64) {
        if let Some(last) = self.segments.last_mut() {
            debug_assert!(l_pos >= last.l_end());
            if l_pos == last.l_end() {
                last.length += 1;
                self.next_ppos += 1;
                return;
            }
        }
        self.segments
            .push(BitmapSegment::new(l_pos, 1, self.next_ppos));
        self.next_ppos += 1;
    }

    /// Mark `length` consecutive positions as set.
    pub fn set_run(&mut self, l_pos: i64, length: i64) {
        debug_assert!(length > 0);
        for p in l_pos..l_pos + length {
            self.set(p);
        }
    }

    /// Number of set bits so far.
    pub fn count(&self) -> u64 {
        self.next_ppos as u64
    }

    /// Finish and return the bitmap.
    pub fn finish(self) -> EmptyBitmap {
        EmptyBitmap::from_segments(self.segments)
    }
}
