//! Tile extraction
//!
//! The tile-mode read path works on dense sub-ranges of a chunk. These
//! operations carve the logical range `[v_start, v_end)` out of a sparse
//! payload/bitmap pair, producing dense tiles.

use crate::bitmap::EmptyBitmap;
use crate::builder::PayloadBuilder;
use crate::payload::Payload;
use crate::value::Value;
use tessera_core::{Result, StorageError};

/// Extract the cells whose logical positions fall in `[v_start, v_end)`
/// and are set in `bitmap`, in logical order, as a dense payload.
pub fn unpack_tile(
    payload: &Payload,
    bitmap: &EmptyBitmap,
    v_start: i64,
    v_end: i64,
) -> Result<Payload> {
    let mut out = if payload.is_boolean() {
        PayloadBuilder::boolean()
    } else if payload.elem_size() == 0 {
        PayloadBuilder::var_size()
    } else {
        PayloadBuilder::fixed(payload.elem_size())
    };
    let mut cells = payload.iter();
    for i in 0..bitmap.n_segments() {
        let seg = bitmap.segment(i);
        if seg.l_end() <= v_start {
            continue;
        }
        if seg.l_position >= v_end {
            break;
        }
        let from = seg.l_position.max(v_start);
        let to = seg.l_end().min(v_end);
        let p_pos = seg.p_position + (from - seg.l_position);
        if !cells.set_position(p_pos) {
            return Err(StorageError::corrupted(
                "empty-bitmap refers past the payload",
            ));
        }
        for _ in from..to {
            if cells.end() {
                return Err(StorageError::corrupted(
                    "empty-bitmap refers past the payload",
                ));
            }
            out.append(&cells.item()?);
            cells.advance();
        }
    }
    Ok(out.finish())
}

/// Render the bitmap itself over `[v_start, v_end)` as a dense boolean
/// payload: one bit per logical position.
pub fn unpack_bitmap_tile(bitmap: &EmptyBitmap, v_start: i64, v_end: i64) -> Payload {
    let mut out = PayloadBuilder::boolean();
    let mut pos = v_start;
    for i in 0..bitmap.n_segments() {
        let seg = bitmap.segment(i);
        if seg.l_end() <= v_start {
            continue;
        }
        if seg.l_position >= v_end {
            break;
        }
        let from = seg.l_position.max(v_start);
        let to = seg.l_end().min(v_end);
        out.append_repeated(&Value::boolean(false), (from - pos) as u64);
        out.append_repeated(&Value::boolean(true), (to - from) as u64);
        pos = to;
    }
    out.append_repeated(&Value::boolean(false), (v_end - pos).max(0) as u64);
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapSegment;

    fn sample() -> (Payload, EmptyBitmap) {
        // Logical layout (16 cells): positions 3..8, 10, 13..16 occupied.
        let bitmap = EmptyBitmap::from_segments([
            BitmapSegment::new(3, 5, 0),
            BitmapSegment::new(10, 1, 5),
            BitmapSegment::new(13, 3, 6),
        ]);
        let mut b = PayloadBuilder::fixed(8);
        for v in 0..9i64 {
            b.append(&Value::int64(v * 100));
        }
        (b.finish(), bitmap)
    }

    #[test]
    fn full_range_extracts_everything() {
        let (payload, bitmap) = sample();
        let tile = unpack_tile(&payload, &bitmap, 0, 16).unwrap();
        assert_eq!(tile.count(), 9);
        assert_eq!(tile.values().unwrap(), payload.values().unwrap());
    }

    #[test]
    fn sub_range_cuts_runs() {
        let (payload, bitmap) = sample();
        // [5, 14) covers logical 5,6,7 (payload 2,3,4), 10 (5), 13 (6).
        let tile = unpack_tile(&payload, &bitmap, 5, 14).unwrap();
        let expected: Vec<Value> = [2i64, 3, 4, 5, 6]
            .iter()
            .map(|&i| Value::int64(i * 100))
            .collect();
        assert_eq!(tile.values().unwrap(), expected);
    }

    #[test]
    fn empty_range() {
        let (payload, bitmap) = sample();
        let tile = unpack_tile(&payload, &bitmap, 8, 10).unwrap();
        assert_eq!(tile.count(), 0);
    }

    #[test]
    fn bitmap_tile_bits() {
        let (_, bitmap) = sample();
        let tile = unpack_bitmap_tile(&bitmap, 0, 16);
        assert!(tile.is_boolean());
        assert_eq!(tile.count(), 16);
        let expected: Vec<bool> = (0..16)
            .map(|p| !bitmap.is_empty(p))
            .collect();
        let got: Vec<bool> = tile
            .values()
            .unwrap()
            .iter()
            .map(|v| v.data().unwrap()[0] != 0)
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn bitmap_tile_sub_range() {
        let (_, bitmap) = sample();
        let tile = unpack_bitmap_tile(&bitmap, 6, 12);
        assert_eq!(tile.count(), 6);
        let got: Vec<bool> = tile
            .values()
            .unwrap()
            .iter()
            .map(|v| v.data().unwrap()[0] != 0)
            .collect();
        // positions 6,7 set; 8,9 empty; 10 set; 11 empty.
        assert_eq!(got, vec![true, true, false, false, true, false]);
    }
}
