//! Codec round-trip properties.

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use tessera_rle::{
    BitmapBuilder, BitmapSegment, EmptyBitmap, Payload, PayloadBuilder, Value,
};

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => any::<i64>().prop_map(Value::int64),
        1 => (0u8..4).prop_map(Value::Null),
    ]
}

proptest! {
    #[test]
    fn appended_values_read_back(seq in vec(value_strategy(), 0..300)) {
        let mut b = PayloadBuilder::fixed(8);
        for v in &seq {
            b.append(v);
        }
        let payload = b.finish();
        prop_assert_eq!(payload.count(), seq.len());
        prop_assert_eq!(payload.values().unwrap(), seq);
    }

    #[test]
    fn payload_pack_unpack(seq in vec(value_strategy(), 0..200)) {
        let mut b = PayloadBuilder::fixed(8);
        for v in &seq {
            b.append(v);
        }
        let payload = b.finish();
        let parsed = Payload::unpack(&payload.pack()).unwrap();
        prop_assert_eq!(parsed, payload);
    }

    #[test]
    fn var_size_values_read_back(seq in vec(vec(any::<u8>(), 0..40), 0..100)) {
        let mut b = PayloadBuilder::var_size();
        for bytes in &seq {
            b.append(&Value::Data(bytes.clone()));
        }
        let payload = b.finish();
        let parsed = Payload::unpack(&payload.pack()).unwrap();
        let got = parsed.values().unwrap();
        let expected: Vec<Value> = seq.iter().map(|b| Value::Data(b.clone())).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn boolean_values_read_back(bits in vec(any::<bool>(), 0..300)) {
        let mut b = PayloadBuilder::boolean();
        for &bit in &bits {
            b.append(&Value::boolean(bit));
        }
        let payload = b.finish();
        let got: Vec<bool> = payload
            .values()
            .unwrap()
            .iter()
            .map(|v| v.data().unwrap()[0] != 0)
            .collect();
        prop_assert_eq!(got, bits);
    }

    #[test]
    fn bitmap_pack_unpack(positions in btree_set(0i64..10_000, 0..200)) {
        let mut b = BitmapBuilder::new();
        for &p in &positions {
            b.set(p);
        }
        let bitmap = b.finish();
        prop_assert_eq!(bitmap.count(), positions.len() as u64);
        let parsed = EmptyBitmap::unpack(&bitmap.pack()).unwrap();
        prop_assert_eq!(&parsed, &bitmap);

        // Every set position is found with a dense payload index.
        for (i, &p) in positions.iter().enumerate() {
            prop_assert_eq!(parsed.value_index(p), Some(i as i64));
        }
    }

    #[test]
    fn bitmap_iteration_matches_membership(positions in btree_set(0i64..2_000, 0..100)) {
        let mut b = BitmapBuilder::new();
        for &p in &positions {
            b.set(p);
        }
        let bitmap = b.finish();
        let iterated: Vec<i64> = bitmap.iter().map(|(l, _)| l).collect();
        let expected: Vec<i64> = positions.iter().copied().collect();
        prop_assert_eq!(iterated, expected);
    }
}

#[test]
fn bitmap_invariants_hold_after_unpack() {
    let bitmap = EmptyBitmap::from_segments([
        BitmapSegment::new(0, 3, 0),
        BitmapSegment::new(5, 2, 3),
        BitmapSegment::new(100, 1, 5),
    ]);
    let parsed = EmptyBitmap::unpack(&bitmap.pack()).unwrap();
    // Strictly increasing, never overlapping.
    for i in 1..parsed.n_segments() {
        let prev = parsed.segment(i - 1);
        let curr = parsed.segment(i);
        assert!(curr.l_position >= prev.l_end());
        assert!(curr.p_position >= prev.p_position + prev.length);
    }
}
