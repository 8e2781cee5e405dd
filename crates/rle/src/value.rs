//! Cell values
//!
//! The storage engine is type-agnostic: a cell is either missing (with a
//! small integer reason code) or a byte string whose interpretation
//! belongs to the schema layer. Fixed-size attributes always carry
//! `elem_size` bytes; variable-size attributes carry arbitrary lengths;
//! boolean attributes carry a single `0`/`1` byte.

/// One cell value as seen by builders and iterators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Missing cell; the payload records the reason code instead of data.
    Null(u8),
    /// Present cell payload bytes.
    Data(Vec<u8>),
}

impl Value {
    /// Present value from a byte slice.
    pub fn bytes(data: &[u8]) -> Self {
        Value::Data(data.to_vec())
    }

    /// Present value from a little-endian i64 (the common fixed-size case
    /// in tests).
    pub fn int64(v: i64) -> Self {
        Value::Data(v.to_le_bytes().to_vec())
    }

    /// Boolean value as a single byte.
    pub fn boolean(v: bool) -> Self {
        Value::Data(vec![v as u8])
    }

    /// Missing value with reason 0.
    pub fn null() -> Self {
        Value::Null(0)
    }

    /// True if the value is missing.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    /// Missing-reason code, if missing.
    pub fn missing_reason(&self) -> Option<u8> {
        match self {
            Value::Null(r) => Some(*r),
            Value::Data(_) => None,
        }
    }

    /// Data bytes, if present.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Value::Null(_) => None,
            Value::Data(d) => Some(d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors() {
        assert_eq!(Value::int64(7).data().unwrap(), &7i64.to_le_bytes());
        assert_eq!(Value::null().missing_reason(), Some(0));
        assert_eq!(Value::Null(3).missing_reason(), Some(3));
        assert!(Value::boolean(true).data().unwrap() == &[1u8]);
        assert!(!Value::bytes(b"abc").is_null());
    }
}
