//! Order-preserving key encoding for persistent secondary indexes.
//!
//! Keys are encoded as:
//!   [scalar_type: 1 byte][scalar_value: variable][record_offset: 8 bytes LE]
//!
//! The record_offset is appended to the scalar value so two documents with
//! an identical indexed value still produce distinct, uniquely ordered
//! B+ tree keys.

use bson::Bson;

/// Scalar type tags for key encoding. Single-byte encodings also encode the
/// value itself for fixed-size types.
const TAG_NULL: u8 = 0x00;
const TAG_BOOL_FALSE: u8 = 0x01;
const TAG_BOOL_TRUE: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_OBJECT_ID: u8 = 0x05;
const TAG_DATETIME: u8 = 0x06;

/// Encode f64 into bytes that sort naturally (negative < positive).
///
/// IEEE 754 f64 bits don't sort naturally. This transformation:
/// - For positive numbers: flip the sign bit (0x8000...)
/// - For negative numbers: flip all bits
///
/// This produces a byte representation where lexicographic ordering
/// matches numeric ordering.
fn encode_f64_for_sort(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let transformed = if bits & 0x8000_0000_0000_0000 == 0 {
        bits | 0x8000_0000_0000_0000
    } else {
        !bits
    };
    transformed.to_be_bytes() // big-endian so lexicographic == numeric
}

/// Encode `i64` (millis since epoch, as BSON DateTime stores it) for sort,
/// reusing the f64 transform so negative timestamps sort before positive
/// ones.
fn encode_millis_for_sort(millis: i64) -> [u8; 8] {
    encode_f64_for_sort(millis as f64)
}

/// Null-escape `bytes`: every `0x00` becomes `0x00 0xFF`, and the whole
/// string is terminated by `0x00 0x00`. This makes a prefix of a longer
/// string sort before it (the terminator's second byte, `0x00`, is lower
/// than any continuation byte), without needing a length prefix that would
/// otherwise compare before content and break ordering.
fn encode_escaped_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
    out
}

/// Encode a scalar value and record offset into a composite index key.
///
/// The resulting key can be stored in a B+tree and supports:
/// - Natural sort order by scalar value
/// - Duplicate values (different offsets = different keys)
/// - Range scans by scalar value prefix
pub fn encode_index_key(scalar: &Bson, offset: u64) -> Option<Vec<u8>> {
    let mut result = encode_scalar_prefix(scalar)?;
    result.extend_from_slice(&offset.to_le_bytes());
    Some(result)
}

/// Encode just the scalar value prefix (without offset). Useful for range
/// scans that want every record matching a particular scalar value,
/// regardless of offset.
pub fn encode_scalar_prefix(scalar: &Bson) -> Option<Vec<u8>> {
    match scalar {
        Bson::Null => Some(vec![TAG_NULL]),
        Bson::Boolean(false) => Some(vec![TAG_BOOL_FALSE]),
        Bson::Boolean(true) => Some(vec![TAG_BOOL_TRUE]),
        Bson::Double(f) => {
            let mut result = vec![TAG_NUMBER];
            result.extend_from_slice(&encode_f64_for_sort(*f));
            Some(result)
        }
        Bson::Int32(n) => {
            let mut result = vec![TAG_NUMBER];
            result.extend_from_slice(&encode_f64_for_sort(*n as f64));
            Some(result)
        }
        Bson::Int64(n) => {
            let mut result = vec![TAG_NUMBER];
            result.extend_from_slice(&encode_f64_for_sort(*n as f64));
            Some(result)
        }
        Bson::String(s) => {
            let mut result = vec![TAG_STRING];
            result.extend_from_slice(&encode_escaped_string(s.as_bytes()));
            Some(result)
        }
        Bson::ObjectId(oid) => {
            let mut result = vec![TAG_OBJECT_ID];
            result.extend_from_slice(&oid.bytes());
            Some(result)
        }
        Bson::DateTime(dt) => {
            let mut result = vec![TAG_DATETIME];
            result.extend_from_slice(&encode_millis_for_sort(dt.timestamp_millis()));
            Some(result)
        }
        _ => None,
    }
}

/// Encode a range scan prefix for finding all records with a given scalar
/// value.
///
/// Returns `(start_key, end_key)` where `start_key` includes the scalar
/// value with offset 0 and `end_key` includes it with offset `u64::MAX`,
/// so a range scan over `[start_key, end_key]` finds every match.
pub fn encode_range_bounds(scalar: &Bson) -> Option<(Vec<u8>, Vec<u8>)> {
    let prefix = encode_scalar_prefix(scalar)?;

    let mut start = prefix.clone();
    start.extend_from_slice(&0u64.to_le_bytes());

    let mut end = prefix;
    end.extend_from_slice(&u64::MAX.to_le_bytes());

    Some((start, end))
}

/// Extract the record offset from a composite index key, or `None` if the
/// key is too short to contain one.
#[allow(dead_code)]
pub fn extract_offset(key: &[u8]) -> Option<u64> {
    if key.len() < 8 {
        return None;
    }
    let offset_bytes = &key[key.len() - 8..];
    Some(u64::from_le_bytes(offset_bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;

    #[test]
    fn encode_null() {
        let key = encode_index_key(&Bson::Null, 42).unwrap();
        assert_eq!(key.len(), 9); // 1 byte type + 8 bytes offset
        assert_eq!(key[0], TAG_NULL);
        assert_eq!(extract_offset(&key), Some(42));
    }

    #[test]
    fn encode_bool() {
        let f = encode_index_key(&Bson::Boolean(false), 100).unwrap();
        let t = encode_index_key(&Bson::Boolean(true), 200).unwrap();
        assert_eq!(f[0], TAG_BOOL_FALSE);
        assert_eq!(t[0], TAG_BOOL_TRUE);
        assert!(f < t);
    }

    #[test]
    fn encode_number() {
        let key = encode_index_key(&Bson::Double(3.14159), 999).unwrap();
        assert_eq!(key.len(), 17); // 1 byte type + 8 bytes f64 + 8 bytes offset
        assert_eq!(key[0], TAG_NUMBER);
        assert_eq!(extract_offset(&key), Some(999));
    }

    #[test]
    fn int32_and_double_sort_consistently() {
        let as_int = encode_scalar_prefix(&Bson::Int32(5)).unwrap();
        let as_double = encode_scalar_prefix(&Bson::Double(5.0)).unwrap();
        assert_eq!(as_int, as_double);
    }

    #[test]
    fn encode_string() {
        let key = encode_index_key(&Bson::String("hello".into()), 1234).unwrap();
        assert_eq!(key[0], TAG_STRING);
        assert_eq!(&key[1..6], b"hello");
        assert_eq!(&key[6..8], &[0x00, 0x00]); // terminator
        assert_eq!(extract_offset(&key), Some(1234));
    }

    #[test]
    fn string_containing_null_byte_round_trips_through_escaping() {
        let key = encode_scalar_prefix(&Bson::String("a\0b".into())).unwrap();
        // TAG + 'a' + (0x00 0xFF escape) + 'b' + (0x00 0x00 terminator)
        assert_eq!(&key[1..], &[b'a', 0x00, 0xFF, b'b', 0x00, 0x00]);
    }

    #[test]
    fn prefix_sorts_before_longer_string() {
        let short = encode_scalar_prefix(&Bson::String("ab".into())).unwrap();
        let long = encode_scalar_prefix(&Bson::String("abc".into())).unwrap();
        assert!(short < long);
    }

    #[test]
    fn rejects_arrays_and_documents() {
        assert!(encode_index_key(&Bson::Array(vec![]), 0).is_none());
        assert!(encode_index_key(&Bson::Document(Default::default()), 0).is_none());
    }

    #[test]
    fn object_id_sorts_by_raw_bytes() {
        let a = ObjectId::from_bytes([0u8; 12]);
        let mut high = [0u8; 12];
        high[11] = 1;
        let b = ObjectId::from_bytes(high);
        let ka = encode_scalar_prefix(&Bson::ObjectId(a)).unwrap();
        let kb = encode_scalar_prefix(&Bson::ObjectId(b)).unwrap();
        assert!(ka < kb);
    }

    #[test]
    fn range_bounds() {
        let (start, end) = encode_range_bounds(&Bson::String("test".into())).unwrap();
        assert_eq!(&start[..start.len() - 8], &end[..end.len() - 8]);
        assert_eq!(extract_offset(&start), Some(0));
        assert_eq!(extract_offset(&end), Some(u64::MAX));
    }

    #[test]
    fn sort_order_numbers() {
        let a = encode_scalar_prefix(&Bson::Double(1.0)).unwrap();
        let b = encode_scalar_prefix(&Bson::Double(2.0)).unwrap();
        let c = encode_scalar_prefix(&Bson::Double(-1.0)).unwrap();
        let d = encode_scalar_prefix(&Bson::Double(-2.0)).unwrap();
        assert!(d < c && c < a && a < b);
    }
}
