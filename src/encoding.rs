//! Order-preserving key encoding for document values
//!
//! Collection and index keys are built from *key parts*: a type tag byte
//! followed by a payload whose byte order matches the value order. Parts are
//! self-delimiting, so a compound index entry can be split back into its
//! component parts (the last part of an index entry is always the owning
//! document's primary key).
//!
//! Tag order defines the cross-type ordering: null < bool < number < string
//! < array < object. The byte `0xff` never begins a part; it is reserved as
//! the scan-key sentinel.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{QueryError, QueryResult};

const TAG_NULL: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_OBJECT: u8 = 0x07;

/// Terminator for strings, arrays, and objects. Embedded zero bytes in
/// strings are escaped as `0x00 0xff`.
const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0xff;

/// Encode one value as an order-preserving key part
pub fn encode_key_part(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value);
    buf
}

/// Encode a sequence of values as concatenated key parts
pub fn encode_key_parts(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    for v in values {
        encode_into(&mut buf, v);
    }
    buf
}

fn encode_into(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(if *b { 1 } else { 0 });
        }
        Value::Number(n) => {
            buf.push(TAG_NUMBER);
            let f = n.as_f64().unwrap_or(0.0);
            buf.extend_from_slice(&order_preserving_f64(f));
        }
        Value::String(s) => {
            buf.push(TAG_STRING);
            encode_escaped(buf, s.as_bytes());
            buf.push(TERMINATOR);
        }
        Value::Array(items) => {
            buf.push(TAG_ARRAY);
            for item in items {
                encode_into(buf, item);
            }
            buf.push(TERMINATOR);
        }
        Value::Object(map) => {
            buf.push(TAG_OBJECT);
            for (k, v) in map {
                buf.push(TAG_STRING);
                encode_escaped(buf, k.as_bytes());
                buf.push(TERMINATOR);
                encode_into(buf, v);
            }
            buf.push(TERMINATOR);
        }
    }
}

fn encode_escaped(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        buf.push(b);
        if b == TERMINATOR {
            buf.push(ESCAPE);
        }
    }
}

/// Map an f64 onto bytes whose unsigned order matches the numeric order
fn order_preserving_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let ordered = if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

fn restore_f64(bytes: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & (1 << 63) != 0 {
        ordered ^ (1 << 63)
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

/// Decode the key part at the front of `key`, returning the value and the
/// remaining bytes
pub fn decode_key_part(key: &[u8]) -> QueryResult<(Value, &[u8])> {
    let (&tag, rest) = key
        .split_first()
        .ok_or_else(|| QueryError::Encoding("empty key part".to_string()))?;
    match tag {
        TAG_NULL => Ok((Value::Null, rest)),
        TAG_BOOL => {
            let (&b, rest) = rest
                .split_first()
                .ok_or_else(|| QueryError::Encoding("truncated bool part".to_string()))?;
            Ok((Value::Bool(b != 0), rest))
        }
        TAG_NUMBER => {
            if rest.len() < 8 {
                return Err(QueryError::Encoding("truncated number part".to_string()));
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&rest[..8]);
            let f = restore_f64(bytes);
            let num = serde_json::Number::from_f64(f)
                .ok_or_else(|| QueryError::Encoding("non-finite number part".to_string()))?;
            Ok((Value::Number(num), &rest[8..]))
        }
        TAG_STRING => {
            let (bytes, rest) = decode_escaped(rest)?;
            let s = String::from_utf8(bytes)
                .map_err(|_| QueryError::Encoding("invalid utf-8 in string part".to_string()))?;
            Ok((Value::String(s), rest))
        }
        TAG_ARRAY => {
            let mut items = Vec::new();
            let mut rest = rest;
            loop {
                match rest.first() {
                    Some(&TERMINATOR) => return Ok((Value::Array(items), &rest[1..])),
                    Some(_) => {
                        let (item, r) = decode_key_part(rest)?;
                        items.push(item);
                        rest = r;
                    }
                    None => {
                        return Err(QueryError::Encoding("unterminated array part".to_string()))
                    }
                }
            }
        }
        TAG_OBJECT => {
            let mut map = serde_json::Map::new();
            let mut rest = rest;
            loop {
                match rest.first() {
                    Some(&TERMINATOR) => return Ok((Value::Object(map), &rest[1..])),
                    Some(&TAG_STRING) => {
                        let (k, r) = decode_key_part(rest)?;
                        let key = match k {
                            Value::String(s) => s,
                            _ => unreachable!("string tag decodes to string"),
                        };
                        let (v, r) = decode_key_part(r)?;
                        map.insert(key, v);
                        rest = r;
                    }
                    _ => {
                        return Err(QueryError::Encoding("malformed object part".to_string()))
                    }
                }
            }
        }
        other => Err(QueryError::Encoding(format!("unknown key tag {other:#04x}"))),
    }
}

fn decode_escaped(data: &[u8]) -> QueryResult<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == TERMINATOR {
            if data.get(i + 1) == Some(&ESCAPE) {
                out.push(TERMINATOR);
                i += 2;
            } else {
                return Ok((out, &data[i + 1..]));
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    Err(QueryError::Encoding("unterminated string part".to_string()))
}

/// Split a key into its component parts without decoding them
pub fn split_key_parts(key: &[u8]) -> QueryResult<Vec<&[u8]>> {
    let mut parts = Vec::new();
    let mut rest = key;
    while !rest.is_empty() {
        let (_, after) = decode_key_part(rest)?;
        let consumed = rest.len() - after.len();
        parts.push(&rest[..consumed]);
        rest = after;
    }
    Ok(parts)
}

/// The first key part of `key`, as raw bytes
pub fn first_key_part(key: &[u8]) -> QueryResult<&[u8]> {
    let (_, after) = decode_key_part(key)?;
    Ok(&key[..key.len() - after.len()])
}

/// The last key part of `key`, as raw bytes
pub fn last_key_part(key: &[u8]) -> QueryResult<&[u8]> {
    let parts = split_key_parts(key)?;
    parts
        .last()
        .copied()
        .ok_or_else(|| QueryError::Encoding("empty key".to_string()))
}

/// Smallest key strictly greater than every key prefixed by `key`
///
/// Trailing `0xff` bytes cannot be incremented and are dropped. A key of all
/// `0xff` bytes (or the empty key) maps to the sentinel `0xff`, which sorts
/// after every valid scan key.
pub fn increment(key: &[u8]) -> Vec<u8> {
    match key.iter().rposition(|&b| b != 0xff) {
        Some(i) => {
            let mut out = key[..=i].to_vec();
            out[i] += 1;
            out
        }
        None => vec![0xff],
    }
}

/// Smallest key strictly greater than `key` itself
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0x00);
    out
}

/// Total order over document values, consistent with the key encoding
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match compare_values(xi, yi) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => {
            encode_key_part(a).cmp(&encode_key_part(b))
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => TAG_NULL,
        Value::Bool(_) => TAG_BOOL,
        Value::Number(_) => TAG_NUMBER,
        Value::String(_) => TAG_STRING,
        Value::Array(_) => TAG_ARRAY,
        Value::Object(_) => TAG_OBJECT,
    }
}
