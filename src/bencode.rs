//! A self-contained bencode value codec.
//!
//! Bencode is the self-describing binary format used by `.torrent` files,
//! tracker responses and KRPC (DHT) packets. Four variants exist: byte
//! strings, integers, lists and dictionaries with byte-string keys.
//!
//! Decoding is streaming over a byte buffer and reports the byte offset of
//! the first malformed input. Encoding is deterministic: dictionary keys are
//! emitted in ascending lexicographic byte order, which is what makes
//! re-encoding a parsed info dictionary reproduce the original info-hash.
//!
//! The serde-based `serde_bencode` crate is still used where a typed struct
//! is the natural target (tracker responses); this module is for the places
//! that need raw dictionary access: metainfo v2 file trees, extension
//! handshakes and KRPC messages.

use std::collections::BTreeMap;

use crate::error::bencode::{BencodeError, Result};

/// The maximum nesting depth the decoder will follow before giving up.
///
/// Torrent metainfo rarely nests deeper than a dozen levels; the cap exists
/// to bound stack use on adversarial input.
pub const MAX_DEPTH: usize = 100;

/// A single bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// A length-prefixed byte string. No UTF-8 meaning is implied.
    Bytes(Vec<u8>),
    /// A 64-bit signed integer.
    Int(i64),
    /// An ordered sequence of values.
    List(Vec<Value>),
    /// A mapping with byte-string keys. `BTreeMap` keeps the keys in the
    /// ascending byte order that canonical encoding requires.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Returns the byte string if this value is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string interpreted as UTF-8, if valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns the integer if this value is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the list if this value is one.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the dictionary if this value is one.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Convenience lookup of a dictionary entry by key.
    pub fn lookup(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Encodes the value into a fresh buffer in canonical form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encodes the value into the given buffer in canonical form.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Value::Int(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Value::List(l) => {
                buf.push(b'l');
                for v in l {
                    v.encode_into(buf);
                }
                buf.push(b'e');
            }
            Value::Dict(d) => {
                buf.push(b'd');
                // BTreeMap iterates keys in ascending byte order, which is
                // exactly the canonical key order
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

/// Decodes a buffer that must contain exactly one bencode value.
///
/// Trailing bytes after the value are an error; use [`decode_prefix`] when
/// decoding from a stream that may contain more data.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(buf)?;
    if consumed != buf.len() {
        return Err(BencodeError::TrailingBytes { offset: consumed });
    }
    Ok(value)
}

/// Decodes the first bencode value in the buffer, returning it together with
/// the number of bytes consumed.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize)> {
    let mut decoder = Decoder { buf, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::DepthLimit { offset: self.pos });
        }
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.bytes()?.to_vec())),
            token => Err(BencodeError::UnexpectedToken {
                token,
                offset: self.pos,
            }),
        }
    }

    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof { offset: self.pos })
    }

    fn next(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn int(&mut self) -> Result<Value> {
        let start = self.pos;
        // consume 'i'
        self.next()?;
        let negative = if self.peek()? == b'-' {
            self.next()?;
            true
        } else {
            false
        };

        let digits_start = self.pos;
        while self.peek()? != b'e' {
            let b = self.next()?;
            if !b.is_ascii_digit() {
                return Err(BencodeError::InvalidInt {
                    offset: self.pos - 1,
                });
            }
        }
        let digits = &self.buf[digits_start..self.pos];
        // consume 'e'
        self.next()?;

        if digits.is_empty() {
            return Err(BencodeError::InvalidInt { offset: start });
        }
        // leading zeros are not canonical ("03"), and neither is "-0"
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::InvalidInt { offset: start });
        }
        if negative && digits == b"0" {
            return Err(BencodeError::InvalidInt { offset: start });
        }

        let mut n: i64 = 0;
        for &d in digits {
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add((d - b'0') as i64))
                .ok_or(BencodeError::IntOverflow { offset: start })?;
        }
        if negative {
            n = -n;
        }
        Ok(Value::Int(n))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            let b = self.next()?;
            match b {
                b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((b - b'0') as usize))
                        .ok_or(BencodeError::IntOverflow { offset: start })?;
                }
                b':' => break,
                _ => {
                    return Err(BencodeError::InvalidLength {
                        offset: self.pos - 1,
                    })
                }
            }
        }
        // a length prefix with a leading zero is only canonical for "0:"
        let prefix = &self.buf[start..self.pos - 1];
        if prefix.len() > 1 && prefix[0] == b'0' {
            return Err(BencodeError::InvalidLength { offset: start });
        }

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(BencodeError::UnexpectedEof { offset: self.pos })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value> {
        // consume 'l'
        self.next()?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        // consume 'e'
        self.next()?;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value> {
        // consume 'd'
        self.next()?;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_offset = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::InvalidKey { offset: key_offset });
            }
            let key = self.bytes()?.to_vec();
            let value = self.value(depth + 1)?;
            if map.insert(key, value).is_some() {
                return Err(BencodeError::DuplicateKey { offset: key_offset });
            }
        }
        // consume 'e'
        self.next()?;
        Ok(Value::Dict(map))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn bytes(b: &[u8]) -> Value {
        Value::Bytes(b.to_vec())
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"4:spam").unwrap(), bytes(b"spam"));
        assert_eq!(decode(b"0:").unwrap(), bytes(b""));
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn test_decode_collections() {
        assert_eq!(
            decode(b"l4:spami7ee").unwrap(),
            Value::List(vec![bytes(b"spam"), Value::Int(7)])
        );

        let decoded = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
        let dict = decoded.as_dict().unwrap();
        assert_eq!(dict.get(&b"bar"[..]), Some(&bytes(b"spam")));
        assert_eq!(dict.get(&b"foo"[..]), Some(&Value::Int(42)));
    }

    #[test]
    fn test_reject_malformed_ints() {
        // leading zeros and negative zero are not canonical
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i--1e").is_err());
        assert!(decode(b"i12x4e").is_err());
    }

    #[test]
    fn test_reject_malformed_strings() {
        // truncated payload
        assert!(decode(b"5:spam").is_err());
        // leading zero length prefix
        assert!(decode(b"04:spam").is_err());
        // missing separator
        assert!(decode(b"4spam").is_err());
    }

    #[test]
    fn test_reject_trailing_bytes() {
        let err = decode(b"i42etrailing").unwrap_err();
        assert!(matches!(err, BencodeError::TrailingBytes { offset: 4 }));
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let (value, consumed) = decode_prefix(b"4:spami7ee").unwrap();
        assert_eq!(value, bytes(b"spam"));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_reject_duplicate_keys() {
        assert!(decode(b"d3:fooi1e3:fooi2ee").is_err());
    }

    #[test]
    fn test_reject_non_string_keys() {
        assert!(decode(b"di1ei2ee").is_err());
    }

    #[test]
    fn test_depth_limit() {
        // MAX_DEPTH + 2 nested lists trip the limit
        let n = MAX_DEPTH + 2;
        let mut buf = Vec::with_capacity(2 * n);
        buf.extend(std::iter::repeat(b'l').take(n));
        buf.extend(std::iter::repeat(b'e').take(n));
        assert!(matches!(
            decode(&buf).unwrap_err(),
            BencodeError::DepthLimit { .. }
        ));
    }

    #[test]
    fn test_error_offsets() {
        // the bad byte is the 'x' at offset 10
        let err = decode(b"d3:fooi42ex").unwrap_err();
        match err {
            BencodeError::InvalidKey { offset } => assert_eq!(offset, 10),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_canonical_round_trip() {
        // decode(encode(v)) == v
        let mut dict = BTreeMap::new();
        dict.insert(b"announce".to_vec(), bytes(b"http://t.example/ann"));
        dict.insert(
            b"info".to_vec(),
            Value::Dict(BTreeMap::from([
                (b"length".to_vec(), Value::Int(40960)),
                (b"name".to_vec(), bytes(b"file.bin")),
                (b"piece length".to_vec(), Value::Int(16384)),
            ])),
        );
        let value = Value::Dict(dict);
        let encoded = value.encode();
        assert_eq!(decode(&encoded).unwrap(), value);

        // encode(decode(b)) == b for canonical input
        let canonical = b"d3:bar4:spam3:fooi42ee";
        assert_eq!(decode(canonical).unwrap().encode(), canonical.to_vec());
    }

    #[test]
    fn test_encode_orders_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zz".to_vec(), Value::Int(1));
        dict.insert(b"aa".to_vec(), Value::Int(2));
        dict.insert(b"mm".to_vec(), Value::Int(3));
        let encoded = Value::Dict(dict).encode();
        assert_eq!(encoded, b"d2:aai2e2:mmi3e2:zzi1ee".to_vec());
    }
}
