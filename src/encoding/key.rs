//! # Byte-Comparable Key Encoding
//!
//! This module provides the order-preserving key encoding used by the index
//! pages. Every key tuple is serialized column by column into a byte string
//! with the property that lexicographic comparison of encoded keys equals
//! column-wise typed comparison of the original values. Inside a page a key
//! comparison is therefore a single `memcmp` that short-circuits on the
//! first differing byte, for strings and numbers alike.
//!
//! ## Type Prefix Scheme
//!
//! Each encoded column starts with a tag byte that fixes the relative order
//! of value classes within the column:
//!
//! ```text
//! 0x01  NULL
//! 0x12  negative integer   (two's complement, big-endian)
//! 0x13  negative float     (all IEEE 754 bits inverted, big-endian)
//! 0x14  zero               (integer 0 or float 0.0, no payload)
//! 0x15  positive float     (sign bit flipped, big-endian)
//! 0x16  positive integer   (big-endian magnitude)
//! 0x20  text               (escaped bytes, 0x00 0x00 terminator)
//! 0x21  bytes              (escaped bytes, 0x00 0x00 terminator)
//! ```
//!
//! Numbers are fixed-width (tag + 8 bytes); zero carries no payload so the
//! tag byte alone separates negatives from positives. Text and blob columns
//! escape embedded `0x00`/`0xFF` bytes (`0x00 -> 0x00 0xFF`,
//! `0xFF -> 0xFF 0x00`) and close with a `0x00 0x00` terminator, which keeps
//! lexicographic order while making every column self-delimiting.
//!
//! Self-delimiting columns matter: page entries store the encoded key with
//! no length field, so reading an entry walks the known number of columns
//! ([`encoded_key_len`]) to find where the value list starts.
//!
//! ## Decoding
//!
//! The encoding is invertible. Because an index declares its column types up
//! front, `0x14` (zero) decodes to `Int(0)` or `Float(0.0)` depending on the
//! declared column type.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::types::{KeyType, Value};

pub mod tag {
    pub const NULL: u8 = 0x01;
    pub const NEG_INT: u8 = 0x12;
    pub const NEG_FLOAT: u8 = 0x13;
    pub const ZERO: u8 = 0x14;
    pub const POS_FLOAT: u8 = 0x15;
    pub const POS_INT: u8 = 0x16;
    pub const TEXT: u8 = 0x20;
    pub const BLOB: u8 = 0x21;
}

const TERMINATOR: [u8; 2] = [0x00, 0x00];

pub fn encode_null(buf: &mut Vec<u8>) {
    buf.push(tag::NULL);
}

pub fn encode_int(v: i64, buf: &mut Vec<u8>) {
    match v {
        0 => buf.push(tag::ZERO),
        v if v > 0 => {
            buf.push(tag::POS_INT);
            buf.extend_from_slice(&(v as u64).to_be_bytes());
        }
        v => {
            buf.push(tag::NEG_INT);
            buf.extend_from_slice(&(v as u64).to_be_bytes());
        }
    }
}

pub fn encode_float(v: f64, buf: &mut Vec<u8>) -> Result<()> {
    ensure!(!v.is_nan(), "NaN cannot be used as an index key");
    if v == 0.0 {
        buf.push(tag::ZERO);
    } else if v > 0.0 {
        buf.push(tag::POS_FLOAT);
        buf.extend_from_slice(&v.to_bits().to_be_bytes());
    } else {
        buf.push(tag::NEG_FLOAT);
        buf.extend_from_slice(&(!v.to_bits()).to_be_bytes());
    }
    Ok(())
}

fn encode_escaped(bytes: &[u8], buf: &mut Vec<u8>) {
    for &b in bytes {
        match b {
            0x00 => buf.extend_from_slice(&[0x00, 0xFF]),
            0xFF => buf.extend_from_slice(&[0xFF, 0x00]),
            b => buf.push(b),
        }
    }
    buf.extend_from_slice(&TERMINATOR);
}

pub fn encode_text(v: &str, buf: &mut Vec<u8>) {
    buf.push(tag::TEXT);
    encode_escaped(v.as_bytes(), buf);
}

pub fn encode_bytes(v: &[u8], buf: &mut Vec<u8>) {
    buf.push(tag::BLOB);
    encode_escaped(v, buf);
}

pub fn encode_value(value: &Value, key_type: KeyType, buf: &mut Vec<u8>) -> Result<()> {
    ensure!(
        value.matches(key_type),
        "value {:?} does not match declared column type {:?}",
        value,
        key_type
    );
    match value {
        Value::Null => encode_null(buf),
        Value::Int(v) => encode_int(*v, buf),
        Value::Float(v) => encode_float(*v, buf)?,
        Value::Text(v) => encode_text(v, buf),
        Value::Bytes(v) => encode_bytes(v, buf),
    }
    Ok(())
}

/// Length in bytes of the encoded column starting at `buf[0]`.
pub fn skip_value(buf: &[u8]) -> Result<usize> {
    ensure!(!buf.is_empty(), "empty buffer while skipping key column");
    match buf[0] {
        tag::NULL | tag::ZERO => Ok(1),
        tag::NEG_INT | tag::POS_INT | tag::NEG_FLOAT | tag::POS_FLOAT => {
            ensure!(buf.len() >= 9, "truncated numeric key column");
            Ok(9)
        }
        tag::TEXT | tag::BLOB => {
            let mut pos = 1;
            loop {
                ensure!(pos < buf.len(), "unterminated string key column");
                match buf[pos] {
                    0x00 => {
                        ensure!(pos + 1 < buf.len(), "unterminated string key column");
                        pos += 2;
                        if buf[pos - 1] == 0x00 {
                            return Ok(pos);
                        }
                    }
                    0xFF => {
                        ensure!(pos + 1 < buf.len(), "unterminated string key column");
                        pos += 2;
                    }
                    _ => pos += 1,
                }
            }
        }
        t => bail!("unknown key column tag: {:#04x}", t),
    }
}

/// Length in bytes of an encoded key of `columns` columns starting at
/// `buf[0]`.
pub fn encoded_key_len(buf: &[u8], columns: usize) -> Result<usize> {
    let mut pos = 0;
    for _ in 0..columns {
        pos += skip_value(&buf[pos..])?;
    }
    Ok(pos)
}

fn decode_escaped(buf: &[u8]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        ensure!(pos < buf.len(), "unterminated string key column");
        match buf[pos] {
            0x00 => {
                ensure!(pos + 1 < buf.len(), "unterminated string key column");
                match buf[pos + 1] {
                    0x00 => return Ok((out, pos + 2)),
                    0xFF => {
                        out.push(0x00);
                        pos += 2;
                    }
                    b => bail!("invalid escape byte {:#04x} after 0x00", b),
                }
            }
            0xFF => {
                ensure!(pos + 1 < buf.len(), "unterminated string key column");
                ensure!(
                    buf[pos + 1] == 0x00,
                    "invalid escape byte {:#04x} after 0xFF",
                    buf[pos + 1]
                );
                out.push(0xFF);
                pos += 2;
            }
            b => {
                out.push(b);
                pos += 1;
            }
        }
    }
}

/// Decode one column. Returns the value and the number of bytes consumed.
pub fn decode_value(buf: &[u8], key_type: KeyType) -> Result<(Value, usize)> {
    ensure!(!buf.is_empty(), "empty buffer while decoding key column");
    match buf[0] {
        tag::NULL => Ok((Value::Null, 1)),
        tag::ZERO => Ok((
            match key_type {
                KeyType::Float => Value::Float(0.0),
                _ => Value::Int(0),
            },
            1,
        )),
        t @ (tag::NEG_INT | tag::POS_INT) => {
            ensure!(buf.len() >= 9, "truncated integer key column");
            let bits = u64::from_be_bytes(buf[1..9].try_into().unwrap());
            let v = bits as i64;
            ensure!(
                (t == tag::POS_INT) == (v > 0),
                "integer tag {:#04x} disagrees with payload sign",
                t
            );
            Ok((Value::Int(v), 9))
        }
        t @ (tag::NEG_FLOAT | tag::POS_FLOAT) => {
            ensure!(buf.len() >= 9, "truncated float key column");
            let raw = u64::from_be_bytes(buf[1..9].try_into().unwrap());
            let bits = if t == tag::NEG_FLOAT { !raw } else { raw };
            Ok((Value::Float(f64::from_bits(bits)), 9))
        }
        tag::TEXT => {
            let (bytes, used) = decode_escaped(&buf[1..])?;
            let text = String::from_utf8(bytes)
                .map_err(|e| eyre::eyre!("invalid UTF-8 in text key column: {}", e))?;
            Ok((Value::Text(text), used + 1))
        }
        tag::BLOB => {
            let (bytes, used) = decode_escaped(&buf[1..])?;
            Ok((Value::Bytes(bytes), used + 1))
        }
        t => bail!("unknown key column tag: {:#04x}", t),
    }
}

/// Decode a full key of the given column types. Returns the values and the
/// number of bytes consumed.
pub fn decode_key(buf: &[u8], key_types: &[KeyType]) -> Result<(Vec<Value>, usize)> {
    let mut values = Vec::with_capacity(key_types.len());
    let mut pos = 0;
    for &kt in key_types {
        let (value, used) = decode_value(&buf[pos..], kt)?;
        values.push(value);
        pos += used;
    }
    Ok((values, pos))
}

/// Reusable encoder for key tuples. Owns its scratch buffer and records the
/// end offset of every column so Bloom-filter prefixes (`bf_key_depth`
/// leading columns) come out without re-encoding.
#[derive(Debug, Default)]
pub struct KeyEncoder {
    buf: Vec<u8>,
    column_ends: SmallVec<[u32; 8]>,
}

impl KeyEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.column_ends.clear();
    }

    /// Encode `values` against the declared `key_types`. The returned slice
    /// is valid until the next `encode`/`reset`.
    pub fn encode(&mut self, values: &[Value], key_types: &[KeyType]) -> Result<&[u8]> {
        ensure!(
            values.len() == key_types.len(),
            "key has {} columns, index declares {}",
            values.len(),
            key_types.len()
        );
        self.reset();
        for (value, &kt) in values.iter().zip(key_types) {
            encode_value(value, kt, &mut self.buf)?;
            self.column_ends.push(self.buf.len() as u32);
        }
        Ok(&self.buf)
    }

    pub fn encoded(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes of the first `depth` columns of the last encoded key. A depth
    /// of zero or beyond the column count yields the whole key.
    pub fn prefix(&self, depth: u8) -> &[u8] {
        let depth = depth as usize;
        if depth == 0 || depth >= self.column_ends.len() {
            return &self.buf;
        }
        &self.buf[..self.column_ends[depth - 1] as usize]
    }
}

/// Bytes of the first `depth` columns of an already-encoded key.
pub fn key_prefix<'a>(encoded: &'a [u8], columns: usize, depth: u8) -> Result<&'a [u8]> {
    let depth = depth as usize;
    if depth == 0 || depth >= columns {
        return Ok(encoded);
    }
    let len = encoded_key_len(encoded, depth)?;
    Ok(&encoded[..len])
}
