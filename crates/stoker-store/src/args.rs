//! Self-describing binary encoding for task arguments.
//!
//! Task arguments cross a process boundary through a BLOB column, so the
//! encoding must be stable and carry its own structure. Layout: one format
//! version byte, the positional values, then the keyword pairs. Every value
//! starts with a tag byte followed by a fixed or length-prefixed payload;
//! all integers are little-endian.
//!
//! Map entries keep their insertion order and their keys may be any value,
//! not just strings, so argument shapes survive the round trip exactly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current encoding version, written as the first byte of every blob.
pub const ARGS_FORMAT_VERSION: u8 = 1;

const TAG_NONE: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;

/// Errors raised while encoding or decoding an argument blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    /// The blob was written by an unknown format version.
    #[error("unsupported argument encoding version {0}")]
    UnsupportedVersion(u8),

    /// A value starts with a tag byte this version does not know.
    #[error("unknown value tag {tag:#04x} at byte {offset}")]
    UnknownTag { tag: u8, offset: usize },

    /// The blob ends in the middle of a value.
    #[error("argument blob truncated at byte {offset}, {needed} more byte(s) needed")]
    Truncated { offset: usize, needed: usize },

    /// A boolean payload byte was neither 0 nor 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    /// A text payload was not valid UTF-8.
    #[error("invalid utf-8 in text value: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Decoding finished with unread bytes left in the blob.
    #[error("{0} trailing byte(s) after the last value")]
    TrailingBytes(usize),
}

/// A single argument or return value.
///
/// The variants cover the native shapes a handler can receive or produce.
/// `Map` uses a pair list instead of a hash map so non-string keys and the
/// original entry order survive storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<TaskValue>),
    Map(Vec<(TaskValue, TaskValue)>),
}

impl From<bool> for TaskValue {
    fn from(v: bool) -> Self {
        TaskValue::Bool(v)
    }
}

impl From<i64> for TaskValue {
    fn from(v: i64) -> Self {
        TaskValue::Int(v)
    }
}

impl From<f64> for TaskValue {
    fn from(v: f64) -> Self {
        TaskValue::Float(v)
    }
}

impl From<&str> for TaskValue {
    fn from(v: &str) -> Self {
        TaskValue::Text(v.to_string())
    }
}

impl From<String> for TaskValue {
    fn from(v: String) -> Self {
        TaskValue::Text(v)
    }
}

/// Positional and keyword arguments for one task invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub positional: Vec<TaskValue>,
    pub keyword: Vec<(String, TaskValue)>,
}

impl TaskArgs {
    /// No arguments at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Positional arguments only.
    pub fn positional<I>(values: I) -> Self
    where
        I: IntoIterator<Item = TaskValue>,
    {
        Self {
            positional: values.into_iter().collect(),
            keyword: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

/// Encode a full argument set into a storable blob.
pub fn encode_args(args: &TaskArgs) -> Vec<u8> {
    let mut out = vec![ARGS_FORMAT_VERSION];
    write_len(&mut out, args.positional.len());
    for value in &args.positional {
        write_value(&mut out, value);
    }
    write_len(&mut out, args.keyword.len());
    for (name, value) in &args.keyword {
        write_str(&mut out, name);
        write_value(&mut out, value);
    }
    out
}

/// Decode a blob produced by [`encode_args`], consuming it completely.
pub fn decode_args(bytes: &[u8]) -> Result<TaskArgs, ArgsError> {
    let mut reader = Reader::new(bytes)?;
    let positional_len = reader.read_len()?;
    let mut positional = Vec::with_capacity(positional_len.min(64));
    for _ in 0..positional_len {
        positional.push(reader.read_value()?);
    }
    let keyword_len = reader.read_len()?;
    let mut keyword = Vec::with_capacity(keyword_len.min(64));
    for _ in 0..keyword_len {
        let name = reader.read_str()?;
        let value = reader.read_value()?;
        keyword.push((name, value));
    }
    reader.finish()?;
    Ok(TaskArgs {
        positional,
        keyword,
    })
}

/// Encode a single value, used for the stored return value of a task.
pub fn encode_value(value: &TaskValue) -> Vec<u8> {
    let mut out = vec![ARGS_FORMAT_VERSION];
    write_value(&mut out, value);
    out
}

/// Decode a blob produced by [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> Result<TaskValue, ArgsError> {
    let mut reader = Reader::new(bytes)?;
    let value = reader.read_value()?;
    reader.finish()?;
    Ok(value)
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u32).to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn write_value(out: &mut Vec<u8>, value: &TaskValue) {
    match value {
        TaskValue::None => out.push(TAG_NONE),
        TaskValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        TaskValue::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        TaskValue::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        TaskValue::Text(s) => {
            out.push(TAG_TEXT);
            write_str(out, s);
        }
        TaskValue::Bytes(b) => {
            out.push(TAG_BYTES);
            write_len(out, b.len());
            out.extend_from_slice(b);
        }
        TaskValue::List(items) => {
            out.push(TAG_LIST);
            write_len(out, items.len());
            for item in items {
                write_value(out, item);
            }
        }
        TaskValue::Map(entries) => {
            out.push(TAG_MAP);
            write_len(out, entries.len());
            for (key, val) in entries {
                write_value(out, key);
                write_value(out, val);
            }
        }
    }
}

/// Cursor over an encoded blob. Checks the version byte on construction.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, ArgsError> {
        let mut reader = Self { bytes, offset: 0 };
        let version = reader.read_u8()?;
        if version != ARGS_FORMAT_VERSION {
            return Err(ArgsError::UnsupportedVersion(version));
        }
        Ok(reader)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ArgsError> {
        let available = self.bytes.len() - self.offset;
        if available < n {
            return Err(ArgsError::Truncated {
                offset: self.offset,
                needed: n - available,
            });
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ArgsError> {
        Ok(self.take(1)?[0])
    }

    fn read_len(&mut self) -> Result<usize, ArgsError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    fn read_str(&mut self) -> Result<String, ArgsError> {
        let len = self.read_len()?;
        let raw = self.take(len)?;
        Ok(std::str::from_utf8(raw)?.to_string())
    }

    fn read_value(&mut self) -> Result<TaskValue, ArgsError> {
        let tag_offset = self.offset;
        let tag = self.read_u8()?;
        match tag {
            TAG_NONE => Ok(TaskValue::None),
            TAG_BOOL => match self.read_u8()? {
                0 => Ok(TaskValue::Bool(false)),
                1 => Ok(TaskValue::Bool(true)),
                other => Err(ArgsError::InvalidBool(other)),
            },
            TAG_INT => {
                let raw = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(TaskValue::Int(i64::from_le_bytes(buf)))
            }
            TAG_FLOAT => {
                let raw = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(TaskValue::Float(f64::from_le_bytes(buf)))
            }
            TAG_TEXT => Ok(TaskValue::Text(self.read_str()?)),
            TAG_BYTES => {
                let len = self.read_len()?;
                Ok(TaskValue::Bytes(self.take(len)?.to_vec()))
            }
            TAG_LIST => {
                let len = self.read_len()?;
                let mut items = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Ok(TaskValue::List(items))
            }
            TAG_MAP => {
                let len = self.read_len()?;
                let mut entries = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    let key = self.read_value()?;
                    let val = self.read_value()?;
                    entries.push((key, val));
                }
                Ok(TaskValue::Map(entries))
            }
            other => Err(ArgsError::UnknownTag {
                tag: other,
                offset: tag_offset,
            }),
        }
    }

    fn finish(self) -> Result<(), ArgsError> {
        let remaining = self.bytes.len() - self.offset;
        if remaining > 0 {
            return Err(ArgsError::TrailingBytes(remaining));
        }
        Ok(())
    }
}
