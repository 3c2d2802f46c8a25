//! Row model and wire codec.
//!
//! A row is a key plus a set of uniquely named columns holding opaque bytes.
//! The wire encoding is self-delimiting: the key followed by a space, then
//! for each column (in name order) the column name, a space, the decimal
//! value length, a space, the raw value bytes, and a trailing space. In a
//! scan stream every row is followed by a newline and the stream ends with
//! one extra newline. Keys and column names must not contain spaces or
//! newlines; values may be arbitrary bytes.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    key: String,
    columns: BTreeMap<String, Vec<u8>>,
}

impl Row {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            columns: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn get_bytes(&self, column: &str) -> Option<&[u8]> {
        self.columns.get(column).map(|v| v.as_slice())
    }

    /// Column value as UTF-8, if present and valid.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .get(column)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key.len() + 16);
        out.extend_from_slice(self.key.as_bytes());
        out.push(b' ');
        for (name, value) in &self.columns {
            out.extend_from_slice(name.as_bytes());
            out.push(b' ');
            out.extend_from_slice(value.len().to_string().as_bytes());
            out.push(b' ');
            out.extend_from_slice(value);
            out.push(b' ');
        }
        out
    }

    /// Decodes a single row occupying the entire buffer (a row file or a
    /// `GET /data/:T/:R` body).
    pub fn decode(buf: &[u8]) -> Result<Row> {
        let (row, consumed) = parse_row(buf, true)?
            .ok_or_else(|| Error::Protocol("truncated row encoding".into()))?;
        if consumed != buf.len() {
            return Err(Error::Protocol("trailing bytes after row".into()));
        }
        Ok(row)
    }

    /// Incremental decode for scan streams. Skips leading newlines, then
    /// attempts to parse one row terminated by a newline. Returns the row
    /// and the number of bytes consumed (separators included), or `None`
    /// when the buffer does not yet hold a complete row.
    pub fn decode_stream(buf: &[u8]) -> Result<Option<(Row, usize)>> {
        let mut start = 0;
        while start < buf.len() && buf[start] == b'\n' {
            start += 1;
        }
        if start == buf.len() {
            return Ok(None);
        }
        match parse_row(&buf[start..], false)? {
            Some((row, consumed)) => Ok(Some((row, start + consumed))),
            None => Ok(None),
        }
    }
}

/// Parses one row from the front of `buf`. With `at_eof` the end of the
/// buffer terminates the row; otherwise a newline must follow the last
/// column. Returns `None` when more bytes are needed.
fn parse_row(buf: &[u8], at_eof: bool) -> Result<Option<(Row, usize)>> {
    let mut pos = 0;
    let key = match read_token(buf, &mut pos) {
        Some(t) => t?,
        None => return Ok(None),
    };
    let mut row = Row::new(key);

    loop {
        if pos == buf.len() {
            if at_eof {
                return Ok(Some((row, pos)));
            }
            return Ok(None);
        }
        if buf[pos] == b'\n' {
            return Ok(Some((row, pos + 1)));
        }

        let name = match read_token(buf, &mut pos) {
            Some(t) => t?,
            None => return Ok(None),
        };
        let len_str = match read_token(buf, &mut pos) {
            Some(t) => t?,
            None => return Ok(None),
        };
        let len: usize = len_str
            .parse()
            .map_err(|_| Error::Protocol(format!("bad column length '{len_str}'")))?;
        if pos + len + 1 > buf.len() {
            return Ok(None);
        }
        let value = buf[pos..pos + len].to_vec();
        pos += len;
        if buf[pos] != b' ' {
            return Err(Error::Protocol("missing separator after column value".into()));
        }
        pos += 1;
        row.columns.insert(name, value);
    }
}

/// Reads a space-terminated token. `None` means the buffer ended before the
/// separator; an inner `Err` means the token is not valid UTF-8.
fn read_token(buf: &[u8], pos: &mut usize) -> Option<Result<String>> {
    let rest = &buf[*pos..];
    let sep = rest.iter().position(|&b| b == b' ')?;
    let token = match std::str::from_utf8(&rest[..sep]) {
        Ok(s) => s.to_string(),
        Err(_) => return Some(Err(Error::Protocol("non-UTF-8 token in row header".into()))),
    };
    *pos += sep + 1;
    Some(Ok(token))
}
