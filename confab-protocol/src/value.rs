// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The readable data syntax shared by the wire protocol and the
//! reference runtime. Values print in a form that reads back to an
//! equal value, which is what lets the codec round-trip arbitrary
//! message payloads.

use std::{
    collections::BTreeMap,
    fmt,
    fmt::Write as _,
    io,
    io::Read,
};

/// One readable data term.
///
/// `Sym` doubles as the escape hatch for host-runtime tokens the other
/// arms don't cover: anything that reads as a bare token round-trips
/// as a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn str<S: Into<String>>(s: S) -> Value {
        Value::Str(s.into())
    }

    pub fn sym<S: Into<String>>(s: S) -> Value {
        Value::Sym(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Parse a single value out of a string, requiring the whole input
    /// to be consumed (trailing whitespace and comments aside).
    pub fn parse(src: &str) -> Result<Value, ReadError> {
        let mut r = PushbackReader::new(src.as_bytes());
        let value = read_value(&mut r)?.ok_or(ReadError::UnexpectedEof)?;
        if read_value(&mut r)?.is_some() {
            return Err(ReadError::Syntax(String::from("trailing data after value")));
        }
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write_escaped(f, s),
            Value::Sym(s) => f.write_str(s),
            Value::List(items) => {
                f.write_char('(')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_char(' ')?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_char(')')
            }
            Value::Map(entries) => {
                f.write_char('{')?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_char(' ')?;
                    }
                    f.write_str(&key_token(k))?;
                    f.write_char(' ')?;
                    write!(f, "{v}")?;
                }
                f.write_char('}')
            }
        }
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

/// Render a map or message key. Keys that read back as a bare symbol
/// print unquoted; anything else falls back to a string literal, which
/// the decoder coerces right back to a plain key.
pub fn key_token(key: &str) -> String {
    if reads_as_symbol(key) {
        String::from(key)
    } else {
        Value::Str(String::from(key)).to_string()
    }
}

fn reads_as_symbol(token: &str) -> bool {
    !token.is_empty()
        && token.bytes().all(|b| !is_whitespace(b) && !is_delimiter(b))
        && matches!(classify_atom(token), Value::Sym(_))
}

/// The decode side failing. `Syntax` and `UnexpectedEof` are framing
/// errors in the protocol's taxonomy: the stream can no longer be
/// trusted and the connection should be closed.
#[derive(Debug)]
pub enum ReadError {
    /// The underlying stream failed.
    Io(io::Error),
    /// The stream ended in the middle of a datum.
    UnexpectedEof,
    /// The bytes do not form readable data.
    Syntax(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "reading from stream: {e}"),
            ReadError::UnexpectedEof => f.write_str("unexpected end of stream"),
            ReadError::Syntax(msg) => write!(f, "syntax error: {msg}"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// A byte reader with one byte of pushback, which is all the lookahead
/// the data syntax needs. Callers reading from a socket should wrap the
/// stream in a `BufReader` first since this reads a byte at a time.
pub struct PushbackReader<R> {
    inner: R,
    peeked: Option<u8>,
}

impl<R: Read> PushbackReader<R> {
    pub fn new(inner: R) -> Self {
        PushbackReader { inner, peeked: None }
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(b) = self.peeked.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        if self.peeked.is_none() {
            self.peeked = self.next_byte()?;
        }
        Ok(self.peeked)
    }
}

fn is_whitespace(b: u8) -> bool {
    // the reader treats commas as whitespace
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b',')
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'"' | b';')
}

/// Read the next value from the stream, or `None` on a clean
/// end-of-stream at a value boundary.
pub fn read_value<R: Read>(r: &mut PushbackReader<R>) -> Result<Option<Value>, ReadError> {
    skip_whitespace(r)?;
    match r.peek_byte()? {
        None => Ok(None),
        Some(_) => read_datum(r).map(Some),
    }
}

/// Read the next value out of a source string, returning the value and
/// the byte offset one past it, so callers can walk a form stream.
pub fn read_from_str(src: &str) -> Result<Option<(Value, usize)>, ReadError> {
    let mut r = PushbackReader::new(src.as_bytes());
    let value = read_value(&mut r)?;
    let remaining = r.inner.len() + if r.peeked.is_some() { 1 } else { 0 };
    Ok(value.map(|v| (v, src.len() - remaining)))
}

fn skip_whitespace<R: Read>(r: &mut PushbackReader<R>) -> Result<(), ReadError> {
    loop {
        match r.peek_byte()? {
            Some(b) if is_whitespace(b) => {
                r.next_byte()?;
            }
            Some(b';') => {
                // line comment
                loop {
                    match r.next_byte()? {
                        None | Some(b'\n') => break,
                        Some(_) => {}
                    }
                }
            }
            _ => return Ok(()),
        }
    }
}

fn read_datum<R: Read>(r: &mut PushbackReader<R>) -> Result<Value, ReadError> {
    let b = r.peek_byte()?.ok_or(ReadError::UnexpectedEof)?;
    match b {
        b'(' => read_seq(r, b')'),
        b'[' => read_seq(r, b']'),
        b'{' => read_map(r),
        b'"' => read_string(r),
        b')' | b']' | b'}' => {
            Err(ReadError::Syntax(format!("unbalanced delimiter '{}'", b as char)))
        }
        _ => read_atom(r),
    }
}

fn read_seq<R: Read>(r: &mut PushbackReader<R>, close: u8) -> Result<Value, ReadError> {
    r.next_byte()?;
    let mut items = Vec::new();
    loop {
        skip_whitespace(r)?;
        match r.peek_byte()? {
            None => return Err(ReadError::UnexpectedEof),
            Some(b) if b == close => {
                r.next_byte()?;
                return Ok(Value::List(items));
            }
            Some(_) => items.push(read_datum(r)?),
        }
    }
}

fn read_map<R: Read>(r: &mut PushbackReader<R>) -> Result<Value, ReadError> {
    r.next_byte()?;
    let mut entries = BTreeMap::new();
    loop {
        skip_whitespace(r)?;
        match r.peek_byte()? {
            None => return Err(ReadError::UnexpectedEof),
            Some(b'}') => {
                r.next_byte()?;
                return Ok(Value::Map(entries));
            }
            Some(_) => {
                let key = match read_datum(r)? {
                    Value::Sym(s) | Value::Str(s) => s,
                    other => {
                        return Err(ReadError::Syntax(format!(
                            "map key must be a symbol or string, got {other}"
                        )));
                    }
                };
                skip_whitespace(r)?;
                match r.peek_byte()? {
                    None => return Err(ReadError::UnexpectedEof),
                    Some(b'}') => {
                        return Err(ReadError::Syntax(format!(
                            "map literal has a key '{key}' with no value"
                        )));
                    }
                    Some(_) => {
                        let value = read_datum(r)?;
                        entries.insert(key, value);
                    }
                }
            }
        }
    }
}

fn read_string<R: Read>(r: &mut PushbackReader<R>) -> Result<Value, ReadError> {
    r.next_byte()?;
    let mut buf = Vec::new();
    loop {
        match r.next_byte()? {
            None => return Err(ReadError::UnexpectedEof),
            Some(b'"') => break,
            Some(b'\\') => match r.next_byte()? {
                None => return Err(ReadError::UnexpectedEof),
                Some(b'n') => buf.push(b'\n'),
                Some(b't') => buf.push(b'\t'),
                Some(b'r') => buf.push(b'\r'),
                Some(b'"') => buf.push(b'"'),
                Some(b'\\') => buf.push(b'\\'),
                Some(other) => {
                    return Err(ReadError::Syntax(format!(
                        "unknown string escape '\\{}'",
                        other as char
                    )));
                }
            },
            Some(b) => buf.push(b),
        }
    }
    match String::from_utf8(buf) {
        Ok(s) => Ok(Value::Str(s)),
        Err(_) => Err(ReadError::Syntax(String::from("string literal is not valid utf-8"))),
    }
}

fn read_atom<R: Read>(r: &mut PushbackReader<R>) -> Result<Value, ReadError> {
    let mut buf = Vec::new();
    while let Some(b) = r.peek_byte()? {
        if is_whitespace(b) || is_delimiter(b) {
            break;
        }
        buf.push(b);
        r.next_byte()?;
    }
    match String::from_utf8(buf) {
        Ok(token) => Ok(classify_atom(&token)),
        Err(_) => Err(ReadError::Syntax(String::from("token is not valid utf-8"))),
    }
}

fn classify_atom(token: &str) -> Value {
    match token {
        "nil" => Value::Nil,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match token.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Sym(String::from(token)),
        },
    }
}
