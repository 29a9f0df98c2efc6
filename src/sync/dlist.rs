//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Syncbak.
//
// Syncbak is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Syncbak is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty  of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU  General Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Syncbak. If not, see <http://www.gnu.org/licenses/>.

//! The replication key/value-list serialization.
//!
//! Every command line in a backup chunk has the form
//! `<ts> <VERB> <NAME> <value>\r\n`, where the value grammar is:
//!
//! - kvlist: `%(KEY value KEY value …)`
//! - list: `(value value …)`
//! - quoted string: `"…"` with `\`-escapes for `"` and `\`
//! - counted literal: `{n+}\r\n` followed by exactly n raw bytes
//! - bare atom, or `NIL`
//!
//! Literals may contain CRLF, so a command "line" cannot be read with a
//! line-oriented reader; parsing is byte-at-a-time from a counted stream.
//! Lines starting with `#` are comments: tolerated, surfaced raw, and never
//! executed. The serializer is canonical — parse followed by format yields
//! the exact bytes the append engine would have produced — which is what
//! lets reindex reconstruct chunk checksums.
//!
//! Parsing and formatting both report the position of every literal
//! payload; the message indexing policy records those spans so raw message
//! bytes can be retrieved from a chunk later without re-parsing it.

use std::io::Read;
use std::ops::Range;

use crate::support::error::Error;

/// Characters which force an atom into the quoted form. `\` is absent so
/// that system flags like `\Seen` print bare, as the replication protocol
/// writes them.
const SPECIALS: &[u8] = b" ()\"{}%";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Atom(String),
    Nil,
    Literal(Vec<u8>),
    List(Vec<Dlist>),
    Kvlist(Vec<Dlist>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dlist {
    name: Option<String>,
    value: Value,
}

/// The location of one literal's payload within the enclosing stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiteralSpan {
    pub offset: u64,
    pub length: u64,
}

/// One parsed command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    pub ts: i64,
    pub verb: String,
    pub dlist: Dlist,
    /// Payload spans of `Value::Literal` nodes, in document order,
    /// relative to the stream the line was parsed from.
    pub literals: Vec<LiteralSpan>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedLine {
    /// A `#` comment, without its line terminator.
    Comment(Vec<u8>),
    Command(Line),
}

impl Dlist {
    pub fn kvlist(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Value::Kvlist(Vec::new()),
        }
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Value::List(Vec::new()),
        }
    }

    /// An unnamed kvlist, as used for entries of a RECORD list.
    pub fn anonymous_kvlist() -> Self {
        Self {
            name: None,
            value: Value::Kvlist(Vec::new()),
        }
    }

    /// An unnamed atom, as used for entries of FLAGS and UID lists.
    pub fn flag(value: impl Into<String>) -> Self {
        Self {
            name: None,
            value: Value::Atom(value.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Normalizes the top-level name to upper case, as reindex does before
    /// replaying a command.
    pub fn upcase_name(&mut self) {
        if let Some(ref mut name) = self.name {
            name.make_ascii_uppercase();
        }
    }

    pub fn set_value(&mut self, key: &str, value: Value) -> &mut Self {
        match self.value {
            Value::Kvlist(ref mut children) => children.push(Dlist {
                name: Some(key.to_owned()),
                value,
            }),
            _ => panic!("set_value on non-kvlist"),
        }
        self
    }

    pub fn set_atom(
        &mut self,
        key: &str,
        value: impl Into<String>,
    ) -> &mut Self {
        self.set_value(key, Value::Atom(value.into()))
    }

    pub fn set_num32(&mut self, key: &str, value: u32) -> &mut Self {
        self.set_value(key, Value::Atom(value.to_string()))
    }

    pub fn set_num64(&mut self, key: &str, value: u64) -> &mut Self {
        self.set_value(key, Value::Atom(value.to_string()))
    }

    pub fn set_date(&mut self, key: &str, value: i64) -> &mut Self {
        self.set_value(key, Value::Atom(value.to_string()))
    }

    pub fn set_literal(&mut self, key: &str, data: Vec<u8>) -> &mut Self {
        self.set_value(key, Value::Literal(data))
    }

    /// Appends `child` to a list value.
    pub fn push(&mut self, child: Dlist) -> &mut Self {
        match self.value {
            Value::List(ref mut children) => children.push(child),
            _ => panic!("push on non-list"),
        }
        self
    }

    /// The children of a list or kvlist value; empty for leaves.
    pub fn children(&self) -> &[Dlist] {
        match self.value {
            Value::List(ref children) | Value::Kvlist(ref children) => {
                children
            },
            _ => &[],
        }
    }

    /// Looks up a kvlist entry by key.
    pub fn get(&self, key: &str) -> Option<&Dlist> {
        match self.value {
            Value::Kvlist(ref children) => {
                children.iter().find(|c| Some(key) == c.name())
            },
            _ => None,
        }
    }

    pub fn atom(&self, key: &str) -> Option<&str> {
        match self.get(key)?.value {
            Value::Atom(ref s) => Some(s),
            _ => None,
        }
    }

    pub fn num32(&self, key: &str) -> Option<u32> {
        self.atom(key)?.parse().ok()
    }

    pub fn num64(&self, key: &str) -> Option<u64> {
        self.atom(key)?.parse().ok()
    }

    pub fn date(&self, key: &str) -> Option<i64> {
        self.atom(key)?.parse().ok()
    }

    pub fn literal(&self, key: &str) -> Option<&[u8]> {
        match self.get(key)?.value {
            Value::Literal(ref data) => Some(data),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting

/// Formats one command line.
///
/// `base` is the offset at which the line will be placed within its stream;
/// the returned spans are relative to that same stream.
pub fn format_line(
    ts: i64,
    verb: &str,
    dl: &Dlist,
    base: u64,
) -> Result<(Vec<u8>, Vec<LiteralSpan>), Error> {
    let name = dl.name().ok_or(Error::MalformedCommand)?;

    let mut out = Vec::new();
    let mut literals = Vec::new();

    out.extend_from_slice(format!("{} {} {} ", ts, verb, name).as_bytes());
    write_value(&mut out, base, &dl.value, &mut literals)?;
    out.extend_from_slice(b"\r\n");

    Ok((out, literals))
}

/// Formats a bare value, as stored in the index's flags and annotations
/// columns.
pub fn format_map(value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut literals = Vec::new();
    write_value(&mut out, 0, value, &mut literals)?;
    Ok(out)
}

fn write_value(
    out: &mut Vec<u8>,
    base: u64,
    value: &Value,
    literals: &mut Vec<LiteralSpan>,
) -> Result<(), Error> {
    match *value {
        Value::Nil => out.extend_from_slice(b"NIL"),

        Value::Atom(ref s) => write_atom(out, s),

        Value::Literal(ref data) => {
            write_literal_intro(out, data.len());
            literals.push(LiteralSpan {
                offset: base + out.len() as u64,
                length: data.len() as u64,
            });
            out.extend_from_slice(data);
        },

        Value::List(ref children) => {
            out.push(b'(');
            for (i, child) in children.iter().enumerate() {
                if 0 != i {
                    out.push(b' ');
                }
                write_value(out, base, &child.value, literals)?;
            }
            out.push(b')');
        },

        Value::Kvlist(ref children) => {
            out.extend_from_slice(b"%(");
            for (i, child) in children.iter().enumerate() {
                if 0 != i {
                    out.push(b' ');
                }

                let key = child.name().ok_or(Error::MalformedCommand)?;
                out.extend_from_slice(key.as_bytes());
                out.push(b' ');
                write_value(out, base, &child.value, literals)?;
            }
            out.push(b')');
        },
    }

    Ok(())
}

fn write_atom(out: &mut Vec<u8>, s: &str) {
    if s.bytes().any(|b| b'\r' == b || b'\n' == b) {
        // Atoms with line breaks only survive as literals. These never
        // carry message payloads, so no span is recorded.
        write_literal_intro(out, s.len());
        out.extend_from_slice(s.as_bytes());
    } else if s.is_empty()
        || "NIL" == s
        || s.bytes().any(|b| SPECIALS.contains(&b))
    {
        out.push(b'"');
        for b in s.bytes() {
            if b'"' == b || b'\\' == b {
                out.push(b'\\');
            }
            out.push(b);
        }
        out.push(b'"');
    } else {
        out.extend_from_slice(s.as_bytes());
    }
}

fn write_literal_intro(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(format!("{{{}+}}\r\n", len).as_bytes());
}

// ---------------------------------------------------------------------------
// Parsing

/// Byte-counted reader over a decompressed chunk stream.
pub struct LineReader<R> {
    src: R,
    buf: Vec<u8>,
    range: Range<usize>,
    pos: u64,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            buf: vec![0u8; 4096],
            range: 0..0,
            pos: 0,
            eof: false,
        }
    }

    /// The number of bytes consumed so far.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    fn fill(&mut self) -> Result<(), Error> {
        if !self.range.is_empty() || self.eof {
            return Ok(());
        }

        let nread = self.src.read(&mut self.buf)?;
        self.range = 0..nread;
        self.eof = 0 == nread;
        Ok(())
    }

    fn peek(&mut self) -> Result<Option<u8>, Error> {
        self.fill()?;
        Ok(self.range.clone().next().map(|ix| self.buf[ix]))
    }

    fn getc(&mut self) -> Result<Option<u8>, Error> {
        self.fill()?;
        match self.range.clone().next() {
            None => Ok(None),
            Some(ix) => {
                self.range.start += 1;
                self.pos += 1;
                Ok(Some(self.buf[ix]))
            },
        }
    }

    /// A byte which must be present.
    fn need(&mut self) -> Result<u8, Error> {
        self.getc()?.ok_or(Error::MalformedCommand)
    }

    fn read_exact(&mut self, want: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            self.fill()?;
            if self.range.is_empty() {
                return Err(Error::MalformedCommand);
            }

            let take = self.range.len().min(want - out.len());
            out.extend_from_slice(
                &self.buf[self.range.start..self.range.start + take],
            );
            self.range.start += take;
            self.pos += take as u64;
        }
        Ok(out)
    }
}

/// Parses the next line, comment or command, returning `None` at stream
/// end.
pub fn parse_any_line<R: Read>(
    r: &mut LineReader<R>,
) -> Result<Option<ParsedLine>, Error> {
    loop {
        match r.peek()? {
            None => return Ok(None),
            // Tolerate blank lines.
            Some(b'\r') | Some(b'\n') => {
                r.getc()?;
            },
            Some(b'#') => {
                let mut comment = Vec::new();
                loop {
                    match r.getc()? {
                        None | Some(b'\n') => break,
                        Some(b'\r') => (),
                        Some(c) => comment.push(c),
                    }
                }
                return Ok(Some(ParsedLine::Comment(comment)));
            },
            Some(_) => break,
        }
    }

    let ts = parse_ts(r)?;
    expect_sp(r)?;
    let verb = parse_word(r)?;
    expect_sp(r)?;
    let name = parse_word(r)?;
    expect_sp(r)?;

    let mut literals = Vec::new();
    let value = parse_value(r, &mut literals)?;

    match r.need()? {
        b'\n' => (),
        b'\r' => {
            if b'\n' != r.need()? {
                return Err(Error::MalformedCommand);
            }
        },
        _ => return Err(Error::MalformedCommand),
    }

    Ok(Some(ParsedLine::Command(Line {
        ts,
        verb,
        dlist: Dlist {
            name: Some(name),
            value,
        },
        literals,
    })))
}

/// Parses the next command line, skipping comments.
pub fn parse_line<R: Read>(
    r: &mut LineReader<R>,
) -> Result<Option<Line>, Error> {
    loop {
        match parse_any_line(r)? {
            None => return Ok(None),
            Some(ParsedLine::Comment(_)) => (),
            Some(ParsedLine::Command(line)) => return Ok(Some(line)),
        }
    }
}

/// Parses a bare value from index-stored bytes (flags, annotations).
pub fn parse_map(bytes: &[u8]) -> Result<Value, Error> {
    let mut r = LineReader::new(bytes);
    let mut literals = Vec::new();
    let value = parse_value(&mut r, &mut literals)?;

    if r.pos() != bytes.len() as u64 {
        return Err(Error::MalformedCommand);
    }
    Ok(value)
}

fn parse_ts<R: Read>(r: &mut LineReader<R>) -> Result<i64, Error> {
    let word = parse_word(r)?;
    word.parse().map_err(|_| Error::MalformedCommand)
}

fn expect_sp<R: Read>(r: &mut LineReader<R>) -> Result<(), Error> {
    if b' ' != r.need()? {
        return Err(Error::MalformedCommand);
    }
    Ok(())
}

fn parse_word<R: Read>(r: &mut LineReader<R>) -> Result<String, Error> {
    let mut word = Vec::new();
    loop {
        match r.peek()? {
            Some(c)
                if b' ' != c
                    && b'\r' != c
                    && b'\n' != c
                    && b'(' != c
                    && b')' != c =>
            {
                word.push(c);
                r.getc()?;
            },
            _ => break,
        }
    }

    if word.is_empty() {
        return Err(Error::MalformedCommand);
    }
    String::from_utf8(word).map_err(|_| Error::MalformedCommand)
}

fn parse_value<R: Read>(
    r: &mut LineReader<R>,
    literals: &mut Vec<LiteralSpan>,
) -> Result<Value, Error> {
    match r.peek()?.ok_or(Error::MalformedCommand)? {
        b'%' => {
            r.getc()?;
            if b'(' != r.need()? {
                return Err(Error::MalformedCommand);
            }
            parse_kvlist(r, literals)
        },

        b'(' => {
            r.getc()?;
            let mut children = Vec::new();
            loop {
                skip_spaces(r)?;
                if Some(b')') == r.peek()? {
                    r.getc()?;
                    return Ok(Value::List(children));
                }

                let value = parse_value(r, literals)?;
                children.push(Dlist { name: None, value });
            }
        },

        b'{' => parse_literal(r, literals),

        b'"' => parse_quoted(r),

        _ => {
            let word = parse_word(r)?;
            if "NIL" == word {
                Ok(Value::Nil)
            } else {
                Ok(Value::Atom(word))
            }
        },
    }
}

fn parse_kvlist<R: Read>(
    r: &mut LineReader<R>,
    literals: &mut Vec<LiteralSpan>,
) -> Result<Value, Error> {
    let mut children = Vec::new();
    loop {
        skip_spaces(r)?;
        if Some(b')') == r.peek()? {
            r.getc()?;
            return Ok(Value::Kvlist(children));
        }

        let key = parse_word(r)?;
        skip_spaces(r)?;
        let value = parse_value(r, literals)?;
        children.push(Dlist {
            name: Some(key),
            value,
        });
    }
}

fn parse_literal<R: Read>(
    r: &mut LineReader<R>,
    literals: &mut Vec<LiteralSpan>,
) -> Result<Value, Error> {
    // Opening brace.
    r.getc()?;

    let mut len: u64 = 0;
    let mut digits = 0;
    loop {
        match r.need()? {
            c @ b'0'..=b'9' => {
                len = len
                    .checked_mul(10)
                    .and_then(|l| l.checked_add((c - b'0') as u64))
                    .ok_or(Error::MalformedCommand)?;
                digits += 1;
            },
            b'+' => {
                if b'}' != r.need()? {
                    return Err(Error::MalformedCommand);
                }
                break;
            },
            b'}' => break,
            _ => return Err(Error::MalformedCommand),
        }
    }
    if 0 == digits {
        return Err(Error::MalformedCommand);
    }

    if b'\r' != r.need()? || b'\n' != r.need()? {
        return Err(Error::MalformedCommand);
    }

    let length = len;
    let offset = r.pos();
    let data = r.read_exact(
        usize::try_from(len).map_err(|_| Error::MalformedCommand)?,
    )?;

    literals.push(LiteralSpan { offset, length });
    Ok(Value::Literal(data))
}

fn parse_quoted<R: Read>(r: &mut LineReader<R>) -> Result<Value, Error> {
    // Opening quote.
    r.getc()?;

    let mut s = Vec::new();
    loop {
        match r.need()? {
            b'"' => break,
            b'\\' => s.push(r.need()?),
            b'\r' | b'\n' => return Err(Error::MalformedCommand),
            c => s.push(c),
        }
    }

    String::from_utf8(s)
        .map(Value::Atom)
        .map_err(|_| Error::MalformedCommand)
}

fn skip_spaces<R: Read>(r: &mut LineReader<R>) -> Result<(), Error> {
    while Some(b' ') == r.peek()? {
        r.getc()?;
    }
    Ok(())
}
