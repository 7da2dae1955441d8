//! Structural parser over a tokenized getUpdates response.
//!
//! A [`Cursor`] walks the flat token array produced by
//! [`crate::tokenizer::tokenize`] and pulls out only the fields the bot
//! needs. Unknown keys are skipped whole, so new fields in the bot API never
//! break parsing. Extracted fields are slices of the response buffer;
//! nothing is copied and the buffer is not modified.

use heapless::String;

use crate::tokenizer::{Token, TokenKind, TokenizeError, MAX_DEPTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Object,
    Array,
    Key,
    String,
    Int,
    Bool,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("token stream ended early")]
    Truncated,
    #[error("expected {expected:?} at token {at}")]
    UnexpectedKind { expected: Expect, at: usize },
    #[error("nesting deeper than {}", MAX_DEPTH)]
    TooDeep,
    #[error("response is not ok")]
    NotOk,
    #[error("response has no result array")]
    NoResult,
    #[error("tokenize: {0}")]
    Tokenize(#[from] TokenizeError),
}

/// Position in a token array together with the buffer the tokens point into.
pub struct Cursor<'a> {
    buf: &'a [u8],
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8], tokens: &'a [Token]) -> Self {
        Self {
            buf,
            tokens,
            pos: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub fn peek(&self) -> Result<&'a Token, ParseError> {
        self.tokens.get(self.pos).ok_or(ParseError::Truncated)
    }

    fn advance(&mut self) -> Result<&'a Token, ParseError> {
        let token = self.peek()?;
        self.pos += 1;
        Ok(token)
    }

    /// Consume one token of `kind`, or fail without moving.
    fn expect(&mut self, kind: TokenKind, expected: Expect) -> Result<&'a Token, ParseError> {
        let token = self.peek()?;
        if token.kind != kind {
            return Err(ParseError::UnexpectedKind {
                expected,
                at: self.pos,
            });
        }
        self.pos += 1;
        Ok(token)
    }

    /// Consume one complete value, whatever its shape.
    ///
    /// Tokens are in document order, so the value ends before the first
    /// token that starts at or after its closing byte. No nesting limit
    /// applies here.
    pub fn skip_subtree(&mut self) -> Result<(), ParseError> {
        let mut token = self.advance()?;
        if token.kind == TokenKind::String && token.size > 0 {
            // A key: its value follows.
            token = self.advance()?;
        }
        let end = token.end;
        while self.tokens.get(self.pos).is_some_and(|t| t.start < end) {
            self.pos += 1;
        }
        Ok(())
    }

    /// Walk the key/value pairs of the object under the cursor.
    ///
    /// `field` is called with each key and the cursor on its value. It either
    /// consumes the value and returns `true`, or returns `false` to have the
    /// value skipped.
    pub fn object_fields<F>(&mut self, depth: usize, mut field: F) -> Result<(), ParseError>
    where
        F: FnMut(&mut Self, &'a [u8]) -> Result<bool, ParseError>,
    {
        if depth > MAX_DEPTH {
            return Err(ParseError::TooDeep);
        }
        let object = self.expect(TokenKind::Object, Expect::Object)?;
        for _ in 0..object.size {
            let at = self.pos;
            let key = self.expect(TokenKind::String, Expect::Key)?;
            if key.size != 1 {
                return Err(ParseError::UnexpectedKind {
                    expected: Expect::Key,
                    at,
                });
            }
            let name = key.span(self.buf);
            if !field(self, name)? {
                self.skip_subtree()?;
            }
        }
        Ok(())
    }

    /// Enter the array under the cursor, returning its element count.
    pub fn array(&mut self) -> Result<usize, ParseError> {
        Ok(self.expect(TokenKind::Array, Expect::Array)?.size)
    }

    pub fn take_string(&mut self) -> Result<&'a [u8], ParseError> {
        let token = self.peek()?;
        if token.kind != TokenKind::String || token.size != 0 {
            return Err(ParseError::UnexpectedKind {
                expected: Expect::String,
                at: self.pos,
            });
        }
        self.pos += 1;
        Ok(token.span(self.buf))
    }

    pub fn take_int(&mut self) -> Result<&'a [u8], ParseError> {
        let token = self.peek()?;
        let span = token.span(self.buf);
        let numeric = matches!(span.first(), Some(b'-' | b'0'..=b'9'));
        if token.kind != TokenKind::Primitive || !numeric {
            return Err(ParseError::UnexpectedKind {
                expected: Expect::Int,
                at: self.pos,
            });
        }
        self.pos += 1;
        Ok(span)
    }

    pub fn take_bool(&mut self) -> Result<&'a [u8], ParseError> {
        let token = self.peek()?;
        let span = token.span(self.buf);
        if token.kind != TokenKind::Primitive || !(span == b"true" || span == b"false") {
            return Err(ParseError::UnexpectedKind {
                expected: Expect::Bool,
                at: self.pos,
            });
        }
        self.pos += 1;
        Ok(span)
    }
}

/// Parse an integer span such as `-1001234`.
pub fn parse_i64(span: &[u8]) -> Option<i64> {
    core::str::from_utf8(span).ok()?.parse().ok()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedUser<'a> {
    pub id: Option<&'a [u8]>,
    pub first_name: Option<&'a [u8]>,
    pub last_name: Option<&'a [u8]>,
    pub username: Option<&'a [u8]>,
    pub is_bot: Option<&'a [u8]>,
}

impl ParsedUser<'_> {
    pub fn id_value(&self) -> Option<i64> {
        self.id.and_then(parse_i64)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedChat<'a> {
    pub id: Option<&'a [u8]>,
    pub kind: Option<&'a [u8]>,
    pub first_name: Option<&'a [u8]>,
    pub last_name: Option<&'a [u8]>,
    pub username: Option<&'a [u8]>,
}

impl ParsedChat<'_> {
    pub fn id_value(&self) -> Option<i64> {
        self.id.and_then(parse_i64)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedMessage<'a> {
    pub id: Option<&'a [u8]>,
    pub from: ParsedUser<'a>,
    pub chat: ParsedChat<'a>,
    pub text: Option<&'a [u8]>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedUpdate<'a> {
    pub id: Option<&'a [u8]>,
    pub message: ParsedMessage<'a>,
}

impl ParsedUpdate<'_> {
    pub fn id_value(&self) -> Option<i64> {
        self.id.and_then(parse_i64)
    }
}

pub fn parse_user<'a>(
    cursor: &mut Cursor<'a>,
    depth: usize,
) -> Result<ParsedUser<'a>, ParseError> {
    let mut user = ParsedUser::default();
    cursor.object_fields(depth, |c, key| {
        match key {
            b"id" => user.id = Some(c.take_int()?),
            b"first_name" => user.first_name = Some(c.take_string()?),
            b"last_name" => user.last_name = Some(c.take_string()?),
            b"username" => user.username = Some(c.take_string()?),
            b"is_bot" => user.is_bot = Some(c.take_bool()?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok(user)
}

pub fn parse_chat<'a>(
    cursor: &mut Cursor<'a>,
    depth: usize,
) -> Result<ParsedChat<'a>, ParseError> {
    let mut chat = ParsedChat::default();
    cursor.object_fields(depth, |c, key| {
        match key {
            b"id" => chat.id = Some(c.take_int()?),
            b"type" => chat.kind = Some(c.take_string()?),
            b"first_name" => chat.first_name = Some(c.take_string()?),
            b"last_name" => chat.last_name = Some(c.take_string()?),
            b"username" => chat.username = Some(c.take_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok(chat)
}

pub fn parse_message<'a>(
    cursor: &mut Cursor<'a>,
    depth: usize,
) -> Result<ParsedMessage<'a>, ParseError> {
    let mut message = ParsedMessage::default();
    cursor.object_fields(depth, |c, key| {
        match key {
            b"message_id" => message.id = Some(c.take_int()?),
            b"from" => message.from = parse_user(c, depth + 1)?,
            b"chat" => message.chat = parse_chat(c, depth + 1)?,
            b"text" => message.text = Some(c.take_string()?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok(message)
}

pub fn parse_update<'a>(
    cursor: &mut Cursor<'a>,
    depth: usize,
) -> Result<ParsedUpdate<'a>, ParseError> {
    let mut update = ParsedUpdate::default();
    cursor.object_fields(depth, |c, key| {
        match key {
            b"update_id" => update.id = Some(c.take_int()?),
            b"message" => update.message = parse_message(c, depth + 1)?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok(update)
}

/// Best-effort `update_id` of a malformed update, so the poll offset can
/// still move past it.
fn recover_update_id(cursor: &mut Cursor<'_>, depth: usize) -> Option<i64> {
    let mut id = None;
    cursor
        .object_fields(depth, |c, key| {
            if key == b"update_id" {
                if let Ok(span) = c.take_int() {
                    id = parse_i64(span);
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .ok()?;
    id
}

/// Returns the HTTP body: everything after the first blank line.
pub fn find_body(response: &[u8]) -> Option<&[u8]> {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| &response[at + 4..])
}

/// Outcome of walking one getUpdates batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub parsed: usize,
    pub skipped: usize,
    /// Highest `update_id` seen, including skipped updates when recoverable.
    pub max_update_id: Option<i64>,
}

impl BatchSummary {
    fn saw(&mut self, id: Option<i64>) {
        if let Some(id) = id {
            self.max_update_id = Some(self.max_update_id.map_or(id, |max| max.max(id)));
        }
    }
}

/// Walk a tokenized `{"ok": true, "result": [...]}` body, calling
/// `on_update` for every well-formed update.
///
/// A response without `"ok": true` is rejected as a whole. A malformed
/// update is skipped whole and the walk continues
/// with the next element.
pub fn walk_updates<'a, F>(
    body: &'a [u8],
    tokens: &'a [Token],
    mut on_update: F,
) -> Result<BatchSummary, ParseError>
where
    F: FnMut(&ParsedUpdate<'a>),
{
    let mut cursor = Cursor::new(body, tokens);
    let mut ok = false;
    let mut result_at = None;
    cursor.object_fields(0, |c, key| match key {
        b"ok" => {
            ok = c.take_bool()? == b"true";
            Ok(true)
        }
        b"result" => {
            result_at = Some(c.pos());
            Ok(false)
        }
        _ => Ok(false),
    })?;
    if !ok {
        return Err(ParseError::NotOk);
    }

    cursor.seek(result_at.ok_or(ParseError::NoResult)?);
    let count = cursor.array()?;

    let mut summary = BatchSummary::default();
    for _ in 0..count {
        let start = cursor.pos();
        match parse_update(&mut cursor, 2) {
            Ok(update) => {
                summary.parsed += 1;
                summary.saw(update.id_value());
                on_update(&update);
            }
            Err(e) => {
                log::warn!("parser: skipping malformed update at token {}: {}", start, e);
                cursor.seek(start);
                let id = recover_update_id(&mut cursor, 2);
                cursor.seek(start);
                cursor.skip_subtree()?;
                summary.skipped += 1;
                summary.saw(id);
            }
        }
    }
    Ok(summary)
}

/// Decode a JSON string span into `out`, stopping quietly when `out` is
/// full. Invalid escapes decode as U+FFFD.
pub fn unescape_into<const N: usize>(span: &[u8], out: &mut String<N>) {
    out.clear();
    let mut i = 0;
    while i < span.len() {
        let (ch, used) = match span[i] {
            b'\\' => decode_escape(&span[i..]),
            _ => decode_utf8(&span[i..]),
        };
        if out.push(ch).is_err() {
            return;
        }
        i += used;
    }
}

fn decode_utf8(bytes: &[u8]) -> (char, usize) {
    let len = match bytes[0] {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    };
    let end = len.min(bytes.len());
    match core::str::from_utf8(&bytes[..end]).ok().and_then(|s| s.chars().next()) {
        Some(ch) => (ch, end),
        None => (char::REPLACEMENT_CHARACTER, 1),
    }
}

fn decode_escape(bytes: &[u8]) -> (char, usize) {
    let ch = match bytes.get(1) {
        Some(b'"') => '"',
        Some(b'\\') => '\\',
        Some(b'/') => '/',
        Some(b'b') => '\u{8}',
        Some(b'f') => '\u{c}',
        Some(b'n') => '\n',
        Some(b'r') => '\r',
        Some(b't') => '\t',
        Some(b'u') => return decode_unicode(bytes),
        _ => return (char::REPLACEMENT_CHARACTER, 1),
    };
    (ch, 2)
}

fn hex4(bytes: &[u8]) -> Option<u32> {
    let text = core::str::from_utf8(bytes.get(..4)?).ok()?;
    u32::from_str_radix(text, 16).ok()
}

/// `\uXXXX`, joining a following low surrogate when present.
fn decode_unicode(bytes: &[u8]) -> (char, usize) {
    let Some(high) = bytes.get(2..).and_then(hex4) else {
        return (char::REPLACEMENT_CHARACTER, 2);
    };
    if (0xD800..0xDC00).contains(&high) {
        if bytes.get(6..8) == Some(b"\\u") {
            if let Some(low) = bytes.get(8..).and_then(hex4) {
                if (0xDC00..0xE000).contains(&low) {
                    let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    return (char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER), 12);
                }
            }
        }
        return (char::REPLACEMENT_CHARACTER, 6);
    }
    (char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER), 6)
}
