//! Allocation-free JSON tokenizer.
//!
//! Splits a JSON document into a flat array of [`Token`] spans in document
//! order, the same layout jsmn produces:
//!
//! - objects and arrays span their brackets; `size` counts keys or elements
//! - a key is a `String` token with `size == 1`; its value is the next token
//! - string spans exclude the quotes and keep escapes untouched
//! - `true`, `false`, `null` and numbers are `Primitive`
//!
//! The buffer is never modified. This is a tokenizer, not a validator:
//! it rejects broken structure but accepts some sloppy JSON (missing commas).

use heapless::Vec;

/// Deepest container nesting accepted.
pub const MAX_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenKind {
    #[default]
    Undefined,
    Object,
    Array,
    String,
    Primitive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    pub size: usize,
}

impl Token {
    /// Bytes covered by this token.
    pub fn span<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.start..self.end).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("not enough tokens")]
    NoMemory,
    #[error("invalid character at byte {at}")]
    Invalid { at: usize },
    #[error("document is truncated")]
    Partial,
    #[error("nesting deeper than {}", MAX_DEPTH)]
    TooDeep,
}

struct Tokenizer<'t> {
    tokens: &'t mut [Token],
    count: usize,
    /// Open containers, innermost last.
    open: Vec<usize, MAX_DEPTH>,
    /// Key in the innermost object whose value has not been seen yet.
    key: Option<usize>,
    /// A `:` followed `key`.
    colon: bool,
}

impl<'t> Tokenizer<'t> {
    fn alloc(&mut self, kind: TokenKind, start: usize, end: usize) -> Result<usize, TokenizeError> {
        let slot = self.tokens.get_mut(self.count).ok_or(TokenizeError::NoMemory)?;
        *slot = Token {
            kind,
            start,
            end,
            size: 0,
        };
        self.count += 1;
        Ok(self.count - 1)
    }

    /// Hook a new token at `pos` into its parent. Returns whether it is a key.
    fn attach(&mut self, kind: TokenKind, pos: usize) -> Result<bool, TokenizeError> {
        let Some(&parent) = self.open.last() else {
            return Ok(false);
        };
        match self.tokens[parent].kind {
            TokenKind::Object => match self.key {
                Some(key) if self.colon => {
                    self.tokens[key].size = 1;
                    self.key = None;
                    self.colon = false;
                    Ok(false)
                }
                None if kind == TokenKind::String => {
                    self.tokens[parent].size += 1;
                    Ok(true)
                }
                _ => Err(TokenizeError::Invalid { at: pos }),
            },
            _ => {
                self.tokens[parent].size += 1;
                Ok(false)
            }
        }
    }

    fn open_container(&mut self, kind: TokenKind, pos: usize) -> Result<(), TokenizeError> {
        self.attach(kind, pos)?;
        let index = self.alloc(kind, pos, pos)?;
        self.open.push(index).map_err(|_| TokenizeError::TooDeep)
    }

    fn close_container(&mut self, kind: TokenKind, pos: usize) -> Result<(), TokenizeError> {
        let index = self.open.pop().ok_or(TokenizeError::Invalid { at: pos })?;
        if self.tokens[index].kind != kind || self.key.is_some() {
            return Err(TokenizeError::Invalid { at: pos });
        }
        self.tokens[index].end = pos + 1;
        Ok(())
    }

    fn string(&mut self, buf: &[u8], quote: usize) -> Result<usize, TokenizeError> {
        let start = quote + 1;
        let mut pos = start;
        while let Some(&c) = buf.get(pos) {
            match c {
                b'"' => {
                    let is_key = self.attach(TokenKind::String, quote)?;
                    let index = self.alloc(TokenKind::String, start, pos)?;
                    if is_key {
                        self.key = Some(index);
                    }
                    return Ok(pos + 1);
                }
                b'\\' => {
                    pos += 1;
                    match buf.get(pos) {
                        Some(b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't') => {}
                        Some(b'u') => {
                            for i in 1..=4 {
                                match buf.get(pos + i) {
                                    Some(h) if h.is_ascii_hexdigit() => {}
                                    Some(_) => return Err(TokenizeError::Invalid { at: pos + i }),
                                    None => return Err(TokenizeError::Partial),
                                }
                            }
                            pos += 4;
                        }
                        Some(_) => return Err(TokenizeError::Invalid { at: pos }),
                        None => return Err(TokenizeError::Partial),
                    }
                }
                _ => {}
            }
            pos += 1;
        }
        Err(TokenizeError::Partial)
    }

    fn primitive(&mut self, buf: &[u8], start: usize) -> Result<usize, TokenizeError> {
        let mut pos = start;
        while let Some(&c) = buf.get(pos) {
            match c {
                b'\t' | b'\r' | b'\n' | b' ' | b',' | b']' | b'}' | b':' => break,
                c if !(32..127).contains(&c) => return Err(TokenizeError::Invalid { at: pos }),
                _ => pos += 1,
            }
        }
        if pos == buf.len() && !self.open.is_empty() {
            return Err(TokenizeError::Partial);
        }
        self.attach(TokenKind::Primitive, start)?;
        self.alloc(TokenKind::Primitive, start, pos)?;
        Ok(pos)
    }
}

/// Tokenize `buf` into `tokens`, returning the number of tokens written.
pub fn tokenize(buf: &[u8], tokens: &mut [Token]) -> Result<usize, TokenizeError> {
    let mut t = Tokenizer {
        tokens,
        count: 0,
        open: Vec::new(),
        key: None,
        colon: false,
    };

    let mut pos = 0;
    while let Some(&c) = buf.get(pos) {
        match c {
            b'{' => {
                t.open_container(TokenKind::Object, pos)?;
                pos += 1;
            }
            b'[' => {
                t.open_container(TokenKind::Array, pos)?;
                pos += 1;
            }
            b'}' => {
                t.close_container(TokenKind::Object, pos)?;
                pos += 1;
            }
            b']' => {
                t.close_container(TokenKind::Array, pos)?;
                pos += 1;
            }
            b'"' => pos = t.string(buf, pos)?,
            b':' => {
                if t.key.is_none() || t.colon {
                    return Err(TokenizeError::Invalid { at: pos });
                }
                t.colon = true;
                pos += 1;
            }
            b',' => {
                if t.key.is_some() {
                    return Err(TokenizeError::Invalid { at: pos });
                }
                pos += 1;
            }
            b'\t' | b'\r' | b'\n' | b' ' => pos += 1,
            b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => pos = t.primitive(buf, pos)?,
            _ => return Err(TokenizeError::Invalid { at: pos }),
        }
    }

    if !t.open.is_empty() {
        return Err(TokenizeError::Partial);
    }
    Ok(t.count)
}
