//! Bot API glue: request formatting, update offsets and batch handling.
//!
//! The firmware talks plain HTTP/1.1 to a relay that forwards to the bot API,
//! so requests here are complete HTTP messages ready for a TCP socket.

use core::fmt::Write as _;

use heapless::String;

use crate::dispatch::{Dispatcher, GateLink, KEYBOARD};
use crate::parser::{find_body, walk_updates, BatchSummary, ParseError};
use crate::storage::Store;
use crate::tokenizer::{tokenize, Token, TokenizeError};

/// Updates requested per poll.
pub const UPDATES_LIMIT: usize = 5;

/// Room for the tokens of one getUpdates response.
pub const MAX_TOKENS: usize = 512;

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum BotError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("malformed HTTP response")]
    Malformed,
    #[error("tokenize: {0}")]
    Tokenize(#[from] TokenizeError),
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("request does not fit the buffer")]
    TooLarge,
}

impl From<core::fmt::Error> for BotError {
    fn from(_: core::fmt::Error) -> Self {
        BotError::TooLarge
    }
}

/// Next `offset` for getUpdates: one past the highest update seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOffset(i64);

impl UpdateOffset {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn advance(&mut self, summary: &BatchSummary) {
        if let Some(max) = summary.max_update_id {
            self.skip_to(max);
        }
    }

    /// Step past the first update of a response that could not be tokenized
    /// (usually one that overflowed the receive buffer). Returns whether an
    /// update id was found.
    pub fn skip_unreadable(&mut self, response: &[u8]) -> bool {
        match first_update_id(response) {
            Some(id) => {
                log::warn!("bot: skipping unreadable update {}", id);
                self.skip_to(id);
                true
            }
            None => false,
        }
    }

    /// Settle the offset after a batch was rejected. Responses the tokenizer
    /// or the parser could not handle are skipped past their first update, so
    /// the same batch is not fetched again forever. Returns whether the
    /// offset moved.
    pub fn recover(&mut self, error: &BotError, response: &[u8]) -> bool {
        match error {
            BotError::Tokenize(_) | BotError::Parse(_) => self.skip_unreadable(response),
            BotError::Status(_) | BotError::Malformed | BotError::TooLarge => false,
        }
    }

    fn skip_to(&mut self, update_id: i64) {
        if update_id >= self.0 {
            self.0 = update_id + 1;
        }
    }
}

/// Raw scan for the first `"update_id":<int>` in `response`.
fn first_update_id(response: &[u8]) -> Option<i64> {
    const KEY: &[u8] = b"\"update_id\"";
    let at = response.windows(KEY.len()).position(|w| w == KEY)? + KEY.len();
    let rest = &response[at..];
    let colon = rest.iter().position(|&b| b != b' ')?;
    if rest[colon] != b':' {
        return None;
    }
    let digits = &rest[colon + 1..];
    let start = digits.iter().position(|&b| b != b' ')?;
    let len = digits[start..]
        .iter()
        .take_while(|b| b.is_ascii_digit() || **b == b'-')
        .count();
    core::str::from_utf8(&digits[start..start + len]).ok()?.parse().ok()
}

pub fn get_updates_request<const N: usize>(
    out: &mut String<N>,
    host: &str,
    token: &str,
    offset: UpdateOffset,
) -> Result<(), BotError> {
    out.clear();
    write!(
        out,
        "GET /bot{}/getUpdates?offset={}&limit={} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: gatekeeper\r\n\
         Connection: close\r\n\r\n",
        token,
        offset.get(),
        UPDATES_LIMIT,
        host
    )?;
    Ok(())
}

/// Append `text` as the inside of a JSON string literal.
pub fn escape_json<const N: usize>(text: &str, out: &mut String<N>) -> Result<(), BotError> {
    for ch in text.chars() {
        let pushed = match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => write!(out, "\\u{:04x}", c as u32).map_err(|_| ()),
            c => out.push(c),
        };
        pushed.map_err(|_| BotError::TooLarge)?;
    }
    Ok(())
}

/// Build the JSON body of a sendMessage call, with the gate keyboard attached.
pub fn send_message_body<const N: usize>(
    out: &mut String<N>,
    chat_id: i64,
    text: &str,
) -> Result<(), BotError> {
    out.clear();
    write!(out, "{{\"chat_id\":{},\"text\":\"", chat_id)?;
    escape_json(text, out)?;
    out.push_str("\",\"reply_markup\":{\"keyboard\":[").map_err(|_| BotError::TooLarge)?;
    for (i, caption) in KEYBOARD.iter().enumerate() {
        if i > 0 {
            out.push(',').map_err(|_| BotError::TooLarge)?;
        }
        write!(out, "[\"{}\"]", caption)?;
    }
    out.push_str("],\"resize_keyboard\":true}}").map_err(|_| BotError::TooLarge)?;
    Ok(())
}

/// Build a complete sendMessage request around a body from
/// [`send_message_body`].
pub fn send_message_request<const N: usize>(
    out: &mut String<N>,
    host: &str,
    token: &str,
    body: &str,
) -> Result<(), BotError> {
    out.clear();
    write!(
        out,
        "POST /bot{}/sendMessage HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: gatekeeper\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        token,
        host,
        body.len(),
        body
    )?;
    Ok(())
}

/// Status code from the first line of an HTTP response.
pub fn http_status(response: &[u8]) -> Option<u16> {
    let line_end = response.iter().position(|&b| b == b'\r')?;
    let line = core::str::from_utf8(&response[..line_end]).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Handle one raw getUpdates response: dispatch every update and hand each
/// reply to `send` as `(chat_id, text)`.
pub fn handle_updates<S, G, F>(
    response: &[u8],
    tokens: &mut [Token],
    dispatcher: &mut Dispatcher<'_, S, G>,
    mut send: F,
) -> Result<BatchSummary, BotError>
where
    S: Store + ?Sized,
    G: GateLink + ?Sized,
    F: FnMut(i64, &str),
{
    match http_status(response) {
        Some(200) => {}
        Some(code) => return Err(BotError::Status(code)),
        None => return Err(BotError::Malformed),
    }
    let body = find_body(response).ok_or(BotError::Malformed)?;
    let count = tokenize(body, tokens)?;

    let summary = walk_updates(body, &tokens[..count], |update| {
        let Some(reply) = dispatcher.dispatch(update) else {
            return;
        };
        let chat = update
            .message
            .chat
            .id_value()
            .or_else(|| update.message.from.id_value());
        match chat {
            Some(chat_id) => send(chat_id, &reply),
            None => log::warn!("bot: reply for update {:?} has no chat", update.id_value()),
        }
    })?;

    log::debug!(
        "bot: {} updates handled, {} skipped",
        summary.parsed,
        summary.skipped
    );
    Ok(summary)
}
