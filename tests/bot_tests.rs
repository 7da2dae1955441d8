//! Tests for bot request formatting, offsets and batch handling.

mod common;

use common::{FakeGate, MemStore};
use gatekeeper::bot::{
    escape_json, get_updates_request, handle_updates, http_status, send_message_body,
    send_message_request, BotError, UpdateOffset,
};
use gatekeeper::config::Settings;
use gatekeeper::dispatch::Dispatcher;
use gatekeeper::gate::{Gate, GateRequest};
use gatekeeper::parser::{find_body, BatchSummary, ParseError};
use gatekeeper::registry::{Registry, Table};
use gatekeeper::tokenizer::{tokenize, Token, TokenKind, TokenizeError};
use heapless::String;

fn http_ok(body: &str) -> std::string::String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Run one response through a dispatcher with user 200 registered and
/// collect `(chat_id, reply)` pairs.
fn handle(
    response: &str,
    tokens: &mut [Token],
    gate: &mut FakeGate,
) -> (
    Result<BatchSummary, BotError>,
    Vec<(i64, std::string::String)>,
) {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    let settings = Settings::new();
    registry.add(&mut store, Table::Users, 200).unwrap();

    let mut dispatcher = Dispatcher {
        registry: &mut registry,
        settings: &settings,
        store: &mut store,
        gate,
    };
    let mut replies = Vec::new();
    let result = handle_updates(response.as_bytes(), tokens, &mut dispatcher, |chat, text| {
        replies.push((chat, text.to_string()))
    });
    (result, replies)
}

// ============================================================================
// Requests
// ============================================================================

#[test]
fn test_get_updates_request() {
    let mut offset = UpdateOffset::new();
    offset.advance(&BatchSummary {
        parsed: 1,
        skipped: 0,
        max_update_id: Some(41),
    });

    let mut out: String<256> = String::new();
    get_updates_request(&mut out, "10.0.0.2", "123:ABC", offset).unwrap();

    assert_eq!(
        out.as_str(),
        "GET /bot123:ABC/getUpdates?offset=42&limit=5 HTTP/1.1\r\n\
         Host: 10.0.0.2\r\n\
         User-Agent: gatekeeper\r\n\
         Connection: close\r\n\r\n"
    );
}

#[test]
fn test_request_too_large() {
    let mut out: String<16> = String::new();
    assert_eq!(
        get_updates_request(&mut out, "host", "token", UpdateOffset::new()),
        Err(BotError::TooLarge)
    );
}

#[test]
fn test_escape_json() {
    let mut out: String<64> = String::new();
    escape_json("say \"hi\"\\\n\tok\u{1}é", &mut out).unwrap();
    assert_eq!(out.as_str(), r#"say \"hi\"\\\n\tok\u0001é"#);

    let mut small: String<4> = String::new();
    assert_eq!(escape_json("\"\"\"", &mut small), Err(BotError::TooLarge));
}

#[test]
fn test_send_message_body_is_valid_json() {
    let mut body: String<1024> = String::new();
    send_message_body(&mut body, -1_001_234, "Status:\n\"closed\"").unwrap();

    assert!(body.starts_with(r#"{"chat_id":-1001234,"text":"Status:\n\"closed\"","#));
    assert!(body.contains(r#""keyboard":[["Open upper gate"],["Open lower gate"],"#));
    assert!(body.ends_with(r#"["Lower gate status"]],"resize_keyboard":true}}"#));

    let mut tokens = [Token::default(); 32];
    let count = tokenize(body.as_bytes(), &mut tokens).unwrap();
    assert_eq!(tokens[0].kind, TokenKind::Object);
    assert_eq!(tokens[0].size, 3);
    assert!(count > 10);
}

#[test]
fn test_send_message_request() {
    let mut body: String<512> = String::new();
    send_message_body(&mut body, 7, "ok").unwrap();
    let mut out: String<1024> = String::new();
    send_message_request(&mut out, "relay", "1:T", &body).unwrap();

    assert!(out.starts_with("POST /bot1:T/sendMessage HTTP/1.1\r\n"));
    assert!(out.contains(&format!("Content-Length: {}\r\n", body.len())));
    assert_eq!(find_body(out.as_bytes()), Some(body.as_bytes()));
}

#[test]
fn test_http_status() {
    assert_eq!(http_status(b"HTTP/1.1 200 OK\r\n\r\n"), Some(200));
    assert_eq!(http_status(b"HTTP/1.1 404 Not Found\r\n"), Some(404));
    assert_eq!(http_status(b"HTTP/1.1 OK\r\n"), None);
    assert_eq!(http_status(b"no line end"), None);
}

// ============================================================================
// Offsets
// ============================================================================

#[test]
fn test_offset_only_moves_forward() {
    let mut offset = UpdateOffset::new();
    let batch = |max| BatchSummary {
        parsed: 1,
        skipped: 0,
        max_update_id: max,
    };

    offset.advance(&batch(Some(10)));
    assert_eq!(offset.get(), 11);
    offset.advance(&batch(Some(5)));
    assert_eq!(offset.get(), 11);
    offset.advance(&batch(None));
    assert_eq!(offset.get(), 11);
}

#[test]
fn test_skip_unreadable_response() {
    let mut offset = UpdateOffset::new();
    let cut = "HTTP/1.1 200 OK\r\n\r\n{\"ok\":true,\"result\":[{\"update_id\" : 77,\"message\":{\"text\":\"aaaa";

    assert!(offset.skip_unreadable(cut.as_bytes()));
    assert_eq!(offset.get(), 78);

    assert!(!offset.skip_unreadable(b"HTTP/1.1 200 OK\r\n\r\n{\"ok\":tr"));
    assert_eq!(offset.get(), 78);
}

#[test]
fn test_recover_after_rejected_batch() {
    let response = http_ok(r#"{"ok":"yes","result":[{"update_id":31,"message":{"text":"/open"}}]}"#);
    let mut tokens = [Token::default(); 32];
    let mut gate = FakeGate::default();

    let (result, replies) = handle(&response, &mut tokens, &mut gate);
    let err = result.unwrap_err();
    assert!(matches!(err, BotError::Parse(ParseError::UnexpectedKind { .. })));
    assert!(replies.is_empty());

    let mut offset = UpdateOffset::new();
    assert!(offset.recover(&err, response.as_bytes()));
    assert_eq!(offset.get(), 32);
}

#[test]
fn test_recover_ignores_transport_errors() {
    let mut offset = UpdateOffset::new();
    let response = b"HTTP/1.1 502 Bad Gateway\r\n\r\n{\"update_id\":5}";

    assert!(!offset.recover(&BotError::Status(502), response));
    assert!(!offset.recover(&BotError::Malformed, response));
    assert_eq!(offset.get(), 0);

    assert!(offset.recover(&BotError::Tokenize(TokenizeError::Invalid { at: 0 }), response));
    assert_eq!(offset.get(), 6);
}

// ============================================================================
// Batch handling
// ============================================================================

#[test]
fn test_handle_updates_replies_per_chat() {
    let response = http_ok(
        r#"{"ok":true,"result":[
            {"update_id":500,"message":{"message_id":1,"from":{"id":200,"first_name":"Ann"},
             "chat":{"id":200,"type":"private"},"text":"/open"}},
            {"update_id":501,"message":{"message_id":2,"from":{"id":300},
             "chat":{"id":-77,"type":"group"},"text":"/start"}},
            {"update_id":502,"message":{"message_id":3,"from":{"id":200},
             "chat":{"id":200},"sticker":{"file_id":"x"}}}
        ]}"#,
    );
    let mut tokens = [Token::default(); 128];
    let mut gate = FakeGate::default();

    let (result, replies) = handle(&response, &mut tokens, &mut gate);

    let summary = result.unwrap();
    assert_eq!(summary.parsed, 3);
    assert_eq!(summary.max_update_id, Some(502));
    assert_eq!(
        replies,
        vec![
            (200, "Lower gate has been opened".to_string()),
            (
                -77,
                "You're not authorized. Contact house committee. Your ID: 300".to_string()
            ),
        ]
    );
    assert_eq!(gate.requests, vec![GateRequest::open(Gate::Lower, 1_500)]);
}

#[test]
fn test_reply_falls_back_to_sender() {
    let response = http_ok(
        r#"{"ok":true,"result":[{"update_id":1,"message":{"from":{"id":200},"text":"/unlock"}}]}"#,
    );
    let mut tokens = [Token::default(); 64];
    let mut gate = FakeGate::default();

    let (_, replies) = handle(&response, &mut tokens, &mut gate);
    assert_eq!(replies, vec![(200, "Gate has been unlocked".to_string())]);
}

#[test]
fn test_handle_rejects_bad_status() {
    let mut tokens = [Token::default(); 16];
    let mut gate = FakeGate::default();

    let (result, replies) = handle(
        "HTTP/1.1 404 Not Found\r\n\r\n{}",
        &mut tokens,
        &mut gate,
    );
    assert_eq!(result, Err(BotError::Status(404)));
    assert!(replies.is_empty());

    let (result, _) = handle("HTTP/1.1 200 OK\r\n", &mut tokens, &mut gate);
    assert_eq!(result, Err(BotError::Malformed));
}

#[test]
fn test_handle_reports_token_overflow() {
    let response = http_ok(r#"{"ok":true,"result":[{"update_id":1,"message":{"text":"/open"}}]}"#);
    let mut tokens = [Token::default(); 4];
    let mut gate = FakeGate::default();

    let (result, _) = handle(&response, &mut tokens, &mut gate);
    assert_eq!(result, Err(BotError::Tokenize(TokenizeError::NoMemory)));
    assert!(gate.requests.is_empty());
}

#[test]
fn test_handle_rejects_not_ok() {
    let response = http_ok(r#"{"ok":false,"error_code":409,"description":"Conflict"}"#);
    let mut tokens = [Token::default(); 16];
    let mut gate = FakeGate::default();

    let (result, _) = handle(&response, &mut tokens, &mut gate);
    assert_eq!(result, Err(BotError::Parse(ParseError::NotOk)));
}
