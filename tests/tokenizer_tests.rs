//! Tests for the allocation-free JSON tokenizer.

use gatekeeper::tokenizer::{tokenize, Token, TokenKind, TokenizeError, MAX_DEPTH};

fn run(json: &str) -> Result<Vec<Token>, TokenizeError> {
    let mut tokens = [Token::default(); 64];
    let count = tokenize(json.as_bytes(), &mut tokens)?;
    Ok(tokens[..count].to_vec())
}

fn text<'a>(json: &'a str, token: &Token) -> &'a str {
    std::str::from_utf8(token.span(json.as_bytes())).unwrap()
}

// ============================================================================
// Structure
// ============================================================================

#[test]
fn test_flat_layout_in_document_order() {
    let json = r#"{"a":1,"b":[true,"x"]}"#;
    let tokens = run(json).unwrap();

    let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        [
            TokenKind::Object,
            TokenKind::String,
            TokenKind::Primitive,
            TokenKind::String,
            TokenKind::Array,
            TokenKind::Primitive,
            TokenKind::String,
        ]
    );

    // Object counts keys, array counts elements, keys own their value.
    assert_eq!(tokens[0].size, 2);
    assert_eq!(tokens[1].size, 1);
    assert_eq!(tokens[3].size, 1);
    assert_eq!(tokens[4].size, 2);
    assert_eq!(tokens[6].size, 0);

    assert_eq!(text(json, &tokens[0]), json);
    assert_eq!(text(json, &tokens[1]), "a");
    assert_eq!(text(json, &tokens[2]), "1");
    assert_eq!(text(json, &tokens[4]), r#"[true,"x"]"#);
    assert_eq!(text(json, &tokens[6]), "x");
}

#[test]
fn test_nested_objects() {
    let json = r#"{"m":{"from":{"id":7},"text":"hi"},"n":null}"#;
    let tokens = run(json).unwrap();

    assert_eq!(tokens.len(), 11);
    assert_eq!(tokens[0].size, 2);
    assert_eq!(tokens[2].kind, TokenKind::Object);
    assert_eq!(tokens[2].size, 2);
    assert_eq!(text(json, &tokens[5]), "id");
    assert_eq!(text(json, &tokens[6]), "7");
    assert_eq!(text(json, &tokens[10]), "null");
}

#[test]
fn test_whitespace_is_ignored() {
    let json = "{\n  \"ok\" : true ,\r\n\t\"result\" : [ ]\n}";
    let tokens = run(json).unwrap();

    assert_eq!(tokens.len(), 5);
    assert_eq!(text(json, &tokens[2]), "true");
    assert_eq!(tokens[4].kind, TokenKind::Array);
    assert_eq!(tokens[4].size, 0);
}

#[test]
fn test_string_keeps_escapes() {
    let json = r#"{"t":"a\"b\\cé"}"#;
    let tokens = run(json).unwrap();

    assert_eq!(text(json, &tokens[2]), r#"a\"b\\cé"#);
}

#[test]
fn test_negative_and_float_numbers() {
    let json = r#"[-1001234567890,1.5e3]"#;
    let tokens = run(json).unwrap();

    assert_eq!(text(json, &tokens[1]), "-1001234567890");
    assert_eq!(text(json, &tokens[2]), "1.5e3");
}

#[test]
fn test_buffer_is_not_modified() {
    let json = br#"{"a":"b\nc"}"#.to_vec();
    let copy = json.clone();
    let mut tokens = [Token::default(); 8];
    tokenize(&json, &mut tokens).unwrap();
    assert_eq!(json, copy);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_not_enough_tokens() {
    let mut tokens = [Token::default(); 3];
    let result = tokenize(br#"{"a":1,"b":2}"#, &mut tokens);
    assert_eq!(result, Err(TokenizeError::NoMemory));
}

#[test]
fn test_truncated_document() {
    assert_eq!(run(r#"{"a":1"#), Err(TokenizeError::Partial));
    assert_eq!(run(r#"{"a":"xy"#), Err(TokenizeError::Partial));
    assert_eq!(run(r#"[1,2"#), Err(TokenizeError::Partial));
    assert_eq!(run(r#"{"a":"\u00"#), Err(TokenizeError::Partial));
}

#[test]
fn test_missing_colon_is_invalid() {
    assert!(matches!(run(r#"{"a" 1}"#), Err(TokenizeError::Invalid { .. })));
}

#[test]
fn test_non_string_key_is_invalid() {
    assert!(matches!(run(r#"{1:2}"#), Err(TokenizeError::Invalid { .. })));
}

#[test]
fn test_mismatched_bracket_is_invalid() {
    assert_eq!(run("[1}"), Err(TokenizeError::Invalid { at: 2 }));
    assert_eq!(run("]"), Err(TokenizeError::Invalid { at: 0 }));
}

#[test]
fn test_key_without_value_is_invalid() {
    assert!(matches!(run(r#"{"a":}"#), Err(TokenizeError::Invalid { .. })));
}

#[test]
fn test_bad_escape_is_invalid() {
    assert!(matches!(run(r#"["\q"]"#), Err(TokenizeError::Invalid { .. })));
    assert!(matches!(run(r#"["\u12g4"]"#), Err(TokenizeError::Invalid { .. })));
}

#[test]
fn test_nesting_limit() {
    let ok = "[".repeat(MAX_DEPTH) + &"]".repeat(MAX_DEPTH);
    assert!(run(&ok).is_ok());

    let deep = "[".repeat(MAX_DEPTH + 1) + &"]".repeat(MAX_DEPTH + 1);
    assert_eq!(run(&deep), Err(TokenizeError::TooDeep));
}
