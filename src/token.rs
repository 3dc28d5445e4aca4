//! Storage tokens.
//!
//! A token names where an article body lives in the storage subsystem. The
//! history database treats it as opaque: a storage method byte, a storage
//! class byte and 16 payload bytes, carried through the log in a fixed-width
//! printable form so lines stay greppable.

use std::fmt;
use std::fmt::Write as _;

/// Bytes of opaque payload inside a token.
pub const TOKEN_PAYLOAD: usize = 16;

/// Length of the printable form: `@`, 36 hex digits, `@`.
pub const TOKEN_TEXT_LEN: usize = 2 * (TOKEN_PAYLOAD + 2) + 2;

/// Opaque identifier for a stored article body.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub storage_type: u8,
    pub class: u8,
    pub data: [u8; TOKEN_PAYLOAD],
}

impl Token {
    pub fn new(storage_type: u8, class: u8, data: [u8; TOKEN_PAYLOAD]) -> Self {
        Token { storage_type, class, data }
    }

    /// The printable form written into the log.
    pub fn to_text(&self) -> String {
        let mut text = String::with_capacity(TOKEN_TEXT_LEN);
        text.push('@');
        write!(text, "{:02x}{:02x}", self.storage_type, self.class).unwrap();
        for byte in &self.data {
            write!(text, "{:02x}", byte).unwrap();
        }
        text.push('@');
        text
    }

    /// Parse the printable form; `None` unless `is_token_text` holds.
    pub fn from_text(text: &str) -> Option<Token> {
        if !is_token_text(text) {
            return None;
        }
        let hex = &text.as_bytes()[1..TOKEN_TEXT_LEN - 1];
        let mut bytes = [0u8; TOKEN_PAYLOAD + 2];
        for (i, chunk) in hex.chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        let mut data = [0u8; TOKEN_PAYLOAD];
        data.copy_from_slice(&bytes[2..]);
        Some(Token { storage_type: bytes[0], class: bytes[1], data })
    }
}

/// Whether `text` has the shape of a token.
///
/// Remembered lines have no token at all, and a pruned line has had its
/// token blanked in place, so callers use this to tell "article stored"
/// from "identifier merely remembered".
pub fn is_token_text(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == TOKEN_TEXT_LEN
        && bytes[0] == b'@'
        && bytes[TOKEN_TEXT_LEN - 1] == b'@'
        && bytes[1..TOKEN_TEXT_LEN - 1].iter().all(u8::is_ascii_hexdigit)
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Token({})", self.to_text())
    }
}
