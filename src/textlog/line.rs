//! The history line codec.
//!
//! One record per LF-terminated ASCII line:
//!
//! ```text
//! [hash32] TAB arrived [~ expires|-] [~ posted [TAB token]] LF
//! ```
//!
//! `arrived` is required; a line that stops there is a tombstone for an
//! identifier whose article is gone (or never existed). Trailing spaces
//! before the newline are padding left behind by an in-place replacement
//! and carry no meaning.

use crate::msgid::{MessageIdHash, HASH_TEXT_LEN};
use crate::token::Token;

/// A line including its newline never reaches this length.
pub const MAX_LINE: usize = 137;

/// The shortest well-formed line: bracketed hash, separator, one digit,
/// newline.
pub const MIN_LINE: usize = 37;

pub const FIELD_SEP: u8 = b'\t';
pub const SUBFIELD_SEP: u8 = b'~';
pub const NO_EXPIRY: u8 = b'-';

/// A decoded history line. `None` sub-fields were absent from the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLine {
    pub hash: MessageIdHash,
    pub arrived: u64,
    pub expires: Option<u64>,
    pub posted: Option<u64>,
    pub token: Option<Token>,
}

/// Encode one record, newline included. `None` if the result would not fit
/// in `MAX_LINE`.
pub fn format_line(
    hash: &MessageIdHash,
    arrived: u64,
    posted: u64,
    expires: u64,
    token: Option<&Token>,
) -> Option<String> {
    let line = match token {
        None => format!("[{}]\t{}~-\n", hash.to_text(), arrived),
        Some(token) if expires == 0 => format!(
            "[{}]\t{}~-~{}\t{}\n",
            hash.to_text(),
            arrived,
            posted,
            token.to_text()
        ),
        Some(token) => format!(
            "[{}]\t{}~{}~{}\t{}\n",
            hash.to_text(),
            arrived,
            expires,
            posted,
            token.to_text()
        ),
    };
    if line.len() >= MAX_LINE {
        None
    } else {
        Some(line)
    }
}

/// Decode one record. `line` excludes the trailing newline. On failure the
/// returned string describes what was wrong, for the caller to wrap with the
/// file location.
pub fn split_line(line: &[u8]) -> Result<HistoryLine, &'static str> {
    // replacement padding
    let mut line = line;
    while line.last() == Some(&b' ') {
        line = &line[..line.len() - 1];
    }

    if line.first() != Some(&b'[') {
        return Err("`[' missing from history line");
    }
    if line.len() < HASH_TEXT_LEN + 2 || line[HASH_TEXT_LEN + 1] != b']' {
        return Err("`]' missing from history line");
    }
    let hash_text =
        std::str::from_utf8(&line[1..HASH_TEXT_LEN + 1]).map_err(|_| "bad hash in history line")?;
    let hash = MessageIdHash::from_text(hash_text).ok_or("bad hash in history line")?;

    let mut rest = &line[HASH_TEXT_LEN + 2..];
    if rest.first() != Some(&FIELD_SEP) {
        return Err("field separator missing from history line");
    }
    rest = &rest[1..];

    let (arrived, tail) = take_number(rest).ok_or("arrived timestamp out of range")?;
    rest = tail;

    let mut expires = None;
    let mut posted = None;
    if rest.first() == Some(&SUBFIELD_SEP) {
        rest = &rest[1..];
        if rest.first() == Some(&NO_EXPIRY) {
            rest = &rest[1..];
        } else {
            let (value, tail) = take_number(rest).ok_or("expires timestamp out of range")?;
            expires = Some(value);
            rest = tail;
        }
        if rest.first() == Some(&SUBFIELD_SEP) {
            rest = &rest[1..];
            let (value, tail) = take_number(rest).ok_or("posted timestamp out of range")?;
            posted = Some(value);
            rest = tail;
        }
    }

    let token = if rest.first() == Some(&FIELD_SEP) {
        let text = std::str::from_utf8(&rest[1..]).map_err(|_| "bad token in history line")?;
        if text.is_empty() {
            // token blanked in place by pruning
            None
        } else {
            Some(Token::from_text(text).ok_or("bad token in history line")?)
        }
    } else if rest.is_empty() {
        None
    } else {
        return Err("field separator missing from history line");
    };

    Ok(HistoryLine { hash, arrived, expires, posted, token })
}

/// A run of leading decimal digits as a u64, and whatever follows it.
fn take_number(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let mut value: u64 = 0;
    for &b in &bytes[..digits] {
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some((value, &bytes[digits..]))
}
