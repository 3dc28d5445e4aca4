//! Message-identifier hashing.
//!
//! A message-identifier is case-folded and digested down to a 128-bit value;
//! everything above this module deals only in the digest. The printable form
//! is the 32 lowercase hex characters that appear between `[` and `]` at the
//! start of every history line.

use std::fmt;
use std::fmt::Write as _;

use openssl::hash::{hash, MessageDigest};

/// Size of a message-identifier hash in bytes.
pub const HASH_SIZE: usize = 16;

/// Length of the printable hex form.
pub const HASH_TEXT_LEN: usize = 2 * HASH_SIZE;

/// 128-bit digest of a canonicalized message-identifier.
///
/// Equality is bytewise; two identifiers differing only in ASCII case hash
/// identically.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageIdHash([u8; HASH_SIZE]);

impl MessageIdHash {
    /// Hash a message-identifier.
    pub fn of_message_id(key: &str) -> Self {
        let folded: Vec<u8> = key.bytes().map(|b| b.to_ascii_lowercase()).collect();
        let digest = hash(MessageDigest::md5(), &folded).expect("md5 is always available");
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&digest);
        MessageIdHash(bytes)
    }

    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        MessageIdHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// The 32-character lowercase hex form used inside the log.
    pub fn to_text(&self) -> String {
        let mut text = String::with_capacity(HASH_TEXT_LEN);
        for byte in &self.0 {
            write!(text, "{:02x}", byte).expect("writing to a String");
        }
        text
    }

    /// Parse the printable form; `None` unless it is exactly 32 hex chars.
    pub fn from_text(text: &str) -> Option<Self> {
        if text.len() != HASH_TEXT_LEN || !text.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; HASH_SIZE];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(MessageIdHash(bytes))
    }
}

impl fmt::Debug for MessageIdHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MessageIdHash({})", self.to_text())
    }
}
