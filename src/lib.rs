//! Message-identifier history database for a Usenet news server.
//!
//! The history database answers "have I seen this article before?" on the
//! ingress path. It is a pair of files kept in lockstep: an append-only text
//! log holding one record per message-identifier, and a persistent hash
//! index (`dbz`) mapping the 128-bit identifier hash to the byte offset of
//! the corresponding log line. A small in-process cache accelerates the
//! negative lookups that dominate ingress traffic, and an expire engine
//! rebuilds the database in place while the server keeps running.
//!
//! The [`history::History`] façade is the public entry point; the log
//! backend lives in [`textlog`] and the index in [`dbz`].

pub mod dbz;
pub mod error;
pub mod history;
pub mod msgid;
pub mod textlog;
pub mod token;
pub mod tools;

pub use error::{HistoryError, Result};
pub use history::{Ctl, History, HistoryEntry, HistoryStats, OpenFlags, ServerControl};
pub use msgid::MessageIdHash;
pub use token::Token;
