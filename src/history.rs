//! The public history API.
//!
//! [`History`] fronts one concrete backend, selected by name at open time.
//! The façade owns what is common to every backend: the negative-lookup
//! cache and its statistics, the handle-scoped error string, and the
//! external server pause/resume hooks used while the database is rebuilt.

use std::path::Path;

use bitflags::bitflags;

use crate::error::{HistoryError, Result};
use crate::msgid::MessageIdHash;
use crate::textlog;
use crate::token::Token;

pub mod cache;

use cache::{CacheAnswer, LookupCache};

bitflags! {
    /// Flags accepted by [`History::open`]. The empty set opens read-only.
    pub struct OpenFlags: u32 {
        /// Open read/write.
        const RDWR = 1 << 0;
        /// Create the database on open.
        const CREAT = 1 << 1;
        /// Hint: keep the index on disk.
        const ONDISK = 1 << 2;
        /// Hint: keep the index in core until flushed.
        const INCORE = 1 << 3;
        /// Hint: memory-map the index.
        const MMAP = 1 << 4;
    }
}

/// Cache statistics, reset by [`History::stats`] and [`History::set_cache`].
///
/// Each `check` call bumps exactly one counter: a cached positive or
/// negative answer (`hitpos`, `hitneg`), or an index-confirmed positive or
/// negative on a cache miss (`misses`, `dne`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub hitpos: u64,
    pub hitneg: u64,
    pub misses: u64,
    pub dne: u64,
}

/// A record for a stored article. Sub-fields the record did not carry are
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub arrived: u64,
    pub posted: u64,
    pub expires: u64,
    pub token: Token,
}

/// Control requests understood by [`History::ctl`].
#[derive(Debug, Clone, Copy)]
pub enum Ctl<'a> {
    /// Supply the database path to a handle opened without one. Fails once
    /// a path is set.
    SetPath(&'a Path),
    /// How many index stores may be outstanding before an automatic sync;
    /// zero never syncs automatically.
    SetSyncCount(usize),
    /// Sizing hint: expected number of pairs when the database is created
    /// or rebuilt. Zero means no hint.
    SetPairsHint(usize),
    /// Ignore the old database's size during expire and size from scratch.
    SetIgnoreOld(bool),
    /// Seconds between rotation checks on the read side; zero disables
    /// them.
    SetStatInterval(u64),
}

/// Hooks into the surrounding server, invoked while a walk or expire
/// drains in-flight writers. Installed with
/// [`History::set_server_control`].
pub trait ServerControl {
    fn pause(&mut self, reason: &str) -> anyhow::Result<()>;
    fn resume(&mut self, reason: &str) -> anyhow::Result<()>;
}

/// One concrete history storage method.
pub trait HistoryBackend {
    fn close(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn lookup(&mut self, key: &str) -> Result<Option<HistoryEntry>>;
    fn check(&mut self, key: &str) -> Result<bool>;
    fn write(
        &mut self,
        key: &str,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: Option<&Token>,
    ) -> Result<()>;
    fn remember(&mut self, key: &str, arrived: u64) -> Result<()>;
    fn replace(
        &mut self,
        key: &str,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: Option<&Token>,
    ) -> Result<()>;
    fn walk(
        &mut self,
        reason: Option<&str>,
        server: Option<&mut dyn ServerControl>,
        callback: &mut dyn FnMut(u64, u64, u64, Option<&Token>) -> bool,
    ) -> Result<()>;
    fn expire(
        &mut self,
        path: Option<&Path>,
        reason: Option<&str>,
        writing: bool,
        threshold: u64,
        server: Option<&mut dyn ServerControl>,
        keep: &mut dyn FnMut(u64, u64, u64, &mut Token) -> bool,
    ) -> Result<()>;
    fn ctl(&mut self, req: Ctl) -> Result<()>;
    fn path(&self) -> Option<&Path>;
}

type OpenFn = fn(Option<&Path>, OpenFlags) -> Result<Box<dyn HistoryBackend>>;

/// Backend registry, keyed by method name.
const METHODS: &[(&str, OpenFn)] = &[(textlog::METHOD_NAME, textlog::TextLog::open_boxed)];

/// An open history database.
pub struct History {
    backend: Box<dyn HistoryBackend>,
    cache: LookupCache,
    stats: HistoryStats,
    error: Option<String>,
    server: Option<Box<dyn ServerControl>>,
    closed: bool,
}

impl History {
    /// Open the database at `path` with the storage method named `method`.
    ///
    /// With `path` of `None` the handle is created dormant; set sizing
    /// hints through [`History::ctl`], then supply [`Ctl::SetPath`] to
    /// bring it up. The new handle has no cache; see
    /// [`History::set_cache`].
    pub fn open(path: Option<&Path>, method: &str, flags: OpenFlags) -> Result<History> {
        let open_fn = METHODS
            .iter()
            .find(|(name, _)| *name == method)
            .map(|(_, open_fn)| *open_fn)
            .ok_or_else(|| {
                let err = HistoryError::UnknownMethod(method.to_string());
                log::warn!("{}", err);
                err
            })?;
        let backend = open_fn(path, flags)?;
        Ok(History {
            backend,
            cache: LookupCache::disabled(),
            stats: HistoryStats::default(),
            error: None,
            server: None,
            closed: false,
        })
    }

    /// Close the database. Consumes the handle; a failure still releases
    /// everything that could be released.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self.backend.close();
        if let Err(err) = &result {
            self.note_error(err);
        }
        result
    }

    /// Flush buffered appends, and index dirt when this handle owns the
    /// index.
    pub fn sync(&mut self) -> Result<()> {
        let result = self.backend.sync();
        self.record(result)
    }

    /// Find the record for `key`, provided it carries a token: a stored
    /// article. Remembered identifiers and unknown ones give `Ok(None)`.
    pub fn lookup(&mut self, key: &str) -> Result<Option<HistoryEntry>> {
        let result = self.backend.lookup(key);
        self.record(result)
    }

    /// Has `key` ever been seen, remembered identifiers included? Answers
    /// from the cache when possible, the index otherwise.
    pub fn check(&mut self, key: &str) -> Result<bool> {
        let hash = MessageIdHash::of_message_id(key);
        match self.cache.lookup(&hash) {
            CacheAnswer::Hit => {
                self.stats.hitpos += 1;
                Ok(true)
            }
            CacheAnswer::Miss => {
                self.stats.hitneg += 1;
                Ok(false)
            }
            CacheAnswer::Unknown => {
                let result = self.backend.check(key);
                let found = self.record(result)?;
                self.cache.add(&hash, found);
                if found {
                    self.stats.misses += 1;
                } else {
                    self.stats.dne += 1;
                }
                Ok(found)
            }
        }
    }

    /// Record that the article for `key` arrived at `arrived` and is
    /// stored at `token`. A hash the index already knows is reported as
    /// success and logged; its log line stays orphaned until the next
    /// rebuild.
    pub fn write(
        &mut self,
        key: &str,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: &Token,
    ) -> Result<()> {
        let result = self.backend.write(key, arrived, posted, expires, Some(token));
        let result = self.record(result);
        if result.is_ok() {
            self.cache.add(&MessageIdHash::of_message_id(key), true);
        }
        result
    }

    /// Record `key` with no article body: a tombstone that keeps the
    /// identifier recognized after the article is gone.
    pub fn remember(&mut self, key: &str, arrived: u64) -> Result<()> {
        let result = self.backend.remember(key, arrived);
        let result = self.record(result);
        if result.is_ok() {
            self.cache.add(&MessageIdHash::of_message_id(key), true);
        }
        result
    }

    /// Overwrite `key`'s record in place, space-padding any slack; the new
    /// encoding must not be longer than the old. `None` blanks the token,
    /// downgrading the record to a tombstone.
    pub fn replace(
        &mut self,
        key: &str,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: Option<&Token>,
    ) -> Result<()> {
        let result = self.backend.replace(key, arrived, posted, expires, token);
        let result = self.record(result);
        if result.is_ok() {
            self.cache.add(&MessageIdHash::of_message_id(key), true);
        }
        result
    }

    /// Stream every record through `callback` in log order. The callback
    /// returning `false` aborts the walk as a failure. With a `reason`,
    /// the server is paused at end-of-file and stragglers are collected.
    pub fn walk<F>(&mut self, reason: Option<&str>, mut callback: F) -> Result<()>
    where
        F: FnMut(u64, u64, u64, Option<&Token>) -> bool,
    {
        let server: Option<&mut dyn ServerControl> = match &mut self.server {
            Some(server) => Some(server.as_mut()),
            None => None,
        };
        let result = self.backend.walk(reason, server, &mut callback);
        self.record(result)
    }

    /// Rebuild the database, keeping records `keep` approves of,
    /// tombstoning rejected records that arrived at or after `threshold`,
    /// and dropping the rest. See the crate documentation for the full
    /// protocol.
    pub fn expire<F>(
        &mut self,
        path: Option<&Path>,
        reason: Option<&str>,
        writing: bool,
        threshold: u64,
        mut keep: F,
    ) -> Result<()>
    where
        F: FnMut(u64, u64, u64, &mut Token) -> bool,
    {
        let server: Option<&mut dyn ServerControl> = match &mut self.server {
            Some(server) => Some(server.as_mut()),
            None => None,
        };
        let result = self.backend.expire(
            path,
            reason,
            writing,
            threshold,
            server,
            &mut keep,
        );
        self.record(result)
    }

    /// Size the negative-lookup cache to roughly `bytes` bytes (zero frees
    /// it) and reset the statistics.
    pub fn set_cache(&mut self, bytes: usize) {
        self.cache = if bytes == 0 { LookupCache::disabled() } else { LookupCache::sized(bytes) };
        self.stats = HistoryStats::default();
    }

    /// Current statistics; resets the counters.
    pub fn stats(&mut self) -> HistoryStats {
        std::mem::take(&mut self.stats)
    }

    /// The last error recorded on this handle.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.backend.path()
    }

    pub fn ctl(&mut self, req: Ctl) -> Result<()> {
        let result = self.backend.ctl(req);
        self.record(result)
    }

    /// Install (or remove) the server pause/resume hooks used by walk and
    /// expire.
    pub fn set_server_control(&mut self, server: Option<Box<dyn ServerControl>>) {
        self.server = server;
    }

    fn note_error(&mut self, err: &HistoryError) {
        let message = err.to_string();
        log::warn!("{}", message);
        self.error = Some(message);
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.note_error(err);
        }
        result
    }
}

impl Drop for History {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.backend.close() {
                log::warn!("history close on drop failed: {}", err);
            }
        }
    }
}
