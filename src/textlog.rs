//! The text-log history backend.
//!
//! Records live in an append-only ASCII log; a [`crate::dbz`] index maps
//! each identifier hash to its line's byte offset. The backend keeps three
//! handles on the database: a read descriptor for positional line fetches,
//! an append writer whose end offset is cached so every successful append
//! knows where its line landed, and (when this handle owns it) the index.
//!
//! A dev/inode snapshot of the log is kept so long-lived read-only handles
//! notice when an out-of-band rebuild has been renamed into place, and
//! reopen themselves.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::dbz::{self, Dbz, DbzOptions, Residency, StoreOutcome};
use crate::error::{HistoryError, Location, Result};
use crate::history::{Ctl, HistoryBackend, HistoryEntry, OpenFlags, ServerControl};
use crate::msgid::MessageIdHash;
use crate::token::Token;

pub mod expire;
pub mod line;

pub use line::{MAX_LINE, MIN_LINE};

/// Name this backend registers under in the method table.
pub const METHOD_NAME: &str = "textlog";

/// Sizing hint for the index, set through the control surface. `Ignore`
/// makes expire size the new index from scratch instead of cloning the old
/// table's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairsHint {
    None,
    Ignore,
    Hint(u64),
}

pub struct TextLog {
    path: Option<PathBuf>,
    flags: OpenFlags,
    writer: Option<BufWriter<File>>,
    /// End offset of the log as seen through `writer`.
    offset: u64,
    reader: Option<File>,
    dbz: Option<Dbz>,
    stat_interval: u64,
    next_check: u64,
    sync_count: u64,
    dirty: u64,
    pairs: PairsHint,
    snapshot: Option<(u64, u64)>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_stale_io(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESTALE)
}

impl TextLog {
    /// Open the database at `path`. With no path the handle stays dormant
    /// until one arrives through [`Ctl::SetPath`]; sizing hints set in
    /// between take effect when the database is then created.
    pub fn open(path: Option<&Path>, flags: OpenFlags) -> Result<TextLog> {
        let mut log = TextLog {
            path: path.map(Path::to_owned),
            flags,
            writer: None,
            offset: 0,
            reader: None,
            dbz: None,
            stat_interval: 0,
            next_check: 0,
            sync_count: 0,
            dirty: 0,
            pairs: PairsHint::None,
            snapshot: None,
        };
        if log.path.is_some() {
            if let Err(err) = log.reopen() {
                let _ = log.close_files();
                return Err(err);
            }
        }
        Ok(log)
    }

    pub(crate) fn open_boxed(
        path: Option<&Path>,
        flags: OpenFlags,
    ) -> Result<Box<dyn HistoryBackend>> {
        Ok(Box::new(TextLog::open(path, flags)?))
    }

    fn require_path(&self) -> Result<&Path> {
        self.path.as_deref().ok_or(HistoryError::BadHandle)
    }

    fn dbz_options(&self) -> DbzOptions {
        if self.flags.contains(OpenFlags::INCORE) {
            // rebuild in memory, one big write at sync time
            DbzOptions {
                writethrough: false,
                idx_residency: Residency::Mem,
                exists_residency: Residency::Mem,
                nonblock: false,
            }
        } else {
            let residency = if self.flags.contains(OpenFlags::MMAP) {
                Residency::Mmap
            } else {
                Residency::Disk
            };
            DbzOptions {
                writethrough: true,
                idx_residency: residency,
                exists_residency: residency,
                nonblock: false,
            }
        }
    }

    /// (Re)open the log descriptors and, when nobody else holds it, the
    /// index. Assumes path and flags are in place.
    fn reopen(&mut self) -> Result<()> {
        let path = self.require_path()?.to_owned();

        if self.flags.contains(OpenFlags::RDWR) {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true);
            if self.flags.contains(OpenFlags::CREAT) {
                opts.truncate(true);
            }
            let file = opts.open(&path).map_err(|err| {
                HistoryError::io("can't open history", &path, Location::None, err)
            })?;
            // every append goes through our cached end offset, so take it
            // from the file once here
            let end = file.metadata().map_err(|err| {
                HistoryError::io("can't stat history", &path, Location::None, err)
            })?;
            self.offset = end.len();
            self.writer = Some(BufWriter::new(file));
        }

        let reader = OpenOptions::new().read(true).open(&path).map_err(|err| {
            let _ = self.close_files();
            HistoryError::io("can't open history", &path, Location::None, err)
        })?;
        self.reader = Some(reader);

        self.snapshot = match nix::sys::stat::stat(&path) {
            Ok(st) => Some((st.st_dev as u64, st.st_ino as u64)),
            Err(_) => None,
        };

        if self.dbz.is_none() && !dbz::in_use() {
            let options = self.dbz_options();
            let opened = if self.flags.contains(OpenFlags::CREAT) {
                let npairs = match self.pairs {
                    PairsHint::Hint(n) => n,
                    PairsHint::None | PairsHint::Ignore => 0,
                };
                Dbz::fresh(&path, dbz::size(npairs), options)
            } else {
                Dbz::init(&path, options)
            };
            match opened {
                Ok(d) => self.dbz = Some(d),
                Err(err) => {
                    let _ = self.close_files();
                    return Err(err);
                }
            }
        }
        // create only once; later reopens append to what's there
        self.flags.remove(OpenFlags::CREAT);

        self.next_check = now_secs() + self.stat_interval;
        Ok(())
    }

    /// Close everything, keeping the handle reopenable. Reports the first
    /// failure but always releases the resources.
    fn close_files(&mut self) -> Result<()> {
        let mut first_err: Option<HistoryError> = None;

        if self.writer.is_some() {
            if let Err(err) = self.flush_writer() {
                first_err.get_or_insert(err);
            }
        }
        if let Some(dbz) = self.dbz.take() {
            if let Err(err) = dbz.close() {
                first_err.get_or_insert(err);
            }
        }
        self.writer = None;
        self.reader = None;
        self.offset = 0;
        self.dirty = 0;
        self.next_check = 0;
        self.snapshot = None;

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn flush_writer(&mut self) -> Result<()> {
        let path = self.require_path()?.to_owned();
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|err| {
                HistoryError::io("error on history", &path, Location::None, err)
            })?;
        }
        Ok(())
    }

    /// Close and reopen after the underlying files went away (rotation or a
    /// stale NFS handle).
    fn recover_files(&mut self) -> Result<()> {
        let _ = self.close_files();
        match self.reopen() {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.close_files();
                Err(err)
            }
        }
    }

    /// Rotation watchdog: when the stat interval has elapsed, compare the
    /// log's dev/inode against the snapshot and reopen everything if an
    /// out-of-band rebuild has been renamed into place.
    fn check_files(&mut self) -> Result<()> {
        if self.stat_interval == 0 {
            return Ok(());
        }
        if self.reader.is_none() {
            // a previous rotation failed to reopen the handles
            return self.recover_files();
        }
        let now = now_secs();
        if now >= self.next_check {
            let path = self.require_path()?.to_owned();
            if let Ok(st) = nix::sys::stat::stat(&path) {
                let current = (st.st_dev as u64, st.st_ino as u64);
                if self.snapshot != Some(current) {
                    log::debug!("history {} replaced, reopening", path.display());
                    self.recover_files()?;
                }
            }
            self.next_check = now + self.stat_interval;
        }
        Ok(())
    }

    fn dbz_ref(&self) -> Result<&Dbz> {
        match &self.dbz {
            Some(dbz) => Ok(dbz),
            None => Err(HistoryError::IndexNotOwned { path: self.require_path()?.to_owned() }),
        }
    }

    /// Fetch the raw line for `hash` (newline stripped) and its offset.
    /// `Ok(None)` when the index has no entry. Retries once through a
    /// reopen when the files have gone stale underneath us.
    fn fetch_line(&mut self, hash: &MessageIdHash) -> Result<Option<(Vec<u8>, u64)>> {
        let path = self.require_path()?.to_owned();
        if self.dbz.is_none() {
            return Err(HistoryError::IndexNotOwned { path });
        }
        if self.flags.contains(OpenFlags::RDWR | OpenFlags::INCORE) {
            // may be reading back appends still sitting in the writer
            self.flush_writer()?;
        }

        let mut stale_retried = false;
        loop {
            let fetched = self.dbz_ref()?.fetch(hash);
            let offset = match fetched {
                Ok(Some(offset)) => offset,
                Ok(None) => return Ok(None),
                Err(err) => {
                    if !stale_retried && err.is_stale() {
                        stale_retried = true;
                        self.recover_files()?;
                        continue;
                    }
                    return Err(err);
                }
            };

            let mut buf = vec![0u8; MAX_LINE];
            let read = {
                let reader = self.reader.as_ref().ok_or(HistoryError::BadHandle)?;
                reader.read_at(&mut buf, offset)
            };
            match read {
                Ok(n) => {
                    if n < MIN_LINE {
                        return Err(HistoryError::Parse {
                            reason: "line too short in history",
                            path,
                            location: Location::Offset(offset),
                        });
                    }
                    let newline = match buf[..n].iter().position(|&b| b == b'\n') {
                        Some(pos) => pos,
                        None => {
                            return Err(HistoryError::Parse {
                                reason: "can't locate end of line in history",
                                path,
                                location: Location::Offset(offset),
                            })
                        }
                    };
                    buf.truncate(newline);
                    return Ok(Some((buf, offset)));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !stale_retried && is_stale_io(&err) {
                        stale_retried = true;
                        self.recover_files()?;
                        continue;
                    }
                    return Err(HistoryError::io(
                        "can't read history",
                        &path,
                        Location::Offset(offset),
                        err,
                    ));
                }
            }
        }
    }

    fn lookup(&mut self, key: &str) -> Result<Option<HistoryEntry>> {
        if let Err(err) = self.check_files() {
            log::warn!("history rotation check failed: {}", err);
        }
        let hash = MessageIdHash::of_message_id(key);
        let (buf, offset) = match self.fetch_line(&hash)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let parsed = line::split_line(&buf).map_err(|reason| HistoryError::Parse {
            reason,
            path: self.path.clone().unwrap_or_default(),
            location: Location::Offset(offset),
        })?;
        // only a record carrying a token counts as a stored article
        Ok(parsed.token.map(|token| HistoryEntry {
            arrived: parsed.arrived,
            posted: parsed.posted.unwrap_or(0),
            expires: parsed.expires.unwrap_or(0),
            token,
        }))
    }

    fn check(&mut self, key: &str) -> Result<bool> {
        let path = self.require_path()?.to_owned();
        if self.dbz.is_none() {
            return Err(HistoryError::IndexNotOwned { path });
        }
        if let Err(err) = self.check_files() {
            log::warn!("history rotation check failed: {}", err);
        }
        let hash = MessageIdHash::of_message_id(key);
        self.dbz_ref()?.exists(&hash)
    }

    /// Append one record and register it in the index. A hash the index has
    /// already seen is logged and reported as success; its fresh log line
    /// is orphaned until the next rebuild collects it.
    pub(crate) fn write_line(
        &mut self,
        hash: &MessageIdHash,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: Option<&Token>,
    ) -> Result<()> {
        let path = self.require_path()?.to_owned();
        if self.dbz.is_none() {
            return Err(HistoryError::IndexNotOwned { path });
        }
        if !self.flags.contains(OpenFlags::RDWR) {
            return Err(HistoryError::ReadOnly { path });
        }

        let text = line::format_line(hash, arrived, posted, expires, token)
            .ok_or(HistoryError::Format { path: path.clone() })?;
        let flush_now = !self.flags.contains(OpenFlags::INCORE);
        let offset = self.offset;

        let writer = self.writer.as_mut().ok_or(HistoryError::BadHandle)?;
        let mut appended = writer.write_all(text.as_bytes());
        if appended.is_ok() && flush_now {
            appended = writer.flush();
        }
        if let Err(err) = appended {
            // the line may be half-written; resync the cached end offset
            // with whatever actually reached the file
            let end = writer.get_ref().metadata().map(|m| m.len()).unwrap_or(offset);
            self.offset = end;
            return Err(HistoryError::io(
                "can't write history",
                &path,
                Location::Offset(offset),
                err,
            ));
        }
        self.offset += text.len() as u64;

        let stored = match self.dbz.as_mut() {
            Some(dbz) => dbz.store(hash, offset),
            None => Err(HistoryError::IndexNotOwned { path: path.clone() }),
        };
        match stored {
            Ok(StoreOutcome::Ok) => {}
            Ok(StoreOutcome::Exists) => {
                log::warn!(
                    "duplicate message-id [{}] in history {}@{}",
                    hash.to_text(),
                    path.display(),
                    offset
                );
            }
            Err(err) => return Err(err),
        }

        if self.sync_count != 0 {
            self.dirty += 1;
            if self.dirty >= self.sync_count {
                self.sync()?;
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.writer.is_some() {
            let path = self.require_path()?.to_owned();
            self.flush_writer()?;
            if let Some(writer) = &self.writer {
                writer.get_ref().sync_data().map_err(|err| {
                    HistoryError::io("can't sync history", &path, Location::None, err)
                })?;
            }
            if let Some(dbz) = self.dbz.as_mut() {
                dbz.sync()?;
            }
            self.dirty = 0;
        }
        Ok(())
    }

    fn replace(
        &mut self,
        key: &str,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: Option<&Token>,
    ) -> Result<()> {
        let path = self.require_path()?.to_owned();
        if !self.flags.contains(OpenFlags::RDWR) {
            return Err(HistoryError::ReadOnly { path });
        }

        let hash = MessageIdHash::of_message_id(key);
        let (old, offset) = match self.fetch_line(&hash)? {
            Some(found) => found,
            None => return Err(HistoryError::NotFound { path }),
        };

        let text = line::format_line(&hash, arrived, posted, expires, token)
            .ok_or(HistoryError::Format { path: path.clone() })?;
        let mut new = text.into_bytes();
        // the newline already on disk stays; compare and write the content
        // in front of it
        new.pop();
        if new.len() > old.len() {
            return Err(HistoryError::ReplaceTooLong { path, offset });
        }
        // space-fill the trailing slack so the line keeps its length and
        // the index offset stays valid
        new.resize(old.len(), b' ');

        let writer = self.writer.as_ref().ok_or(HistoryError::BadHandle)?;
        writer.get_ref().write_all_at(&new, offset).map_err(|err| {
            HistoryError::io("can't write history", &path, Location::Offset(offset), err)
        })?;
        Ok(())
    }

    fn ctl(&mut self, req: Ctl) -> Result<()> {
        match req {
            Ctl::SetPath(path) => {
                if self.path.is_some() {
                    return Err(HistoryError::PathAlreadySet);
                }
                self.path = Some(path.to_owned());
                if let Err(err) = self.reopen() {
                    let _ = self.close_files();
                    self.path = None;
                    return Err(err);
                }
                Ok(())
            }
            Ctl::SetSyncCount(count) => {
                self.sync_count = count as u64;
                Ok(())
            }
            Ctl::SetPairsHint(npairs) => {
                self.pairs = if npairs == 0 { PairsHint::None } else { PairsHint::Hint(npairs as u64) };
                Ok(())
            }
            Ctl::SetIgnoreOld(ignore) => {
                match (self.pairs, ignore) {
                    (PairsHint::None, true) => self.pairs = PairsHint::Ignore,
                    (PairsHint::Ignore, false) => self.pairs = PairsHint::None,
                    _ => {}
                }
                Ok(())
            }
            Ctl::SetStatInterval(seconds) => {
                self.stat_interval = seconds;
                Ok(())
            }
        }
    }
}

impl HistoryBackend for TextLog {
    fn close(&mut self) -> Result<()> {
        self.close_files()
    }

    fn sync(&mut self) -> Result<()> {
        TextLog::sync(self)
    }

    fn lookup(&mut self, key: &str) -> Result<Option<HistoryEntry>> {
        TextLog::lookup(self, key)
    }

    fn check(&mut self, key: &str) -> Result<bool> {
        TextLog::check(self, key)
    }

    fn write(
        &mut self,
        key: &str,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: Option<&Token>,
    ) -> Result<()> {
        let hash = MessageIdHash::of_message_id(key);
        self.write_line(&hash, arrived, posted, expires, token)
    }

    fn remember(&mut self, key: &str, arrived: u64) -> Result<()> {
        let hash = MessageIdHash::of_message_id(key);
        self.write_line(&hash, arrived, 0, 0, None)
    }

    fn replace(
        &mut self,
        key: &str,
        arrived: u64,
        posted: u64,
        expires: u64,
        token: Option<&Token>,
    ) -> Result<()> {
        TextLog::replace(self, key, arrived, posted, expires, token)
    }

    fn walk(
        &mut self,
        reason: Option<&str>,
        server: Option<&mut dyn ServerControl>,
        callback: &mut dyn FnMut(u64, u64, u64, Option<&Token>) -> bool,
    ) -> Result<()> {
        TextLog::walk(self, reason, server, callback)
    }

    fn expire(
        &mut self,
        path: Option<&Path>,
        reason: Option<&str>,
        writing: bool,
        threshold: u64,
        server: Option<&mut dyn ServerControl>,
        keep: &mut dyn FnMut(u64, u64, u64, &mut Token) -> bool,
    ) -> Result<()> {
        TextLog::expire(self, path, reason, writing, threshold, server, keep)
    }

    fn ctl(&mut self, req: Ctl) -> Result<()> {
        TextLog::ctl(self, req)
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
