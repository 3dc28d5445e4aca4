//! The `dbz` hash index: a persistent open-addressed table mapping a
//! message-identifier hash to the byte offset of its line in the text log.
//!
//! The index lives in three sibling files next to the log: `<log>.index`
//! holds one little-endian 64-bit offset word per slot, `<log>.hash` holds
//! one 6-byte hash fingerprint per slot (the "exists" side-table, consulted
//! alone for membership checks), and `<log>.dir` carries the table geometry.
//! A slot's position in the table is derived from the first hash bytes and
//! its fingerprint from the following ones, so the slot index acts as an
//! implicit part of the stored hash.
//!
//! Only one index may be open per process. The claim is taken when a [`Dbz`]
//! is opened and released when it is closed or dropped; whichever history
//! handle holds the value owns the index, and the expire engine transfers
//! ownership by closing the source's index and opening the destination's.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Location, Result};
use crate::msgid::MessageIdHash;
use crate::tools;

mod table;

pub use table::Residency;
use table::TableFile;

/// Bytes of the hash stored per slot in the side-table. Enough to keep the
/// collision rate negligible once the slot index is counted as part of the
/// stored value.
pub const FINGERPRINT_SIZE: usize = 6;

const OFFSET_SIZE: usize = 8;

/// Population assumed when no sizing hint was given.
const DEFAULT_PAIRS: u64 = 50_000;

const CONFIG_VERSION: u32 = 1;

static DBZ_OPEN: AtomicBool = AtomicBool::new(false);

/// Tuning knobs for an open index.
#[derive(Debug, Clone, Copy)]
pub struct DbzOptions {
    /// Mirror every store to the file instead of batching into one large
    /// write at sync time. Only meaningful for [`Residency::Mem`].
    pub writethrough: bool,
    pub idx_residency: Residency,
    pub exists_residency: Residency,
    /// Allow asynchronous stores when the table is not memory-mapped.
    /// Advisory on Linux, where regular-file writes always block.
    pub nonblock: bool,
}

impl Default for DbzOptions {
    fn default() -> Self {
        DbzOptions {
            writethrough: true,
            idx_residency: Residency::Disk,
            exists_residency: Residency::Disk,
            nonblock: false,
        }
    }
}

/// Outcome of a successful [`Dbz::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The pair was inserted.
    Ok,
    /// The hash was already present; the stored offset is unchanged and the
    /// caller decides what that means.
    Exists,
}

#[derive(Debug, Serialize, Deserialize)]
struct DbzConfig {
    version: u32,
    tsize: u64,
    used: u64,
}

/// An open index. Holding the value is holding the process-wide claim.
pub struct Dbz {
    base: PathBuf,
    config: DbzConfig,
    idx: TableFile,
    exists_table: TableFile,
    dirty_config: bool,
}

enum Probe {
    Found { offset: u64 },
    Vacant { slot: u64 },
    Full,
}

/// Slot count for a table expected to hold `npairs` entries, keeping the
/// load factor under two thirds. An odd count so that probe runs do not
/// resonate with power-of-two hash structure.
pub fn size(npairs: u64) -> u64 {
    let pairs = npairs.max(DEFAULT_PAIRS);
    (pairs * 3 / 2) | 1
}

/// Whether any index is currently open in this process.
pub fn in_use() -> bool {
    DBZ_OPEN.load(Ordering::SeqCst)
}

/// The sibling files an index keeps next to log file `base`.
pub fn sibling_paths(base: &Path) -> [PathBuf; 3] {
    [sibling(base, ".index"), sibling(base, ".hash"), sibling(base, ".dir")]
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn claim() -> Result<()> {
    if DBZ_OPEN
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        Ok(())
    } else {
        Err(HistoryError::IndexBusy)
    }
}

fn release() {
    DBZ_OPEN.store(false, Ordering::SeqCst);
}

impl Dbz {
    /// Create a fresh, empty index over `base` with `slots` table slots.
    pub fn fresh(base: &Path, slots: u64, options: DbzOptions) -> Result<Dbz> {
        claim()?;
        Self::create_files(base, slots)
            .and_then(|_| Self::open_files(base, options))
            .map_err(|err| {
                release();
                err
            })
    }

    /// Create an empty index over `base` sized like the existing index over
    /// `old_base`. Used by expire to rebuild at the same scale.
    pub fn again(base: &Path, old_base: &Path, options: DbzOptions) -> Result<Dbz> {
        claim()?;
        Self::read_config(old_base)
            .and_then(|old| Self::create_files(base, old.tsize))
            .and_then(|_| Self::open_files(base, options))
            .map_err(|err| {
                release();
                err
            })
    }

    /// Open the existing index over `base`.
    pub fn init(base: &Path, options: DbzOptions) -> Result<Dbz> {
        claim()?;
        Self::open_files(base, options).map_err(|err| {
            release();
            err
        })
    }

    fn create_files(base: &Path, slots: u64) -> Result<()> {
        let config = DbzConfig { version: CONFIG_VERSION, tsize: slots, used: 0 };
        Self::write_config(base, &config)?;
        let idx_path = sibling(base, ".index");
        TableFile::create(&idx_path, slots * OFFSET_SIZE as u64)
            .map_err(|err| HistoryError::io("can't create dbz index", &idx_path, Location::None, err))?;
        let hash_path = sibling(base, ".hash");
        TableFile::create(&hash_path, slots * FINGERPRINT_SIZE as u64)
            .map_err(|err| HistoryError::io("can't create dbz hash table", &hash_path, Location::None, err))?;
        Ok(())
    }

    fn open_files(base: &Path, options: DbzOptions) -> Result<Dbz> {
        let config = Self::read_config(base)?;
        let idx_path = sibling(base, ".index");
        let idx = TableFile::open(&idx_path, options.idx_residency, options.writethrough)
            .map_err(|err| HistoryError::io("can't open dbz index", &idx_path, Location::None, err))?;
        let hash_path = sibling(base, ".hash");
        let exists_table =
            TableFile::open(&hash_path, options.exists_residency, options.writethrough)
                .map_err(|err| {
                    HistoryError::io("can't open dbz hash table", &hash_path, Location::None, err)
                })?;

        if idx.len() as u64 != config.tsize * OFFSET_SIZE as u64 {
            return Err(HistoryError::Parse {
                reason: "dbz index size disagrees with directory",
                path: idx_path,
                location: Location::None,
            });
        }
        if exists_table.len() as u64 != config.tsize * FINGERPRINT_SIZE as u64 {
            return Err(HistoryError::Parse {
                reason: "dbz hash table size disagrees with directory",
                path: hash_path,
                location: Location::None,
            });
        }

        Ok(Dbz { base: base.to_owned(), config, idx, exists_table, dirty_config: false })
    }

    fn read_config(base: &Path) -> Result<DbzConfig> {
        let dir_path = sibling(base, ".dir");
        let raw = std::fs::read(&dir_path)
            .map_err(|err| HistoryError::io("can't open dbz directory", &dir_path, Location::None, err))?;
        let config: DbzConfig = serde_json::from_slice(&raw).map_err(|_| HistoryError::Parse {
            reason: "malformed dbz directory",
            path: dir_path.clone(),
            location: Location::None,
        })?;
        if config.version != CONFIG_VERSION || config.tsize == 0 {
            return Err(HistoryError::Parse {
                reason: "unsupported dbz directory",
                path: dir_path,
                location: Location::None,
            });
        }
        Ok(config)
    }

    fn write_config(base: &Path, config: &DbzConfig) -> Result<()> {
        let dir_path = sibling(base, ".dir");
        let raw = serde_json::to_vec(config).expect("dbz directory serializes");
        tools::write_file_atomic(&dir_path, &raw)
            .map_err(|err| HistoryError::io("can't write dbz directory", &dir_path, Location::None, err))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn slots(&self) -> u64 {
        self.config.tsize
    }

    pub fn used(&self) -> u64 {
        self.config.used
    }

    fn home_slot(&self, hash: &MessageIdHash) -> u64 {
        let bytes = hash.as_bytes();
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(word) % self.config.tsize
    }

    fn fingerprint(hash: &MessageIdHash) -> [u8; FINGERPRINT_SIZE] {
        let bytes = hash.as_bytes();
        let mut fp = [0u8; FINGERPRINT_SIZE];
        fp.copy_from_slice(&bytes[8..8 + FINGERPRINT_SIZE]);
        if fp == [0u8; FINGERPRINT_SIZE] {
            // all-zero marks a vacant slot; fold the rare real zero into the
            // fingerprint's existing false-positive channel
            fp[FINGERPRINT_SIZE - 1] = 1;
        }
        fp
    }

    fn probe(&self, hash: &MessageIdHash, want_offset: bool) -> Result<Probe> {
        let fp = Self::fingerprint(hash);
        let mut slot = self.home_slot(hash);
        for _ in 0..self.config.tsize {
            let mut stored = [0u8; FINGERPRINT_SIZE];
            self.exists_table
                .read(slot as usize * FINGERPRINT_SIZE, &mut stored)
                .map_err(|err| {
                    HistoryError::io(
                        "can't read dbz hash table",
                        self.exists_table.path(),
                        Location::Offset(slot * FINGERPRINT_SIZE as u64),
                        err,
                    )
                })?;
            if stored == [0u8; FINGERPRINT_SIZE] {
                return Ok(Probe::Vacant { slot });
            }
            if stored == fp {
                let offset = if want_offset {
                    let mut word = [0u8; OFFSET_SIZE];
                    self.idx.read(slot as usize * OFFSET_SIZE, &mut word).map_err(|err| {
                        HistoryError::io(
                            "can't read dbz index",
                            self.idx.path(),
                            Location::Offset(slot * OFFSET_SIZE as u64),
                            err,
                        )
                    })?;
                    u64::from_le_bytes(word)
                } else {
                    0
                };
                return Ok(Probe::Found { offset });
            }
            slot = (slot + 1) % self.config.tsize;
        }
        Ok(Probe::Full)
    }

    /// Membership check; consults only the fingerprint side-table.
    ///
    /// A fingerprint collision can answer `true` for a hash that was never
    /// stored; it never answers `false` for one that was.
    pub fn exists(&self, hash: &MessageIdHash) -> Result<bool> {
        match self.probe(hash, false)? {
            Probe::Found { .. } => Ok(true),
            Probe::Vacant { .. } | Probe::Full => Ok(false),
        }
    }

    /// The log offset stored for `hash`, or `None` when absent.
    pub fn fetch(&self, hash: &MessageIdHash) -> Result<Option<u64>> {
        match self.probe(hash, true)? {
            Probe::Found { offset } => Ok(Some(offset)),
            Probe::Vacant { .. } | Probe::Full => Ok(None),
        }
    }

    /// Insert `(hash, offset)`.
    pub fn store(&mut self, hash: &MessageIdHash, offset: u64) -> Result<StoreOutcome> {
        match self.probe(hash, false)? {
            Probe::Found { .. } => Ok(StoreOutcome::Exists),
            Probe::Vacant { slot } => {
                // offset word first: a concurrent reader that sees the
                // fingerprint must find the offset already in place
                self.idx
                    .write(slot as usize * OFFSET_SIZE, &offset.to_le_bytes())
                    .map_err(|err| {
                        HistoryError::io(
                            "can't write dbz index",
                            self.idx.path(),
                            Location::Offset(slot * OFFSET_SIZE as u64),
                            err,
                        )
                    })?;
                let fp = Self::fingerprint(hash);
                self.exists_table
                    .write(slot as usize * FINGERPRINT_SIZE, &fp)
                    .map_err(|err| {
                        HistoryError::io(
                            "can't write dbz hash table",
                            self.exists_table.path(),
                            Location::Offset(slot * FINGERPRINT_SIZE as u64),
                            err,
                        )
                    })?;
                self.config.used += 1;
                self.dirty_config = true;
                Ok(StoreOutcome::Ok)
            }
            Probe::Full => Err(HistoryError::IndexFull { path: self.base.clone() }),
        }
    }

    /// Flush dirty table pages and the directory to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.idx
            .sync()
            .map_err(|err| HistoryError::io("can't sync dbz index", self.idx.path(), Location::None, err))?;
        self.exists_table.sync().map_err(|err| {
            HistoryError::io("can't sync dbz hash table", self.exists_table.path(), Location::None, err)
        })?;
        if self.dirty_config {
            Self::write_config(&self.base, &self.config)?;
            self.dirty_config = false;
        }
        Ok(())
    }

    /// Flush and release the index. The claim is released when the value
    /// drops, immediately after.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

impl Drop for Dbz {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            log::error!("dbz {}: flush on close failed: {}", self.base.display(), err);
        }
        release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn hash(n: u32) -> MessageIdHash {
        MessageIdHash::of_message_id(&format!("<{}@dbz.test>", n))
    }

    #[test]
    fn size_keeps_the_table_sparse() {
        assert!(size(0) >= DEFAULT_PAIRS * 3 / 2);
        assert_eq!(size(1_000_000), 1_500_001);
        assert_eq!(size(1_000_000) % 2, 1);
    }

    #[test]
    fn store_fetch_exists_round_trip() {
        let _guard = testutil::dbz_lock();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("history");

        let mut dbz = Dbz::fresh(&base, 101, DbzOptions::default()).unwrap();
        for n in 0..50 {
            assert_eq!(dbz.store(&hash(n), n as u64 * 100).unwrap(), StoreOutcome::Ok);
        }
        for n in 0..50 {
            assert!(dbz.exists(&hash(n)).unwrap());
            assert_eq!(dbz.fetch(&hash(n)).unwrap(), Some(n as u64 * 100));
        }
        assert!(!dbz.exists(&hash(999)).unwrap());
        assert_eq!(dbz.fetch(&hash(999)).unwrap(), None);
        assert_eq!(dbz.used(), 50);
    }

    #[test]
    fn duplicate_store_reports_exists_and_keeps_the_offset() {
        let _guard = testutil::dbz_lock();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("history");

        let mut dbz = Dbz::fresh(&base, 101, DbzOptions::default()).unwrap();
        assert_eq!(dbz.store(&hash(1), 10).unwrap(), StoreOutcome::Ok);
        assert_eq!(dbz.store(&hash(1), 20).unwrap(), StoreOutcome::Exists);
        assert_eq!(dbz.fetch(&hash(1)).unwrap(), Some(10));
        assert_eq!(dbz.used(), 1);
    }

    #[test]
    fn contents_survive_close_and_init() {
        let _guard = testutil::dbz_lock();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("history");

        let mut options = DbzOptions::default();
        options.writethrough = false;
        options.idx_residency = Residency::Mem;
        options.exists_residency = Residency::Mem;

        let mut dbz = Dbz::fresh(&base, 101, options).unwrap();
        dbz.store(&hash(7), 7000).unwrap();
        dbz.close().unwrap();

        let dbz = Dbz::init(&base, DbzOptions::default()).unwrap();
        assert_eq!(dbz.fetch(&hash(7)).unwrap(), Some(7000));
        assert_eq!(dbz.used(), 1);
    }

    #[test]
    fn again_clones_the_table_size() {
        let _guard = testutil::dbz_lock();
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("history");
        let new = dir.path().join("history.n");

        let dbz = Dbz::fresh(&old, 3001, DbzOptions::default()).unwrap();
        dbz.close().unwrap();

        let dbz = Dbz::again(&new, &old, DbzOptions::default()).unwrap();
        assert_eq!(dbz.slots(), 3001);
        assert_eq!(dbz.used(), 0);
    }

    #[test]
    fn full_table_fails_the_store() {
        let _guard = testutil::dbz_lock();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("history");

        let mut dbz = Dbz::fresh(&base, 5, DbzOptions::default()).unwrap();
        let mut stored = 0;
        let mut n = 0;
        while stored < 5 {
            if dbz.store(&hash(n), n as u64).unwrap() == StoreOutcome::Ok {
                stored += 1;
            }
            n += 1;
        }
        let overflow = (0..).find(|&m| !dbz.exists(&hash(m)).unwrap()).unwrap();
        match dbz.store(&hash(overflow), 0) {
            Err(HistoryError::IndexFull { .. }) => {}
            other => panic!("expected IndexFull, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn only_one_index_per_process() {
        let _guard = testutil::dbz_lock();
        let dir = tempfile::tempdir().unwrap();

        let first = Dbz::fresh(&dir.path().join("a"), 101, DbzOptions::default()).unwrap();
        match Dbz::fresh(&dir.path().join("b"), 101, DbzOptions::default()) {
            Err(HistoryError::IndexBusy) => {}
            other => panic!("expected IndexBusy, got {:?}", other.map(|_| ())),
        }
        drop(first);
        assert!(!in_use());
        Dbz::fresh(&dir.path().join("b"), 101, DbzOptions::default()).unwrap();
    }
}
