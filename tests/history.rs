//! End-to-end tests against a real database in a scratch directory.
//!
//! The index is a process-wide singleton, so every test takes the lock
//! before opening anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lazy_static::lazy_static;

use nntp_history::{
    Ctl, History, HistoryError, MessageIdHash, OpenFlags, ServerControl, Token,
};

lazy_static! {
    static ref DBZ_LOCK: Mutex<()> = Mutex::new(());
}

fn lock() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    DBZ_LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

const METHOD: &str = "textlog";

fn token(tag: u8) -> Token {
    Token::new(2, 0, [tag; 16])
}

fn open_rdwr(path: &Path) -> History {
    History::open(Some(path), METHOD, OpenFlags::RDWR | OpenFlags::CREAT).unwrap()
}

fn open_rdonly(path: &Path) -> History {
    History::open(Some(path), METHOD, OpenFlags::empty()).unwrap()
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[test]
fn write_then_lookup_and_check() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();

    let entry = history.lookup("<a@test>").unwrap().expect("stored article");
    assert_eq!(entry.arrived, 1000);
    assert_eq!(entry.posted, 999);
    assert_eq!(entry.expires, 0);
    assert_eq!(entry.token, token(1));

    assert!(history.check("<a@test>").unwrap());
    assert!(!history.check("<other@test>").unwrap());
    assert!(history.lookup("<other@test>").unwrap().is_none());
    history.close().unwrap();
}

#[test]
fn on_disk_line_is_bit_exact() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.sync().unwrap();

    let hash = MessageIdHash::of_message_id("<a@test>");
    let expected = format!("[{}]\t1000~-~999\t{}\n", hash.to_text(), token(1).to_text());
    assert_eq!(fs::read_to_string(&path).unwrap(), expected);
    history.close().unwrap();
}

#[test]
fn remembered_id_checks_but_does_not_look_up() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.remember("<b@test>", 2000).unwrap();

    assert!(history.check("<b@test>").unwrap());
    assert!(history.lookup("<b@test>").unwrap().is_none());
    history.close().unwrap();
}

#[test]
fn replace_of_equal_length_round_trips() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 7777, &token(1)).unwrap();
    history.replace("<a@test>", 1000, 999, 5000, Some(&token(1))).unwrap();

    let entry = history.lookup("<a@test>").unwrap().expect("stored article");
    assert_eq!(entry.arrived, 1000);
    assert_eq!(entry.posted, 999);
    assert_eq!(entry.expires, 5000);
    assert_eq!(entry.token, token(1));
    history.close().unwrap();
}

#[test]
fn replace_shorter_pads_with_spaces() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 123456, &token(1)).unwrap();
    let before = fs::read(&path).unwrap().len();

    history.replace("<a@test>", 1000, 999, 55, Some(&token(2))).unwrap();
    let raw = fs::read(&path).unwrap();
    // length preserved, slack space-filled before the newline
    assert_eq!(raw.len(), before);
    assert_eq!(raw[raw.len() - 1], b'\n');
    assert_eq!(raw[raw.len() - 2], b' ');

    let entry = history.lookup("<a@test>").unwrap().expect("stored article");
    assert_eq!(entry.expires, 55);
    assert_eq!(entry.token, token(2));
    history.close().unwrap();
}

#[test]
fn replace_growing_the_line_fails_and_changes_nothing() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    // expires of zero encodes as `-`; any real expiry needs more room
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    match history.replace("<a@test>", 1000, 999, 5000, Some(&token(1))) {
        Err(HistoryError::ReplaceTooLong { .. }) => {}
        other => panic!("expected ReplaceTooLong, got {:?}", other),
    }
    assert!(history.error().unwrap().contains("too long"));

    let entry = history.lookup("<a@test>").unwrap().expect("stored article");
    assert_eq!(entry.arrived, 1000);
    assert_eq!(entry.posted, 999);
    assert_eq!(entry.expires, 0);
    assert_eq!(entry.token, token(1));
    history.close().unwrap();
}

#[test]
fn replace_with_no_token_prunes_in_place() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.replace("<a@test>", 1000, 999, 0, None).unwrap();

    assert!(history.lookup("<a@test>").unwrap().is_none());
    assert!(history.check("<a@test>").unwrap());
    history.close().unwrap();
}

#[test]
fn replacing_a_missing_record_fails() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    match history.replace("<nobody@test>", 1, 0, 0, None) {
        Err(HistoryError::NotFound { .. }) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
    history.close().unwrap();
}

#[test]
fn duplicate_write_succeeds_and_expire_collects_the_orphan() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    // reported as success; the index keeps the first offset and the new
    // line is orphaned until the next rebuild
    history.write("<a@test>", 2000, 1999, 0, &token(2)).unwrap();

    let entry = history.lookup("<a@test>").unwrap().expect("stored article");
    assert_eq!(entry.arrived, 1000);

    let mut lines = 0;
    history.walk(None, |_, _, _, _| {
        lines += 1;
        true
    })
    .unwrap();
    assert_eq!(lines, 2);
    history.close().unwrap();

    let mut history = open_rdonly(&path);
    history.expire(None, None, true, 0, |_, _, _, _| true).unwrap();
    let mut lines = 0;
    history.walk(None, |_, _, _, _| {
        lines += 1;
        true
    })
    .unwrap();
    assert_eq!(lines, 1);
    let entry = history.lookup("<a@test>").unwrap().expect("stored article");
    assert_eq!(entry.arrived, 1000);
    history.close().unwrap();
}

#[test]
fn walk_visits_every_record_in_log_order() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    for n in 0..10u64 {
        if n % 3 == 0 {
            history.remember(&format!("<{}@test>", n), 1000 + n).unwrap();
        } else {
            history
                .write(&format!("<{}@test>", n), 1000 + n, 900 + n, 0, &token(n as u8))
                .unwrap();
        }
    }

    let mut seen = Vec::new();
    history.walk(None, |arrived, _, _, tok| {
        seen.push((arrived, tok.is_some()));
        true
    })
    .unwrap();
    let expected: Vec<(u64, bool)> = (0..10u64).map(|n| (1000 + n, n % 3 != 0)).collect();
    assert_eq!(seen, expected);
    history.close().unwrap();
}

#[test]
fn aborted_walk_reports_the_callback() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.write("<b@test>", 2000, 1999, 0, &token(2)).unwrap();

    let mut visited = 0;
    match history.walk(None, |_, _, _, _| {
        visited += 1;
        false
    }) {
        Err(HistoryError::Callback { .. }) => {}
        other => panic!("expected Callback, got {:?}", other),
    }
    assert_eq!(visited, 1);
    history.close().unwrap();
}

#[test]
fn expire_keeping_everything_preserves_the_database() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.remember("<b@test>", 2000).unwrap();
    history.write("<c@test>", 3000, 2999, 4000, &token(3)).unwrap();
    history.close().unwrap();

    let mut history = open_rdonly(&path);
    history.expire(None, None, true, 0, |_, _, _, _| true).unwrap();

    let entry = history.lookup("<a@test>").unwrap().expect("kept");
    assert_eq!((entry.arrived, entry.posted, entry.expires), (1000, 999, 0));
    assert_eq!(entry.token, token(1));
    assert!(history.check("<b@test>").unwrap());
    assert!(history.lookup("<b@test>").unwrap().is_none());
    let entry = history.lookup("<c@test>").unwrap().expect("kept");
    assert_eq!(entry.expires, 4000);
    history.close().unwrap();
}

#[test]
fn expire_tombstones_recent_rejects_and_drops_old_ones() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<old@test>", 100, 99, 0, &token(1)).unwrap();
    history.write("<new@test>", 2000, 1999, 0, &token(2)).unwrap();
    history.close().unwrap();

    let mut history = open_rdonly(&path);
    history.expire(None, None, true, 1000, |_, _, _, _| false).unwrap();

    // rejected but recent: remembered without its token
    assert!(history.check("<new@test>").unwrap());
    assert!(history.lookup("<new@test>").unwrap().is_none());
    // rejected and older than the threshold: gone entirely
    assert!(!history.check("<old@test>").unwrap());
    assert!(history.lookup("<old@test>").unwrap().is_none());
    history.close().unwrap();
}

#[test]
fn expire_callback_may_relocate_tokens() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.close().unwrap();

    let mut history = open_rdonly(&path);
    history
        .expire(None, None, true, 0, |_, _, _, tok| {
            *tok = token(9);
            true
        })
        .unwrap();
    let entry = history.lookup("<a@test>").unwrap().expect("kept");
    assert_eq!(entry.token, token(9));
    history.close().unwrap();
}

#[test]
fn non_writing_expire_is_a_dry_run() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.remember("<b@test>", 2000).unwrap();

    let mut consulted = 0;
    history
        .expire(None, None, false, 0, |_, _, _, _| {
            consulted += 1;
            false
        })
        .unwrap();
    // only records carrying a token reach the callback, and nothing changes
    assert_eq!(consulted, 1);
    assert!(history.lookup("<a@test>").unwrap().is_some());
    assert!(history.check("<b@test>").unwrap());
    history.close().unwrap();
}

#[test]
fn expire_refuses_a_writable_source() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    match history.expire(None, None, true, 0, |_, _, _, _| true) {
        Err(HistoryError::ExpireFromWritable { .. }) => {}
        other => panic!("expected ExpireFromWritable, got {:?}", other),
    }
    history.close().unwrap();
}

#[test]
fn corrupt_record_fails_lookup_and_expire_cleans_it_out() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.write("<b@test>", 2000, 1999, 0, &token(2)).unwrap();
    history.close().unwrap();

    // damage the first record's bracketed hash in place
    let mut raw = fs::read(&path).unwrap();
    raw[0] = b'X';
    fs::write(&path, &raw).unwrap();

    let mut history = History::open(Some(&path), METHOD, OpenFlags::RDWR).unwrap();
    match history.lookup("<a@test>") {
        Err(HistoryError::Parse { .. }) => {}
        other => panic!("expected Parse, got {:?}", other),
    }
    assert!(history.lookup("<b@test>").unwrap().is_some());
    history.close().unwrap();

    let mut history = open_rdonly(&path);
    history.expire(None, None, true, 0, |_, _, _, _| true).unwrap();
    assert!(!history.check("<a@test>").unwrap());
    assert!(history.lookup("<b@test>").unwrap().is_some());
    history.close().unwrap();
}

#[test]
fn rotation_watchdog_picks_up_a_replaced_database() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("history");
    let rebuilt = dir.path().join("rebuilt");

    // build the replacement first; the index is a singleton
    let mut other = open_rdwr(&rebuilt);
    other.write("<b@test>", 2000, 1999, 0, &token(2)).unwrap();
    other.close().unwrap();

    let mut history = open_rdwr(&live);
    history.ctl(Ctl::SetStatInterval(1)).unwrap();
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.sync().unwrap();
    assert!(history.check("<a@test>").unwrap());

    // swap the rebuilt database in underneath the open handle
    for suffix in &["", ".index", ".hash", ".dir"] {
        fs::rename(sibling(&rebuilt, suffix), sibling(&live, suffix)).unwrap();
    }
    std::thread::sleep(Duration::from_millis(1600));

    assert!(history.check("<b@test>").unwrap());
    assert!(!history.check("<a@test>").unwrap());
    history.close().unwrap();
}

#[test]
fn cache_statistics_obey_the_conservation_law() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.set_cache(4096);

    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.remember("<b@test>", 2000).unwrap();

    assert!(history.check("<a@test>").unwrap()); // cached by the write
    assert!(history.check("<b@test>").unwrap()); // cached by the remember
    assert!(!history.check("<x@test>").unwrap()); // index says no
    assert!(!history.check("<x@test>").unwrap()); // cached negative
    let stats = history.stats();
    assert_eq!(stats.hitpos, 2);
    assert_eq!(stats.hitneg, 1);
    assert_eq!(stats.dne, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.hitpos + stats.hitneg + stats.misses + stats.dne, 4);

    // a fresh cache forgets; the index still answers
    history.set_cache(4096);
    assert!(history.check("<a@test>").unwrap());
    let stats = history.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hitpos + stats.hitneg + stats.misses + stats.dne, 1);

    history.close().unwrap();
}

struct Recorder {
    pauses: Arc<AtomicUsize>,
    resumes: Arc<AtomicUsize>,
}

impl ServerControl for Recorder {
    fn pause(&mut self, _reason: &str) -> anyhow::Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&mut self, _reason: &str) -> anyhow::Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn expire_with_a_reason_pauses_the_server_once() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history = open_rdwr(&path);
    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    history.close().unwrap();

    let pauses = Arc::new(AtomicUsize::new(0));
    let resumes = Arc::new(AtomicUsize::new(0));
    let mut history = open_rdonly(&path);
    history.set_server_control(Some(Box::new(Recorder {
        pauses: Arc::clone(&pauses),
        resumes: Arc::clone(&resumes),
    })));
    history.expire(None, Some("expire"), true, 0, |_, _, _, _| true).unwrap();

    assert_eq!(pauses.load(Ordering::SeqCst), 1);
    // the server stays paused on success; the caller resumes it
    assert_eq!(resumes.load(Ordering::SeqCst), 0);
    assert!(history.lookup("<a@test>").unwrap().is_some());
    history.close().unwrap();
}

#[test]
fn sizing_hints_flow_through_a_dormant_handle() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history");

    let mut history =
        History::open(None, METHOD, OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    history.ctl(Ctl::SetSyncCount(2)).unwrap();
    history.ctl(Ctl::SetPairsHint(1_000_000)).unwrap();
    assert!(history.path().is_none());
    history.ctl(Ctl::SetPath(&path)).unwrap();
    assert_eq!(history.path(), Some(path.as_path()));
    match history.ctl(Ctl::SetPath(&path)) {
        Err(HistoryError::PathAlreadySet) => {}
        other => panic!("expected PathAlreadySet, got {:?}", other),
    }

    history.write("<a@test>", 1000, 999, 0, &token(1)).unwrap();
    assert!(history.check("<a@test>").unwrap());
    history.close().unwrap();

    // the hint sized the index well past the default
    let raw = fs::read(sibling(&path, ".dir")).unwrap();
    let text = String::from_utf8(raw).unwrap();
    assert!(text.contains("1500001"), "unexpected directory: {}", text);
}
