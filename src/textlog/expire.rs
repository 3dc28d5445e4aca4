//! Sequential traversal and the live-rebuild ("expire") protocol.
//!
//! Expire copies the surviving records of a history database into a fresh
//! log and index beside it, then renames the new files over the old. The
//! caller decides per record: keep it, downgrade it to a tombstone, or drop
//! it outright once it is older than the threshold. The source keeps
//! serving reads the whole time; a pause hook lets the surrounding server
//! drain in-flight writers so a final catch-up pass sees every line.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::dbz::{self, Dbz, DbzOptions, Residency};
use crate::error::{HistoryError, Location, Result};
use crate::history::{OpenFlags, ServerControl};
use crate::token::Token;

use super::{line, TextLog, PairsHint, MAX_LINE};

fn reborrow<'a>(
    server: &'a mut Option<&mut dyn ServerControl>,
) -> Option<&'a mut dyn ServerControl> {
    match server {
        Some(ctl) => Some(&mut **ctl),
        None => None,
    }
}

impl TextLog {
    /// Stream every line of the log through `visit`, in file order.
    ///
    /// With `ignore` set, malformed lines are logged and skipped instead of
    /// aborting; expire runs that way, since cleaning them out is its job.
    /// On end-of-file with a `reason`, the server is paused once and the
    /// scan continues, collecting lines appended during the first pass.
    fn traverse(
        &mut self,
        reason: Option<&str>,
        mut server: Option<&mut dyn ServerControl>,
        ignore: bool,
        paused: &mut bool,
        visit: &mut dyn FnMut(&line::HistoryLine) -> Result<bool>,
    ) -> Result<()> {
        let path = self.require_path()?.to_owned();
        let file = File::open(&path).map_err(|err| {
            HistoryError::io("can't open history file", &path, Location::None, err)
        })?;
        let mut reader = BufReader::new(file);
        let mut lineno: u64 = 1;
        let mut buf: Vec<u8> = Vec::with_capacity(MAX_LINE);

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(|err| {
                HistoryError::io("can't read line", &path, Location::Line(lineno), err)
            })?;

            if n == 0 {
                // end of file: pause the server once, then catch up with
                // anything that snuck in during the first pass
                if let (Some(reason), false) = (reason, *paused) {
                    if let Some(ctl) = server.as_mut() {
                        ctl.pause(reason).map_err(|err| HistoryError::Server {
                            action: "pause",
                            reason: reason.to_string(),
                            cause: err,
                        })?;
                    }
                    *paused = true;
                    continue;
                }
                break;
            }

            if buf.last() == Some(&b'\n') {
                buf.pop();
            } else {
                // torn tail: an append still in flight, or a truncated file
                if let (Some(reason), false) = (reason, *paused) {
                    if let Some(ctl) = server.as_mut() {
                        ctl.pause(reason).map_err(|err| HistoryError::Server {
                            action: "pause",
                            reason: reason.to_string(),
                            cause: err,
                        })?;
                    }
                    *paused = true;
                    reader.seek(SeekFrom::Current(-(n as i64))).map_err(|err| {
                        HistoryError::io("can't read line", &path, Location::Line(lineno), err)
                    })?;
                    continue;
                }
                if ignore {
                    log::warn!(
                        "unterminated line ignored in history {}:{}",
                        path.display(),
                        lineno
                    );
                    break;
                }
                return Err(HistoryError::Parse {
                    reason: "unterminated history line",
                    path,
                    location: Location::Line(lineno),
                });
            }

            if buf.len() + 1 > MAX_LINE {
                if ignore {
                    log::warn!("line too long in history {}:{}", path.display(), lineno);
                    lineno += 1;
                    continue;
                }
                return Err(HistoryError::Parse {
                    reason: "line too long in history",
                    path,
                    location: Location::Line(lineno),
                });
            }

            match line::split_line(&buf) {
                Ok(parsed) => match visit(&parsed) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(HistoryError::Callback {
                            path,
                            location: Location::Line(lineno),
                        })
                    }
                    Err(err) => return Err(err),
                },
                Err(reason_text) => {
                    if ignore {
                        log::warn!("{} {}:{}", reason_text, path.display(), lineno);
                    } else {
                        return Err(HistoryError::Parse {
                            reason: reason_text,
                            path,
                            location: Location::Line(lineno),
                        });
                    }
                }
            }
            lineno += 1;
        }
        Ok(())
    }

    pub(crate) fn walk(
        &mut self,
        reason: Option<&str>,
        server: Option<&mut dyn ServerControl>,
        callback: &mut dyn FnMut(u64, u64, u64, Option<&Token>) -> bool,
    ) -> Result<()> {
        let mut paused = false;
        self.traverse(reason, server, false, &mut paused, &mut |parsed| {
            Ok(callback(
                parsed.arrived,
                parsed.posted.unwrap_or(0),
                parsed.expires.unwrap_or(0),
                parsed.token.as_ref(),
            ))
        })
    }

    pub(crate) fn expire(
        &mut self,
        new_path: Option<&Path>,
        reason: Option<&str>,
        writing: bool,
        threshold: u64,
        mut server: Option<&mut dyn ServerControl>,
        keep: &mut dyn FnMut(u64, u64, u64, &mut Token) -> bool,
    ) -> Result<()> {
        let path = self.require_path()?.to_owned();
        if writing && self.flags.contains(OpenFlags::RDWR) {
            return Err(HistoryError::ExpireFromWritable { path });
        }

        let mut paused = false;
        let mut dest: Option<TextLog> = None;

        let mut result = self.expire_pass(
            &path,
            new_path,
            reason,
            writing,
            threshold,
            reborrow(&mut server),
            keep,
            &mut paused,
            &mut dest,
        );

        if writing {
            if let Some(dst) = dest.as_mut() {
                if let Err(err) = dst.close_files() {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
            if let Err(err) = self.close_files() {
                if result.is_ok() {
                    result = Err(err);
                }
            }

            if result.is_ok() {
                // with an explicit destination the caller swaps the files
                // out of band; otherwise replace the database in place
                if new_path.is_none() {
                    if let Some(dst) = dest.as_ref() {
                        result = unlink_database(&path)
                            .and_then(|_| rename_database(dst.path.as_ref().unwrap_or(&path), &path));
                    }
                }
            } else if let Some(dst) = dest.as_ref() {
                if let Some(dpath) = dst.path.as_ref() {
                    let _ = unlink_database(dpath);
                }
            }

            // bring the source back up (and reclaim the index) on whichever
            // files are now in place
            if let Err(err) = self.reopen() {
                let _ = self.close_files();
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        if result.is_err() && paused {
            if let (Some(ctl), Some(reason)) = (server.as_mut(), reason) {
                if let Err(err) = ctl.resume(reason) {
                    log::warn!("can't resume server for `{}': {}", reason, err);
                }
            }
        }
        result
    }

    fn expire_pass(
        &mut self,
        path: &Path,
        new_path: Option<&Path>,
        reason: Option<&str>,
        writing: bool,
        threshold: u64,
        server: Option<&mut dyn ServerControl>,
        keep: &mut dyn FnMut(u64, u64, u64, &mut Token) -> bool,
        paused: &mut bool,
        dest: &mut Option<TextLog>,
    ) -> Result<()> {
        if writing {
            let mut name = new_path.unwrap_or(path).as_os_str().to_owned();
            name.push(".n");
            let dest_path = PathBuf::from(name);

            let mut dst = TextLog::open(Some(&dest_path), OpenFlags::RDWR | OpenFlags::INCORE)?;

            // hand the index over: close ours, open the destination's
            if let Some(dbz) = self.dbz.take() {
                dbz.close()?;
            }
            let options = DbzOptions {
                writethrough: false,
                idx_residency: Residency::Mem,
                exists_residency: Residency::Mem,
                nonblock: false,
            };
            let index = match self.pairs {
                PairsHint::None => Dbz::again(&dest_path, path, options),
                PairsHint::Ignore => Dbz::fresh(&dest_path, dbz::size(0), options),
                PairsHint::Hint(npairs) => Dbz::fresh(&dest_path, dbz::size(npairs), options),
            }?;
            dst.dbz = Some(index);
            log::info!(
                "expire: rebuilding {} into {} ({} slots)",
                path.display(),
                dest_path.display(),
                dst.dbz.as_ref().map(Dbz::slots).unwrap_or(0)
            );
            *dest = Some(dst);
        }

        let mut visit = |parsed: &line::HistoryLine| -> Result<bool> {
            let dst = match dest.as_mut() {
                Some(dst) => dst,
                None => {
                    // dry run: consult the callback, write nothing
                    if let Some(token) = parsed.token {
                        let mut copy = token;
                        keep(
                            parsed.arrived,
                            parsed.posted.unwrap_or(0),
                            parsed.expires.unwrap_or(0),
                            &mut copy,
                        );
                    }
                    return Ok(true);
                }
            };

            let seen = match dst.dbz.as_ref() {
                Some(dbz) => dbz.exists(&parsed.hash)?,
                None => false,
            };
            if seen {
                // serious but not fatal; the record already made it across
                log::warn!(
                    "duplicate message-id [{}] in history {}",
                    parsed.hash.to_text(),
                    dst.path.as_deref().unwrap_or_else(|| Path::new("?")).display()
                );
                return Ok(true);
            }

            let mut posted = parsed.posted.unwrap_or(0);
            let mut expires = parsed.expires.unwrap_or(0);
            let mut token = parsed.token;
            if let Some(mut copy) = token {
                // the callback gets a local copy it may rewrite to relocate
                // the body
                if keep(parsed.arrived, posted, expires, &mut copy) {
                    token = Some(copy);
                } else {
                    token = None;
                    posted = 0;
                    expires = 0;
                }
            }

            if token.is_some() || parsed.arrived >= threshold {
                dst.write_line(&parsed.hash, parsed.arrived, posted, expires, token.as_ref())?;
            }
            Ok(true)
        };

        self.traverse(reason, server, true, paused, &mut visit)
    }
}

/// Remove a database: the log and the index siblings.
fn unlink_database(base: &Path) -> Result<()> {
    let mut result = Ok(());
    for path in dbz::sibling_paths(base).iter() {
        if let Err(err) = std::fs::remove_file(path) {
            if result.is_ok() {
                result = Err(HistoryError::io("can't unlink", path, Location::None, err));
            }
        }
    }
    if let Err(err) = std::fs::remove_file(base) {
        if result.is_ok() {
            result = Err(HistoryError::io("can't unlink", base, Location::None, err));
        }
    }
    result
}

/// Rename a database over another: the log and the index siblings.
fn rename_database(from: &Path, to: &Path) -> Result<()> {
    let from_siblings = dbz::sibling_paths(from);
    let to_siblings = dbz::sibling_paths(to);
    for (old, new) in from_siblings.iter().zip(to_siblings.iter()) {
        std::fs::rename(old, new)
            .map_err(|err| HistoryError::io("can't rename", old, Location::None, err))?;
    }
    std::fs::rename(from, to)
        .map_err(|err| HistoryError::io("can't rename", from, Location::None, err))
}
