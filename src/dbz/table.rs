//! Fixed-size table files backing the index.
//!
//! Both the offset table (`.index`) and the fingerprint side-table (`.hash`)
//! are flat arrays of fixed-width cells. Residency decides where reads and
//! writes land: straight on disk, in a buffer read once at open and flushed
//! on sync, or through a shared mapping.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

/// Where a table lives while the index is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Every access goes to the file.
    Disk,
    /// Read into memory at open, written back on sync and close.
    Mem,
    /// Memory-mapped; stores go straight through the mapping.
    Mmap,
}

pub(super) struct TableFile {
    path: PathBuf,
    file: File,
    len: usize,
    writethrough: bool,
    backing: Backing,
}

enum Backing {
    Disk,
    Mem { buf: Vec<u8>, dirty: bool },
    Mmap { map: MmapMut },
}

impl TableFile {
    /// Create (or re-create) a zero-filled table of `len` bytes.
    pub fn create(path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        file.sync_data()
    }

    pub fn open(path: &Path, residency: Residency, writethrough: bool) -> io::Result<TableFile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let backing = match residency {
            Residency::Disk => Backing::Disk,
            Residency::Mem => {
                let mut buf = vec![0u8; len];
                file.read_exact_at(&mut buf, 0)?;
                Backing::Mem { buf, dirty: false }
            }
            Residency::Mmap => {
                let map = unsafe { MmapMut::map_mut(&file)? };
                Backing::Mmap { map }
            }
        };
        Ok(TableFile { path: path.to_owned(), file, len, writethrough, backing })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> io::Result<()> {
        match &self.backing {
            Backing::Disk => self.file.read_exact_at(out, offset as u64),
            Backing::Mem { buf, .. } => {
                out.copy_from_slice(&buf[offset..offset + out.len()]);
                Ok(())
            }
            Backing::Mmap { map } => {
                out.copy_from_slice(&map[offset..offset + out.len()]);
                Ok(())
            }
        }
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        match &mut self.backing {
            Backing::Disk => self.file.write_all_at(data, offset as u64),
            Backing::Mem { buf, dirty } => {
                buf[offset..offset + data.len()].copy_from_slice(data);
                if self.writethrough {
                    self.file.write_all_at(data, offset as u64)
                } else {
                    *dirty = true;
                    Ok(())
                }
            }
            Backing::Mmap { map } => {
                map[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
        }
    }

    pub fn sync(&mut self) -> io::Result<()> {
        match &mut self.backing {
            Backing::Disk => self.file.sync_data(),
            Backing::Mem { buf, dirty } => {
                if *dirty {
                    self.file.write_all_at(buf, 0)?;
                    *dirty = false;
                }
                self.file.sync_data()
            }
            Backing::Mmap { map } => map.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(residency: Residency, writethrough: bool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        TableFile::create(&path, 64).unwrap();

        let mut table = TableFile::open(&path, residency, writethrough).unwrap();
        assert_eq!(table.len(), 64);
        table.write(8, b"abcdef").unwrap();
        let mut cell = [0u8; 6];
        table.read(8, &mut cell).unwrap();
        assert_eq!(&cell, b"abcdef");
        table.sync().unwrap();
        drop(table);

        // visible to a fresh open
        let reopened = TableFile::open(&path, Residency::Disk, true).unwrap();
        let mut cell = [0u8; 6];
        reopened.read(8, &mut cell).unwrap();
        assert_eq!(&cell, b"abcdef");
    }

    #[test]
    fn disk_backing_round_trips() {
        cycle(Residency::Disk, true);
    }

    #[test]
    fn mem_backing_round_trips() {
        cycle(Residency::Mem, false);
    }

    #[test]
    fn mem_writethrough_round_trips() {
        cycle(Residency::Mem, true);
    }

    #[test]
    fn mmap_backing_round_trips() {
        cycle(Residency::Mmap, false);
    }
}
