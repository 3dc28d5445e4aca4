//! Small filesystem helpers shared by the database layers.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::Path;

use nix::sys::stat;
use nix::unistd;

/// Replace the contents of `path` atomically.
///
/// Writes into a mkstemp sibling and renames it over the target, so readers
/// in other processes always see either the old contents or the new, never a
/// torn write.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = unistd::mkstemp(&template).map_err(nix_to_io)?;

    let mode = stat::Mode::S_IRUSR
        | stat::Mode::S_IWUSR
        | stat::Mode::S_IRGRP
        | stat::Mode::S_IROTH;
    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        return Err(nix_to_io(err));
    }

    let mut file = unsafe { File::from_raw_fd(fd) };
    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(&tmp_path);
        return Err(err);
    }
    if let Err(err) = file.sync_data() {
        let _ = unistd::unlink(&tmp_path);
        return Err(err);
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = unistd::unlink(&tmp_path);
        return Err(err);
    }
    Ok(())
}

fn nix_to_io(err: nix::Error) -> std::io::Error {
    match err.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings");
        write_file_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        // no temp files left behind
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
