use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p).map_err(|e| Error::io("create dir", p, e))
}

pub fn write_bytes(p: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, bytes).map_err(|e| Error::io("write", p, e))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    write_bytes(p, s.as_bytes())
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::Filesystem(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })
}

pub fn remove_file_if_exists(p: &Path) -> Result<()> {
    match fs::remove_file(p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("remove", p, e)),
    }
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io("set mode on", path, e))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Replace every CRLF pair with LF. Lone CR bytes are left alone.
pub fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\r' && input.get(i + 1) == Some(&b'\n') {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

/// Write through a temp file in the destination directory and rename on
/// success, so readers never observe a partial file at `dest`.
pub fn write_atomically<F>(dest: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut fs::File) -> Result<u64>,
{
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    ensure_dir(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::io("create temp file in", parent, e))?;
    let n = write(tmp.as_file_mut())?;
    tmp.persist(dest)
        .map_err(|e| Error::io("persist", dest, e.error))?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_becomes_lf_and_nothing_else_changes() {
        let input = b"#!/bin/sh\r\necho \"a\rb\"\r\n\r\nexit 0";
        let got = normalize_line_endings(input);
        assert_eq!(got, b"#!/bin/sh\necho \"a\rb\"\n\nexit 0".to_vec());
        assert_eq!(normalize_line_endings(b"plain\n"), b"plain\n".to_vec());
        assert_eq!(normalize_line_endings(b"\r"), b"\r".to_vec());
    }

    #[test]
    fn atomic_write_leaves_nothing_on_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dest = tmp.path().join("out.bin");
        let err = write_atomically(&dest, |_| Err(Error::transport("boom"))).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(tmp.path()).expect("read dir").count(), 0);
    }
}
