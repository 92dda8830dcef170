use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const MODE_EXECUTABLE: u32 = 0o755;
pub const MODE_REGULAR: u32 = 0o644;

pub const ROOT_ID: u64 = 0;
pub const ROOT_NAME: &str = "root";

/// Canonical attributes stamped on every archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryAttrs {
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub owner: &'static str,
    pub group: &'static str,
}

impl EntryAttrs {
    fn root(mode: u32) -> Self {
        Self {
            mode,
            uid: ROOT_ID,
            gid: ROOT_ID,
            owner: ROOT_NAME,
            group: ROOT_NAME,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttributeNormalizer {
    script_suffixes: Vec<String>,
}

impl AttributeNormalizer {
    pub fn new<I, S>(script_suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script_suffixes: script_suffixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_script_name(&self, file_name: &str) -> bool {
        self.script_suffixes
            .iter()
            .any(|s| !s.is_empty() && file_name.ends_with(s.as_str()))
    }

    /// Ownership is always root:root. Mode is 0755 for script-like names or
    /// files with any execute bit on the host, 0644 otherwise.
    pub fn classify(&self, file_name: &str, source: &Path) -> Result<EntryAttrs> {
        if self.is_script_name(file_name) || host_executable(source)? {
            return Ok(EntryAttrs::root(MODE_EXECUTABLE));
        }
        Ok(EntryAttrs::root(MODE_REGULAR))
    }
}

impl Default for AttributeNormalizer {
    fn default() -> Self {
        Self::new([".sh", ".py"])
    }
}

#[cfg(unix)]
fn host_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let md = fs::metadata(path).map_err(|e| Error::io("stat", path, e))?;
    Ok(md.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn host_executable(path: &Path) -> Result<bool> {
    fs::metadata(path).map_err(|e| Error::io("stat", path, e))?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_suffix_wins_over_host_mode() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = tmp.path().join("start-stop.sh");
        let doc = tmp.path().join("description.txt");
        fs::write(&script, "#!/bin/sh\n").expect("write script");
        fs::write(&doc, "hello").expect("write doc");

        let n = AttributeNormalizer::default();
        let a = n.classify("start-stop.sh", &script).expect("classify script");
        assert_eq!(a.mode, 0o755);
        assert_eq!((a.uid, a.gid, a.owner, a.group), (0, 0, "root", "root"));

        let b = n.classify("description.txt", &doc).expect("classify doc");
        assert_eq!(b.mode, 0o644);
    }

    #[cfg(unix)]
    #[test]
    fn host_execute_bit_marks_executable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let bin = tmp.path().join("minio");
        fs::write(&bin, b"\x7fELF").expect("write bin");
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o700)).expect("chmod");

        let n = AttributeNormalizer::new(Vec::<String>::new());
        assert_eq!(n.classify("minio", &bin).expect("classify").mode, 0o755);

        fs::set_permissions(&bin, fs::Permissions::from_mode(0o600)).expect("chmod");
        assert_eq!(n.classify("minio", &bin).expect("classify").mode, 0o644);
    }

    #[test]
    fn missing_source_is_filesystem_error() {
        let n = AttributeNormalizer::default();
        let err = n
            .classify("gone", Path::new("/nonexistent/apkg/gone"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Filesystem);
    }
}
