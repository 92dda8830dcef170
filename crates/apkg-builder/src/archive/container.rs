use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::modules::util::write_atomically;
use crate::workspace::{CONTROL_TARBALL, DATA_TARBALL, VERSION_MARKER_FILE};

/// Container format revision written to `apkg-version`.
pub const FORMAT_VERSION: &str = "2.0";

/// Member names in the order they are written.
pub const MEMBERS: [&str; 3] = [VERSION_MARKER_FILE, CONTROL_TARBALL, DATA_TARBALL];

/// Write `members` (archive name, source file) into a deflate zip at `output`.
pub fn write_container(output: &Path, members: &[(&str, &Path)]) -> Result<u64> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    write_atomically(output, |file| {
        let mut zip = ZipWriter::new(file);
        let mut total = 0u64;
        for (name, src) in members {
            let f = File::open(src).map_err(|e| Error::io("open", src, e))?;
            zip.start_file(*name, options)?;
            total += io::copy(&mut BufReader::new(f), &mut zip)
                .map_err(|e| Error::io("embed", src, e))?;
        }
        zip.finish()?;
        Ok(total)
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TarEntryInfo {
    pub path: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub owner: String,
    pub group: String,
    pub size: u64,
    pub mtime: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerContents {
    pub members: Vec<String>,
    pub format_version: String,
    pub control: Vec<TarEntryInfo>,
    pub data: Vec<TarEntryInfo>,
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let f = File::open(path).map_err(|e| Error::io("open", path, e))?;
    Ok(ZipArchive::new(f)?)
}

/// Read a container back and describe every member.
pub fn read_container(path: &Path) -> Result<ContainerContents> {
    let mut zip = open_archive(path)?;
    let members: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).map(|f| f.name().to_string()))
        .collect::<std::result::Result<_, _>>()?;
    if members != MEMBERS {
        return Err(Error::Filesystem(format!(
            "{} has members {:?}, expected {:?}",
            path.display(),
            members,
            MEMBERS
        )));
    }

    let mut format_version = String::new();
    zip.by_name(VERSION_MARKER_FILE)?
        .read_to_string(&mut format_version)
        .map_err(|e| Error::io("read version marker in", path, e))?;

    let control = list_tar(zip.by_name(CONTROL_TARBALL)?, path)?;
    let data = list_tar(zip.by_name(DATA_TARBALL)?, path)?;
    Ok(ContainerContents {
        members,
        format_version: format_version.trim_end().to_string(),
        control,
        data,
    })
}

/// Extract a single file from one of the embedded tarballs.
pub fn read_entry(path: &Path, member: &str, entry: &str) -> Result<Vec<u8>> {
    let mut zip = open_archive(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(zip.by_name(member)?));
    for e in archive
        .entries()
        .map_err(|e| Error::io("read tar in", path, e))?
    {
        let mut e = e.map_err(|e| Error::io("read tar entry in", path, e))?;
        let name = e
            .path()
            .map_err(|e| Error::io("read entry path in", path, e))?
            .to_string_lossy()
            .into_owned();
        if name == entry {
            let mut buf = Vec::new();
            e.read_to_end(&mut buf)
                .map_err(|e| Error::io("read entry in", path, e))?;
            return Ok(buf);
        }
    }
    Err(Error::Filesystem(format!(
        "{}: no entry '{entry}' in {member}",
        path.display()
    )))
}

fn list_tar<R: Read>(reader: R, container: &Path) -> Result<Vec<TarEntryInfo>> {
    let ctx = |what: &str, e: io::Error| Error::io(what, container, e);
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut out = Vec::new();
    for e in archive.entries().map_err(|e| ctx("read tar in", e))? {
        let mut e = e.map_err(|e| ctx("read tar entry in", e))?;
        let h = e.header().clone();
        let path = e
            .path()
            .map_err(|e| ctx("read entry path in", e))?
            .to_string_lossy()
            .into_owned();

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = e.read(&mut buf).map_err(|e| ctx("read entry in", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        out.push(TarEntryInfo {
            path,
            mode: h.mode().map_err(|e| ctx("read mode in", e))?,
            uid: h.uid().map_err(|e| ctx("read uid in", e))?,
            gid: h.gid().map_err(|e| ctx("read gid in", e))?,
            owner: h.username().ok().flatten().unwrap_or_default().to_string(),
            group: h.groupname().ok().flatten().unwrap_or_default().to_string(),
            size: h.size().map_err(|e| ctx("read size in", e))?,
            mtime: h.mtime().map_err(|e| ctx("read mtime in", e))?,
            sha256: hex::encode(hasher.finalize()),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rejects_foreign_member_layout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp.path().join("apkg-version");
        fs::write(&marker, "2.0\n").expect("write marker");
        let out = tmp.path().join("odd.apk");
        write_container(&out, &[(VERSION_MARKER_FILE, marker.as_path())]).expect("write container");

        let err = read_container(&out).unwrap_err().to_string();
        assert!(err.contains("expected"), "unexpected err: {err}");
    }

    #[test]
    fn members_are_deflated() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp.path().join("apkg-version");
        fs::write(&marker, "2.0\n").expect("write marker");
        let out = tmp.path().join("x.apk");
        write_container(&out, &[(VERSION_MARKER_FILE, marker.as_path())]).expect("write container");

        let mut zip = open_archive(&out).expect("open");
        let f = zip.by_index(0).expect("member");
        assert_eq!(f.name(), VERSION_MARKER_FILE);
        assert_eq!(f.compression(), CompressionMethod::Deflated);
    }
}
