use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use walkdir::WalkDir;

use crate::archive::attrs::AttributeNormalizer;
use crate::error::{Error, Result};

/// Entry timestamp source, resolved once per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtimePolicy {
    Fixed(u64),
    Now,
}

impl MtimePolicy {
    /// Explicit config wins, then `SOURCE_DATE_EPOCH`, then wall clock.
    pub fn from_config(mtime: Option<u64>) -> Self {
        Self::select(mtime, std::env::var("SOURCE_DATE_EPOCH").ok().as_deref())
    }

    // An unparsable epoch falls through to the clock.
    fn select(mtime: Option<u64>, source_date_epoch: Option<&str>) -> Self {
        if let Some(t) = mtime {
            return MtimePolicy::Fixed(t);
        }
        source_date_epoch
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(MtimePolicy::Fixed)
            .unwrap_or(MtimePolicy::Now)
    }

    pub fn resolve(self) -> u64 {
        match self {
            MtimePolicy::Fixed(t) => t,
            MtimePolicy::Now => chrono::Utc::now().timestamp().max(0) as u64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TarSummary {
    pub entries: Vec<String>,
    pub total_bytes: u64,
}

pub struct TarAssembler<'a> {
    normalizer: &'a AttributeNormalizer,
    mtime: u64,
}

impl<'a> TarAssembler<'a> {
    pub fn new(normalizer: &'a AttributeNormalizer, mtime: u64) -> Self {
        Self { normalizer, mtime }
    }

    /// Tar every regular file under `source_dir` into a gzip stream at `output`.
    /// `include` sees paths relative to `source_dir`; returning false for a
    /// directory prunes its whole subtree. Entries are written in sorted
    /// relative-path order and directories get no entries of their own.
    pub fn build_tar(
        &self,
        output: &Path,
        source_dir: &Path,
        include: &dyn Fn(&Path) -> bool,
    ) -> Result<TarSummary> {
        let files = collect_files(source_dir, include)?;

        let out = File::create(output).map_err(|e| Error::io("create", output, e))?;
        let encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut summary = TarSummary::default();
        for (rel, abs) in files {
            let name = rel
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let attrs = self.normalizer.classify(name, &abs)?;
            let md = fs::metadata(&abs).map_err(|e| Error::io("stat", &abs, e))?;
            let mut f = File::open(&abs).map_err(|e| Error::io("open", &abs, e))?;

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_mode(attrs.mode);
            header.set_uid(attrs.uid);
            header.set_gid(attrs.gid);
            header
                .set_username(attrs.owner)
                .map_err(|e| Error::io("set owner for", &abs, e))?;
            header
                .set_groupname(attrs.group)
                .map_err(|e| Error::io("set group for", &abs, e))?;
            header.set_mtime(self.mtime);
            header.set_cksum();

            let entry_name = archive_name(&rel);
            builder
                .append_data(&mut header, &entry_name, &mut f)
                .map_err(|e| Error::io("append", &abs, e))?;
            tracing::trace!(entry = %entry_name, mode = %format!("{:o}", attrs.mode), "tar entry");
            summary.total_bytes += md.len();
            summary.entries.push(entry_name);
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::io("finalize tar", output, e))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| Error::io("finish gzip", output, e))?;
        std::io::Write::flush(&mut writer).map_err(|e| Error::io("flush", output, e))?;
        Ok(summary)
    }
}

fn collect_files(
    source_dir: &Path,
    include: &dyn Fn(&Path) -> bool,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    if !source_dir.is_dir() {
        return Err(Error::Filesystem(format!(
            "tar source {} is not a directory",
            source_dir.display()
        )));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(source_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|ent| {
            ent.path()
                .strip_prefix(source_dir)
                .map(|rel| rel.as_os_str().is_empty() || include(rel))
                .unwrap_or(false)
        });
    for ent in walker {
        let ent = ent?;
        if !ent.file_type().is_file() {
            continue;
        }
        let rel = ent
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| Error::msg(format!("walk escaped {}: {e}", source_dir.display())))?
            .to_path_buf();
        files.push((rel, ent.path().to_path_buf()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn archive_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Include predicate that prunes one top-level directory.
pub fn exclude_top_level(dir: &str) -> impl Fn(&Path) -> bool + '_ {
    move |rel: &Path| {
        rel.components()
            .next()
            .is_none_or(|first| first.as_os_str() != dir)
    }
}
