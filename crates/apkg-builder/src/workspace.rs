use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Staging tree directory name under `build_dir`.
pub const STAGING_DIR: &str = "build_env";
pub const CONTROL_DIR: &str = "CONTROL";
pub const BIN_DIR: &str = "bin";

pub const VERSION_MARKER_FILE: &str = "apkg-version";
pub const CONTROL_TARBALL: &str = "control.tar.gz";
pub const DATA_TARBALL: &str = "data.tar.gz";

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::None => "none",
            CleanMode::Build => "build",
            CleanMode::Out => "out",
            CleanMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    pub paths: BTreeMap<String, String>,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            paths: BTreeMap::new(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    // Resolve a user-configured path:
    // - `@alias/...` expands from `[workspace.paths.alias]`
    // - absolute paths are used as-is
    // - relative paths are rooted at workspace root
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }

        if let Some(after_at) = raw.strip_prefix('@') {
            let (alias, rest) = match after_at.split_once('/') {
                Some((a, r)) => (a.trim(), r),
                None => (after_at.trim(), ""),
            };
            let base = self.named_dirs.get(alias).ok_or_else(|| {
                let known = self.named_dirs.keys().cloned().collect::<Vec<_>>().join(", ");
                Error::config(format!(
                    "unknown workspace path alias '{alias}' in '{raw}' (known: {known})"
                ))
            })?;
            return Ok(if rest.is_empty() {
                base.clone()
            } else {
                base.join(rest)
            });
        }

        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() { pb } else { self.root.join(pb) })
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.build_dir.join(STAGING_DIR)
    }

    pub fn control_dir(&self) -> PathBuf {
        self.staging_dir().join(CONTROL_DIR)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.staging_dir().join(BIN_DIR)
    }

    pub fn version_marker_path(&self) -> PathBuf {
        self.build_dir.join(VERSION_MARKER_FILE)
    }

    pub fn control_tarball_path(&self) -> PathBuf {
        self.build_dir.join(CONTROL_TARBALL)
    }

    pub fn data_tarball_path(&self) -> PathBuf {
        self.build_dir.join(DATA_TARBALL)
    }

    pub fn intermediates(&self) -> [PathBuf; 3] {
        [
            self.version_marker_path(),
            self.control_tarball_path(),
            self.data_tarball_path(),
        ]
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = join_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;

    let mut named_dirs = BTreeMap::new();
    named_dirs.insert("root".to_string(), root.clone());
    named_dirs.insert("build".to_string(), build_dir.clone());
    named_dirs.insert("out".to_string(), out_dir.clone());
    for (name, raw) in &cfg.paths {
        let key = name.trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::config(format!(
                "workspace.paths key '{key}' is invalid (allowed: a-zA-Z0-9_-)"
            )));
        }
        if named_dirs.contains_key(key) {
            return Err(Error::config(format!(
                "workspace.paths key '{key}' is reserved"
            )));
        }
        named_dirs.insert(key.to_string(), join_user_path(&root, raw)?);
    }

    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
        named_dirs,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Build => safe_remove_dir_all(&paths.root, &paths.build_dir)?,
        CleanMode::Out => safe_remove_dir_all(&paths.root, &paths.out_dir)?,
        CleanMode::All => {
            safe_remove_dir_all(&paths.root, &paths.build_dir)?;
            safe_remove_dir_all(&paths.root, &paths.out_dir)?;
        }
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir).map_err(|e| Error::io("create", dir, e))?;
    }
    Ok(paths)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    join_user_path(root, p)
}

fn join_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

/// Remove `dir` recursively, refusing `base` itself and anything outside it.
pub fn safe_remove_dir_all(base: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let base_can = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&base_can) || dir_can == base_can {
        return Err(Error::Filesystem(format!(
            "refusing to remove '{}' (outside '{}')",
            dir_can.display(),
            base_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can).map_err(|e| Error::io("remove dir", &dir_can, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_at(root: &Path) -> WorkspacePaths {
        let mut named_dirs = BTreeMap::new();
        named_dirs.insert("root".into(), root.to_path_buf());
        named_dirs.insert("build".into(), root.join("build"));
        named_dirs.insert("out".into(), root.join("out"));
        named_dirs.insert("assets".into(), root.join("assets"));
        WorkspacePaths {
            root: root.to_path_buf(),
            build_dir: root.join("build"),
            out_dir: root.join("out"),
            named_dirs,
        }
    }

    #[test]
    fn resolve_alias_and_relative_paths() {
        let root = PathBuf::from("/tmp/apkg-root");
        let ws = paths_at(&root);

        assert_eq!(
            ws.resolve_config_path("config.json").expect("relative path"),
            root.join("config.json")
        );
        assert_eq!(
            ws.resolve_config_path("@assets/icon.png").expect("alias path"),
            root.join("assets/icon.png")
        );
        assert!(ws.resolve_config_path("@nope/icon.png").is_err());
        assert_eq!(
            ws.staging_dir().join(CONTROL_DIR),
            root.join("build/build_env/CONTROL")
        );
    }

    #[test]
    fn refuses_to_remove_outside_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("root");
        let other = tmp.path().join("other");
        fs::create_dir_all(&root).expect("mkdir root");
        fs::create_dir_all(&other).expect("mkdir other");

        assert!(safe_remove_dir_all(&root, &other).is_err());
        assert!(other.exists());
        assert!(safe_remove_dir_all(&root, &root).is_err());
    }

    #[test]
    fn clean_build_removes_previous_build_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            root_dir: tmp.path().display().to_string(),
            clean: CleanMode::Build,
            ..WorkspaceConfig::default()
        };
        let stale = tmp.path().join("build/stale.txt");
        fs::create_dir_all(stale.parent().expect("parent")).expect("mkdir");
        fs::write(&stale, "x").expect("write stale");

        let paths = init_dirs(&cfg).expect("init");
        assert!(paths.build_dir.is_dir());
        assert!(!stale.exists());
    }
}
