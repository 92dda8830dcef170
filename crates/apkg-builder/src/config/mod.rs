use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub mod package;

pub use package::PackageConfig;

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    /// Parse an in-memory document; imports and extends are not resolved.
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn top_level_keys(&self) -> Vec<&str> {
        self.value
            .as_table()
            .map(|t| t.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid table '{path}': {e}")))?;
        Ok(Some(parsed))
    }
}

/// Deep merge: tables merge key by key, anything else is replaced by `overlay`.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn relative_to(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        return p;
    }
    from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
}

fn take_imports(file: &Path, tbl: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = raw else {
        return Err(Error::config(format!(
            "'imports' in {} must be an array of strings",
            file.display()
        )));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Value::String(s) = item else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                file.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

// Imports apply at any table level; local keys override imported ones.
fn inline_imports(file: &Path, value: &mut Value, seen: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = take_imports(file, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            merge(&mut acc, load_value(&relative_to(file, &imp), seen)?);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, child) in tbl.iter_mut() {
        inline_imports(file, child, seen)?;
    }
    Ok(())
}

fn load_value(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(key.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            key.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(tbl) = value.as_table_mut()
        && let Some(ext) = tbl.remove("extends")
    {
        let Value::String(ext) = ext else {
            return Err(Error::config(format!(
                "'extends' in {} must be a string",
                path.display()
            )));
        };
        out = load_value(&relative_to(path, &ext), seen)?;
    }

    inline_imports(path, &mut value, seen)?;
    merge(&mut out, value);

    seen.remove(&key);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut seen = HashSet::new();
    let value = load_value(path, &mut seen)?;
    tracing::debug!(config = %path.display(), "loaded build config");
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_with_local_precedence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::write(
            dir.join("base.toml"),
            "[package]\nname = \"base\"\narch = \"arm64\"\n",
        )
        .expect("write base");
        fs::write(
            dir.join("icon.toml"),
            "brand_color = \"#000000\"\nwidth = 128\n",
        )
        .expect("write icon");
        fs::write(
            dir.join("apkg.toml"),
            r#"
extends = "base.toml"

[package]
name = "minio"

[package.icon]
imports = ["icon.toml"]
width = 256
"#,
        )
        .expect("write main");

        let doc = load(&dir.join("apkg.toml")).expect("load");
        let get = |p: &str| doc.value_path(p).cloned();
        assert_eq!(get("package.name"), Some(Value::String("minio".into())));
        assert_eq!(get("package.arch"), Some(Value::String("arm64".into())));
        assert_eq!(
            get("package.icon.brand_color"),
            Some(Value::String("#000000".into()))
        );
        assert_eq!(get("package.icon.width"), Some(Value::Integer(256)));
        assert!(doc.value_path("extends").is_none());
        assert!(doc.value_path("package.icon.imports").is_none());
    }

    #[test]
    fn import_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::write(dir.join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(dir.join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&dir.join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cycle"), "unexpected err: {err}");
    }
}
