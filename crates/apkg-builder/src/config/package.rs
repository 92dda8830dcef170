use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

fn default_name() -> String {
    "minio".into()
}

fn default_version() -> String {
    "RELEASE.2025-09-07T16-13-09Z".into()
}

fn default_arch() -> String {
    "arm64".into()
}

fn default_platform() -> String {
    "linux-arm64".into()
}

fn default_binary_url() -> String {
    "https://dl.min.io/server/minio/release/{platform}/archive/minio.{version}".into()
}

fn default_cache_path() -> String {
    "{name}_bin".into()
}

fn default_artifact_name() -> String {
    "{name}_{version}_{arch}.apk".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// File name of the payload under `bin/`; defaults to `name`.
    pub binary_name: Option<String>,
    #[serde(default = "default_binary_url")]
    pub binary_url: String,
    pub binary_sha256: Option<String>,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,
    pub fetch: FetchConfig,
    pub control: ControlConfig,
    pub icon: IconConfig,
    pub archive: ArchiveConfig,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            arch: default_arch(),
            platform: default_platform(),
            binary_name: None,
            binary_url: default_binary_url(),
            binary_sha256: None,
            cache_path: default_cache_path(),
            artifact_name: default_artifact_name(),
            fetch: FetchConfig::default(),
            control: ControlConfig::default(),
            icon: IconConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 0 disables the request timeout.
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub manifest: String,
    pub script: String,
    pub description: String,
    pub changelog: String,
    pub default_description: String,
    pub default_changelog: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            manifest: "config.json".into(),
            script: "start-stop.sh".into(),
            description: "description.txt".into(),
            changelog: "changelog.txt".into(),
            default_description: "MinIO Object Storage for Asustor".into(),
            default_changelog: "Initial Version".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IconConfig {
    pub local: String,
    pub brand_color: String,
    pub width: u32,
    pub converters: Vec<String>,
    pub fallback_url: Option<String>,
}

impl Default for IconConfig {
    fn default() -> Self {
        Self {
            local: "icon.png".into(),
            brand_color: "#C72E49".into(),
            width: 256,
            converters: vec!["rsvg-convert".into(), "inkscape".into(), "magick".into()],
            fallback_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    pub mtime: Option<u64>,
    pub script_suffixes: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            mtime: None,
            script_suffixes: vec![".sh".into(), ".py".into()],
        }
    }
}

impl PackageConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let cfg: PackageConfig = doc.deserialize_path("package")?.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn binary_name(&self) -> &str {
        self.binary_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }

    /// Expand `{name}`, `{version}`, `{arch}` and `{platform}`.
    pub fn expand(&self, raw: &str) -> Result<String> {
        let out = raw
            .replace("{name}", &self.name)
            .replace("{version}", &self.version)
            .replace("{arch}", &self.arch)
            .replace("{platform}", &self.platform);
        if let Some(start) = out.find('{')
            && let Some(len) = out[start..].find('}')
        {
            return Err(Error::config(format!(
                "unknown placeholder '{}' in '{raw}'",
                &out[start..start + len + 1]
            )));
        }
        Ok(out)
    }

    pub fn binary_url(&self) -> Result<String> {
        self.expand(&self.binary_url)
    }

    pub fn artifact_file_name(&self) -> Result<String> {
        self.expand(&self.artifact_name)
    }

    fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("package.name", &self.name),
            ("package.version", &self.version),
            ("package.arch", &self.arch),
            ("package.binary_url", &self.binary_url),
            ("package.cache_path", &self.cache_path),
            ("package.control.manifest", &self.control.manifest),
            ("package.control.script", &self.control.script),
        ] {
            if value.trim().is_empty() {
                return Err(Error::config(format!("{key} must not be empty")));
            }
        }

        let bin = self.binary_name();
        if bin.contains('/') || bin.contains('\\') || bin == "." || bin == ".." {
            return Err(Error::config(format!(
                "package.binary_name '{bin}' must be a plain file name"
            )));
        }

        let artifact = self.artifact_file_name()?;
        if artifact.contains('/') || artifact.contains('\\') {
            return Err(Error::config(format!(
                "package.artifact_name '{artifact}' must be a plain file name"
            )));
        }

        if let Some(sha) = self.binary_sha256.as_deref()
            && (sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(Error::config(
                "package.binary_sha256 must be 64 hex characters",
            ));
        }

        if self.icon.width == 0 {
            return Err(Error::config("package.icon.width must be > 0"));
        }
        self.binary_url()?;
        self.expand(&self.cache_path)?;
        if let Some(url) = self.icon.fallback_url.as_deref() {
            self.expand(url)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_minio_arm64_naming() {
        let doc = ConfigDoc::parse("<mem>", "").expect("parse");
        let cfg = PackageConfig::load(&doc).expect("load");
        assert_eq!(
            cfg.artifact_file_name().expect("artifact"),
            "minio_RELEASE.2025-09-07T16-13-09Z_arm64.apk"
        );
        assert_eq!(
            cfg.binary_url().expect("url"),
            "https://dl.min.io/server/minio/release/linux-arm64/archive/minio.RELEASE.2025-09-07T16-13-09Z"
        );
        assert_eq!(cfg.binary_name(), "minio");
    }

    #[test]
    fn container_format_is_not_configurable() {
        let doc = ConfigDoc::parse("<mem>", "[package]\nformat_version = \"3.0\"\n").expect("parse");
        let err = PackageConfig::load(&doc).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("format_version"), "unexpected err: {err}");
    }

    #[test]
    fn unknown_placeholder_is_config_error() {
        let doc = ConfigDoc::parse(
            "<mem>",
            "[package]\nartifact_name = \"{name}_{flavor}.apk\"\n",
        )
        .expect("parse");
        let err = PackageConfig::load(&doc).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("{flavor}"), "unexpected err: {err}");
    }

    #[test]
    fn rejects_bad_digest_and_nested_binary_name() {
        let doc = ConfigDoc::parse("<mem>", "[package]\nbinary_sha256 = \"abc\"\n").expect("parse");
        assert!(PackageConfig::load(&doc).is_err());

        let doc =
            ConfigDoc::parse("<mem>", "[package]\nbinary_name = \"sub/minio\"\n").expect("parse");
        let err = PackageConfig::load(&doc).unwrap_err().to_string();
        assert!(err.contains("plain file name"), "unexpected err: {err}");
    }
}
