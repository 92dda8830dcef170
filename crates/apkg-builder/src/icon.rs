//! Package icon resolution.
//!
//! Sources are tried in order until one produces `CONTROL/icon.png`. Any
//! failure falls through to the next source, and the list always ends with
//! an empty placeholder, so a broken icon never fails the build.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::package::{IconConfig, PackageConfig};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::workspace::WorkspacePaths;

pub const BRAND_COLOR_TOKEN: &str = "{{BRAND_COLOR}}";

const EMBEDDED_SVG: &str = include_str!("../assets/icon.svg");

pub trait IconSource {
    fn name(&self) -> &'static str;
    fn produce(&self, ctx: &ExecCtx, dest: &Path) -> Result<()>;
}

/// A raster icon supplied by the user in the workspace.
pub struct LocalRaster {
    pub path: PathBuf,
}

impl IconSource for LocalRaster {
    fn name(&self) -> &'static str {
        "local"
    }

    fn produce(&self, ctx: &ExecCtx, dest: &Path) -> Result<()> {
        if !self.path.is_file() {
            return Err(Error::msg(format!("{} not present", self.path.display())));
        }
        ctx.log(&format!("using local icon {}", self.path.display()));
        util::copy_file(&self.path, dest)?;
        Ok(())
    }
}

/// The built-in vector icon, rendered by whichever converter is installed.
pub struct EmbeddedVector {
    pub brand_color: String,
    pub width: u32,
    pub converters: Vec<String>,
}

impl EmbeddedVector {
    pub fn svg(&self) -> String {
        EMBEDDED_SVG.replace(BRAND_COLOR_TOKEN, &self.brand_color)
    }

    fn find_converter(&self) -> Option<(String, PathBuf)> {
        self.converters.iter().find_map(|name| {
            which::which(name)
                .ok()
                .map(|path| (name.clone(), path))
        })
    }
}

impl IconSource for EmbeddedVector {
    fn name(&self) -> &'static str {
        "embedded-vector"
    }

    fn produce(&self, ctx: &ExecCtx, dest: &Path) -> Result<()> {
        let Some((name, program)) = self.find_converter() else {
            return Err(Error::msg(format!(
                "no SVG converter found (tried: {})",
                self.converters.join(", ")
            )));
        };

        // Both temporaries go away with the directory.
        let tmp = tempfile::tempdir().map_err(|e| Error::msg(format!("tempdir: {e}")))?;
        let svg = tmp.path().join("icon.svg");
        let png = tmp.path().join("icon.png");
        util::write_text(&svg, &self.svg())?;

        ctx.log(&format!("rendering embedded icon with {name}"));
        ctx.run_cmd(converter_command(&name, &program, &svg, self.width, &png))?;

        let rendered = std::fs::metadata(&png).map(|m| m.len()).unwrap_or(0);
        if rendered == 0 {
            return Err(Error::msg(format!("{name} produced no output")));
        }
        util::copy_file(&png, dest)?;
        Ok(())
    }
}

fn converter_command(name: &str, program: &Path, input: &Path, width: u32, output: &Path) -> Command {
    let stem = Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let mut cmd = Command::new(program);
    match stem {
        "rsvg-convert" => {
            cmd.arg("-w").arg(width.to_string()).arg("-o").arg(output).arg(input);
        }
        "inkscape" => {
            cmd.arg(input)
                .arg("--export-type=png")
                .arg(format!("--export-width={width}"))
                .arg(format!("--export-filename={}", output.display()));
        }
        "magick" | "convert" => {
            cmd.arg("-background")
                .arg("none")
                .arg(input)
                .arg("-resize")
                .arg(format!("{width}x"))
                .arg(output);
        }
        // Anything else gets `<tool> <input> <width> <output>`.
        _ => {
            cmd.arg(input).arg(width.to_string()).arg(output);
        }
    }
    cmd
}

/// Legacy tier: download a raster icon.
pub struct RemoteRaster {
    pub url: String,
}

impl IconSource for RemoteRaster {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn produce(&self, ctx: &ExecCtx, dest: &Path) -> Result<()> {
        let tmp = tempfile::tempdir().map_err(|e| Error::msg(format!("tempdir: {e}")))?;
        let downloaded = tmp.path().join("icon.png");
        ctx.log(&format!("downloading fallback icon from {}", self.url));
        ctx.fetcher.fetch(&self.url, &downloaded)?;
        util::copy_file(&downloaded, dest)?;
        Ok(())
    }
}

pub struct Placeholder;

impl IconSource for Placeholder {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn produce(&self, ctx: &ExecCtx, dest: &Path) -> Result<()> {
        ctx.log("no icon available, writing empty placeholder");
        util::write_bytes(dest, &[])
    }
}

pub fn default_sources(pkg: &PackageConfig, ws: &WorkspacePaths) -> Result<Vec<Box<dyn IconSource>>> {
    let cfg: &IconConfig = &pkg.icon;
    let mut out: Vec<Box<dyn IconSource>> = Vec::new();
    if !cfg.local.trim().is_empty() {
        out.push(Box::new(LocalRaster {
            path: ws.resolve_config_path(&cfg.local)?,
        }));
    }
    out.push(Box::new(EmbeddedVector {
        brand_color: cfg.brand_color.clone(),
        width: cfg.width,
        converters: cfg.converters.clone(),
    }));
    if let Some(url) = cfg.fallback_url.as_deref().filter(|u| !u.trim().is_empty()) {
        out.push(Box::new(RemoteRaster {
            url: pkg.expand(url)?,
        }));
    }
    Ok(out)
}

/// Try `sources` in order, ending with the placeholder. Returns the name of
/// the source that produced the icon. Only a failure to write the
/// placeholder itself is returned as an error.
pub fn resolve_icon(ctx: &ExecCtx, sources: &[Box<dyn IconSource>], dest: &Path) -> Result<&'static str> {
    for source in sources {
        match source.produce(ctx, dest) {
            Ok(()) => return Ok(source.name()),
            Err(e) => {
                tracing::warn!(source = source.name(), error = %e, "icon source failed");
                ctx.log(&format!("icon source '{}' skipped: {e}", source.name()));
                if let Err(rm) = util::remove_file_if_exists(dest) {
                    tracing::warn!(source = source.name(), error = %rm, "could not remove partial icon");
                }
            }
        }
    }
    Placeholder.produce(ctx, dest)?;
    Ok(Placeholder.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::channel_sink;
    use std::fs;

    fn ctx() -> ExecCtx {
        let (sink, _rx) = channel_sink();
        ExecCtx::new(false, sink)
    }

    struct Broken;

    impl IconSource for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn produce(&self, _ctx: &ExecCtx, dest: &Path) -> Result<()> {
            fs::write(dest, b"partial")?;
            Err(Error::msg("boom"))
        }
    }

    struct DirInTheWay;

    impl IconSource for DirInTheWay {
        fn name(&self) -> &'static str {
            "dir-in-the-way"
        }

        fn produce(&self, _ctx: &ExecCtx, dest: &Path) -> Result<()> {
            fs::create_dir_all(dest.join("nested"))?;
            Err(Error::msg("left a directory behind"))
        }
    }

    #[test]
    fn unremovable_leftover_only_fails_at_placeholder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dest = tmp.path().join("icon.png");
        let sources: Vec<Box<dyn IconSource>> = vec![Box::new(DirInTheWay)];

        let err = resolve_icon(&ctx(), &sources, &dest).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Filesystem);
        assert!(err.to_string().contains("write"), "unexpected err: {err}");
    }

    #[test]
    fn local_icon_is_copied_verbatim() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let local = tmp.path().join("icon.png");
        fs::write(&local, b"\x89PNG fake").expect("write icon");
        let dest = tmp.path().join("CONTROL/icon.png");

        let sources: Vec<Box<dyn IconSource>> = vec![Box::new(LocalRaster { path: local })];
        assert_eq!(resolve_icon(&ctx(), &sources, &dest).expect("resolve"), "local");
        assert_eq!(fs::read(&dest).expect("read"), b"\x89PNG fake");
    }

    #[test]
    fn failures_degrade_to_empty_placeholder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dest = tmp.path().join("icon.png");
        let sources: Vec<Box<dyn IconSource>> = vec![
            Box::new(LocalRaster {
                path: tmp.path().join("missing.png"),
            }),
            Box::new(Broken),
            Box::new(EmbeddedVector {
                brand_color: "#C72E49".into(),
                width: 256,
                converters: vec!["apkg-no-such-converter".into()],
            }),
        ];

        assert_eq!(
            resolve_icon(&ctx(), &sources, &dest).expect("resolve"),
            "placeholder"
        );
        assert_eq!(fs::metadata(&dest).expect("stat").len(), 0);
    }

    #[test]
    fn embedded_svg_carries_brand_color() {
        let v = EmbeddedVector {
            brand_color: "#123456".into(),
            width: 64,
            converters: vec![],
        };
        let svg = v.svg();
        assert!(svg.contains("#123456"));
        assert!(!svg.contains(BRAND_COLOR_TOKEN));
    }

    #[cfg(unix)]
    #[test]
    fn embedded_vector_runs_converter_and_cleans_temporaries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tool = tmp.path().join("fake-convert");
        let seen = tmp.path().join("seen-input");
        fs::write(
            &tool,
            format!(
                "#!/bin/sh\ncp \"$1\" \"$3\"\nprintf '%s' \"$1\" > '{}'\n",
                seen.display()
            ),
        )
        .expect("write tool");
        util::set_mode(&tool, 0o755).expect("chmod tool");
        let dest = tmp.path().join("icon.png");

        let sources: Vec<Box<dyn IconSource>> = vec![Box::new(EmbeddedVector {
            brand_color: "#abcdef".into(),
            width: 128,
            converters: vec![tool.display().to_string()],
        })];
        assert_eq!(
            resolve_icon(&ctx(), &sources, &dest).expect("resolve"),
            "embedded-vector"
        );
        let got = fs::read_to_string(&dest).expect("read icon");
        assert!(got.contains("#abcdef"));

        let svg_input = PathBuf::from(fs::read_to_string(&seen).expect("read seen input"));
        assert!(svg_input.ends_with("icon.svg"));
        assert!(!svg_input.exists());
        assert!(!svg_input.parent().expect("temp dir").exists());
    }
}
