use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{ConfigDoc, PackageConfig};
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::fetch;
use crate::icon;
use crate::modules::core::INIT_TASK_ID;
use crate::modules::{Module, util};
use crate::planner::{Plan, Task};
use crate::workspace::{self, WorkspacePaths};

const STAGE_TASK_ID: &str = "layout.stage";
const PAYLOAD_TASK_ID: &str = "layout.payload";
const CONTROL_TASK_ID: &str = "layout.control";
const ICON_TASK_ID: &str = "layout.icon";

/// File names the package manager expects under `CONTROL/`.
pub const MANIFEST_NAME: &str = "config.json";
pub const SCRIPT_NAME: &str = "start-stop.sh";
pub const DESCRIPTION_NAME: &str = "description.txt";
pub const CHANGELOG_NAME: &str = "changelog.txt";
pub const ICON_NAME: &str = "icon.png";

pub struct LayoutModule;

impl Module for LayoutModule {
    fn id(&self) -> &'static str {
        "layout"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, _doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let step = |id: &str, label: &str, phase: &str, after: &str, token: &str| Task {
            id: id.into(),
            label: label.into(),
            module: "layout".into(),
            phase: phase.into(),
            after: vec![after.into()],
            provides: vec![token.into()],
        };
        plan.add(step(STAGE_TASK_ID, "Reset staging tree", "stage", INIT_TASK_ID, "layout:tree"))?;
        plan.add(step(PAYLOAD_TASK_ID, "Stage payload binary", "payload", STAGE_TASK_ID, "layout:payload"))?;
        plan.add(step(CONTROL_TASK_ID, "Stage control files", "control", STAGE_TASK_ID, "layout:control"))?;
        plan.add(step(ICON_TASK_ID, "Resolve icon", "icon", STAGE_TASK_ID, "layout:icon"))?;
        Ok(())
    }
}

impl ModuleExec for LayoutModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(STAGE_TASK_ID, exec_stage)?;
        reg.add(PAYLOAD_TASK_ID, exec_payload)?;
        reg.add(CONTROL_TASK_ID, exec_control)?;
        reg.add(ICON_TASK_ID, exec_icon)
    }
}

/// Manifest and lifecycle script paths; either one missing aborts the build.
pub fn required_inputs(pkg: &PackageConfig, ws: &WorkspacePaths) -> Result<(PathBuf, PathBuf)> {
    let manifest = ws.resolve_config_path(&pkg.control.manifest)?;
    let script = ws.resolve_config_path(&pkg.control.script)?;
    for p in [&manifest, &script] {
        if !p.is_file() {
            return Err(Error::MissingInput(p.clone()));
        }
    }
    Ok((manifest, script))
}

pub fn cache_path(pkg: &PackageConfig, ws: &WorkspacePaths) -> Result<PathBuf> {
    ws.resolve_config_path(&pkg.expand(&pkg.cache_path)?)
}

fn exec_stage(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let staging = ws.staging_dir();
    if staging.exists() {
        ctx.log(&format!("removing previous staging tree {}", staging.display()));
        workspace::safe_remove_dir_all(&ws.build_dir, &staging)?;
    }
    util::ensure_dir(&ws.control_dir())?;
    util::ensure_dir(&ws.bin_dir())?;
    Ok(())
}

fn exec_payload(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let pkg = PackageConfig::load(doc)?;
    let cached = cache_path(&pkg, &ws)?;
    let url = pkg.binary_url()?;

    if fetch::ensure_cached(ctx.fetcher.as_ref(), &url, &cached)? {
        ctx.log(&format!("downloaded {url}"));
    } else {
        ctx.log(&format!("using cached {}", cached.display()));
    }
    if let Some(expected) = pkg.binary_sha256.as_deref() {
        fetch::verify_sha256(&cached, expected)?;
        ctx.log("payload sha256 verified");
    }

    let dst = ws.bin_dir().join(pkg.binary_name());
    util::copy_file(&cached, &dst)?;
    util::set_mode(&dst, 0o755)?;
    tracing::info!(payload = %dst.display(), "payload staged");
    Ok(())
}

fn exec_control(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let pkg = PackageConfig::load(doc)?;
    let control = ws.control_dir();
    let (manifest, script) = required_inputs(&pkg, &ws)?;

    util::copy_file(&manifest, &control.join(MANIFEST_NAME))?;

    let raw = fs::read(&script).map_err(|e| Error::io("read", &script, e))?;
    let normalized = util::normalize_line_endings(&raw);
    if normalized.len() != raw.len() {
        ctx.log(&format!(
            "converted {} CRLF line endings in {}",
            raw.len() - normalized.len(),
            script.display()
        ));
    }
    let script_dst = control.join(SCRIPT_NAME);
    util::write_bytes(&script_dst, &normalized)?;
    util::set_mode(&script_dst, 0o755)?;

    stage_text_or_default(
        ctx,
        &ws,
        &pkg.control.description,
        &pkg.control.default_description,
        &control.join(DESCRIPTION_NAME),
    )?;
    stage_text_or_default(
        ctx,
        &ws,
        &pkg.control.changelog,
        &pkg.control.default_changelog,
        &control.join(CHANGELOG_NAME),
    )?;
    Ok(())
}

fn stage_text_or_default(
    ctx: &ExecCtx,
    ws: &WorkspacePaths,
    raw_src: &str,
    default_text: &str,
    dst: &Path,
) -> Result<()> {
    if !raw_src.trim().is_empty() {
        let src = ws.resolve_config_path(raw_src)?;
        if src.is_file() {
            util::copy_file(&src, dst)?;
            return Ok(());
        }
    }
    ctx.log(&format!(
        "{} not provided, using default text",
        dst.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    ));
    util::write_text(dst, default_text)
}

fn exec_icon(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let pkg = PackageConfig::load(doc)?;
    let sources = icon::default_sources(&pkg, &ws)?;
    let used = icon::resolve_icon(ctx, &sources, &ws.control_dir().join(ICON_NAME))?;
    ctx.log(&format!("icon source: {used}"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ws_at(root: &Path) -> WorkspacePaths {
        WorkspacePaths {
            root: root.to_path_buf(),
            build_dir: root.join("build"),
            out_dir: root.join("out"),
            named_dirs: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_manifest_is_reported_by_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join(SCRIPT_NAME), "#!/bin/sh\n").expect("write script");
        let pkg = PackageConfig::default();

        let err = required_inputs(&pkg, &ws_at(tmp.path())).unwrap_err();
        match err {
            Error::MissingInput(p) => assert_eq!(p, tmp.path().join("config.json")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cache_path_expands_package_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pkg = PackageConfig::default();
        assert_eq!(
            cache_path(&pkg, &ws_at(tmp.path())).expect("cache path"),
            tmp.path().join("minio_bin")
        );
    }
}
