use std::path::{Path, PathBuf};

use crate::archive::attrs::AttributeNormalizer;
use crate::archive::container::{self, FORMAT_VERSION, MEMBERS};
use crate::archive::tarball::{MtimePolicy, TarAssembler, exclude_top_level};
use crate::config::{ConfigDoc, PackageConfig};
use crate::error::Result;
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::fetch;
use crate::modules::{Module, util};
use crate::planner::{LAYOUT_DONE, Plan, Task};
use crate::workspace::{self, CONTROL_DIR, WorkspacePaths};

const CONTROL_TAR_TASK_ID: &str = "package.control-tar";
const DATA_TAR_TASK_ID: &str = "package.data-tar";
const CONTAINER_TASK_ID: &str = "package.container";
const CLEANUP_TASK_ID: &str = "package.cleanup";

pub struct PackageModule;

impl Module for PackageModule {
    fn id(&self) -> &'static str {
        "package"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, _doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        plan.add(Task {
            id: CONTROL_TAR_TASK_ID.into(),
            label: "Tar control subtree".into(),
            module: self.id().into(),
            phase: "tar".into(),
            after: vec![LAYOUT_DONE.into()],
            provides: vec!["package:control".into()],
        })?;
        plan.add(Task {
            id: DATA_TAR_TASK_ID.into(),
            label: "Tar data subtree".into(),
            module: self.id().into(),
            phase: "tar".into(),
            after: vec![LAYOUT_DONE.into()],
            provides: vec!["package:data".into()],
        })?;
        plan.add(Task {
            id: CONTAINER_TASK_ID.into(),
            label: "Write package container".into(),
            module: self.id().into(),
            phase: "container".into(),
            after: vec!["package:control".into(), "package:data".into()],
            provides: vec!["package:container".into()],
        })?;
        plan.add(Task {
            id: CLEANUP_TASK_ID.into(),
            label: "Remove intermediates".into(),
            module: self.id().into(),
            phase: "cleanup".into(),
            after: vec![CONTAINER_TASK_ID.into()],
            provides: vec![],
        })
    }
}

impl ModuleExec for PackageModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(CONTROL_TAR_TASK_ID, exec_control_tar)?;
        reg.add(DATA_TAR_TASK_ID, exec_data_tar)?;
        reg.add(CONTAINER_TASK_ID, exec_container)?;
        reg.add(CLEANUP_TASK_ID, exec_cleanup)
    }
}

pub fn artifact_path(pkg: &PackageConfig, ws: &WorkspacePaths) -> Result<PathBuf> {
    Ok(ws.out_dir.join(pkg.artifact_file_name()?))
}

fn assembler_inputs(doc: &ConfigDoc) -> Result<(PackageConfig, AttributeNormalizer, u64)> {
    let pkg = PackageConfig::load(doc)?;
    let normalizer = AttributeNormalizer::new(pkg.archive.script_suffixes.iter().cloned());
    let mtime = MtimePolicy::from_config(pkg.archive.mtime).resolve();
    Ok((pkg, normalizer, mtime))
}

fn exec_control_tar(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let (_, normalizer, mtime) = assembler_inputs(doc)?;
    let out = ws.control_tarball_path();
    let summary = TarAssembler::new(&normalizer, mtime).build_tar(&out, &ws.control_dir(), &|_| true)?;
    ctx.log(&format!(
        "{}: {} entries ({})",
        out.display(),
        summary.entries.len(),
        summary.entries.join(", ")
    ));
    Ok(())
}

fn exec_data_tar(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let (_, normalizer, mtime) = assembler_inputs(doc)?;
    let out = ws.data_tarball_path();
    let summary = TarAssembler::new(&normalizer, mtime).build_tar(
        &out,
        &ws.staging_dir(),
        &exclude_top_level(CONTROL_DIR),
    )?;
    ctx.log(&format!(
        "{}: {} entries, {} bytes",
        out.display(),
        summary.entries.len(),
        summary.total_bytes
    ));
    Ok(())
}

fn exec_container(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let pkg = PackageConfig::load(doc)?;

    let marker = ws.version_marker_path();
    util::write_text(&marker, &format!("{FORMAT_VERSION}\n"))?;

    let control = ws.control_tarball_path();
    let data = ws.data_tarball_path();
    let sources: [&Path; 3] = [&marker, &control, &data];
    let members: Vec<(&str, &Path)> = MEMBERS.iter().copied().zip(sources).collect();

    let out = artifact_path(&pkg, &ws)?;
    container::write_container(&out, &members)?;
    ctx.record_artifact(out.clone());
    let digest = fetch::sha256_file(&out)?;
    tracing::info!(artifact = %out.display(), sha256 = %digest, "container written");
    ctx.log(&format!("wrote {} (sha256 {digest})", out.display()));
    Ok(())
}

fn exec_cleanup(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    remove_build_state(&ws)?;
    ctx.log("removed staging tree and intermediates (payload cache kept)");
    Ok(())
}

/// Remove the staging tree and the three intermediates. The payload cache
/// lives outside both and is never touched.
pub fn remove_build_state(ws: &WorkspacePaths) -> Result<()> {
    for p in ws.intermediates() {
        util::remove_file_if_exists(&p)?;
    }
    workspace::safe_remove_dir_all(&ws.build_dir, &ws.staging_dir())
}
