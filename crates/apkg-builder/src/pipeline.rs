//! One-shot entry points used by the CLI and the integration tests.

use std::path::PathBuf;

use crate::config::{ConfigDoc, PackageConfig};
use crate::error::Result;
use crate::executor::{self, ExecCtx, TaskRegistry};
use crate::modules::{self, package, util};
use crate::planner::Plan;
use crate::workspace::{self, WorkspaceConfig};

/// Ask every detected module for its tasks and order them.
pub fn plan_for(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in modules::builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}

/// Where a build of `doc` writes its artifact. Creates nothing.
pub fn artifact_path(doc: &ConfigDoc) -> Result<PathBuf> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let pkg = PackageConfig::load(doc)?;
    package::artifact_path(&pkg, &workspace::load_paths(&ws)?)
}

/// Run the whole pipeline and return the artifact path.
///
/// On failure the staging tree, the intermediates and any artifact written
/// by this run are removed before the error is returned. The payload cache
/// is kept.
pub fn build(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<PathBuf> {
    let plan = plan_for(doc)?;
    let reg = executor::builtin_registry()?;
    let out = artifact_path(doc)?;
    run_plan(doc, &plan, &reg, ctx)?;
    Ok(out)
}

fn run_plan(doc: &ConfigDoc, plan: &Plan, reg: &TaskRegistry, ctx: &mut ExecCtx) -> Result<()> {
    let Err(e) = executor::execute_plan(doc, plan, reg, ctx) else {
        return Ok(());
    };
    for artifact in ctx.artifacts() {
        if let Err(rm) = util::remove_file_if_exists(&artifact) {
            tracing::warn!(artifact = %artifact.display(), error = %rm, "could not remove artifact of failed build");
        }
    }
    if let Some(ws) = ctx.workspace_paths() {
        if let Err(cleanup) = package::remove_build_state(&ws) {
            tracing::warn!(error = %cleanup, "cleanup after failed build did not finish");
        }
    }
    tracing::error!(kind = e.kind().as_str(), error = %e, "build failed");
    Err(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::executor::channel_sink;
    use crate::planner::Task;

    fn write_fake_artifact(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        util::write_bytes(&ws.staging_dir().join("bin/minio"), b"elf")?;
        let out = ws.out_dir.join("fake.apk");
        util::write_bytes(&out, b"PK")?;
        ctx.record_artifact(out);
        Ok(())
    }

    fn fail_late(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        Err(Error::msg("late failure"))
    }

    fn task(id: &str, after: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: vec![],
        }
    }

    #[test]
    fn failure_after_container_removes_artifact_and_staging() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc = ConfigDoc::parse(
            "<mem>",
            &format!("[workspace]\nroot_dir = '{}'\n", tmp.path().display()),
        )
        .expect("parse");

        let mut plan = Plan::default();
        plan.add(task("test.container", &[])).expect("add container");
        plan.add(task("test.after", &["test.container"])).expect("add after");
        let mut reg = TaskRegistry::default();
        reg.add("test.container", write_fake_artifact).expect("register");
        reg.add("test.after", fail_late).expect("register");

        let (sink, _rx) = channel_sink();
        let mut ctx = ExecCtx::new(false, sink);
        let err = run_plan(&doc, &plan, &reg, &mut ctx).unwrap_err();
        assert!(err.to_string().contains("late failure"), "unexpected err: {err}");

        assert!(!tmp.path().join("out/fake.apk").exists());
        assert!(!tmp.path().join("build/build_env").exists());
        assert!(tmp.path().join("out").is_dir());
    }
}
