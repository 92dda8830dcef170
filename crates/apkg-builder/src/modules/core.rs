use crate::config::{ConfigDoc, PackageConfig};
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::{Module, layout};
use crate::planner::{LAYOUT_BARRIER_ID, Plan, Task};
use crate::workspace::WorkspaceConfig;

pub const INIT_TASK_ID: &str = "core.init";

const KNOWN_TABLES: [&str; 2] = ["workspace", "package"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for key in doc.top_level_keys() {
            if !KNOWN_TABLES.contains(&key) {
                return Err(Error::config(format!(
                    "config table '{key}' is not supported; use workspace and package"
                )));
            }
        }

        plan.add(Task {
            id: INIT_TASK_ID.into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

impl ModuleExec for CoreModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(INIT_TASK_ID, core_init)?;
        reg.add(LAYOUT_BARRIER_ID, core_barrier_layout)
    }
}

// Resolves the workspace and checks the hard-required inputs before any
// staging directory exists.
fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let pkg = PackageConfig::load(doc)?;

    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.set_workspace_paths(paths.clone());
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.build_dir = {}", paths.build_dir.display()));
    ctx.log(&format!("workspace.out_dir = {}", paths.out_dir.display()));

    let (manifest, script) = layout::required_inputs(&pkg, &paths)?;
    ctx.log(&format!("manifest = {}", manifest.display()));
    ctx.log(&format!("lifecycle script = {}", script.display()));
    ctx.log(&format!(
        "building {} for {}",
        pkg.artifact_file_name()?,
        pkg.arch
    ));
    Ok(())
}

fn core_barrier_layout(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.log("staging tree complete");
    Ok(())
}
