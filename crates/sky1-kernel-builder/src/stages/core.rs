use serde::Deserialize;

use sky1_kernel_builder_macros::{Stage, Step};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::stages::util::default_true;
use crate::variants::{load_variants, validate_manifest};
use crate::workspace::{WorkspaceConfig, init_dirs};
use crate::Result;

#[Step(
    id = "core.init",
    stage = "core",
    phase = "init",
    provides = ["core:initialized"],
    default_label = "Init workspace",
    required = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for InitStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl InitStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let ws = init_dirs(&ws_cfg)?;
        ctx.log(&format!("workspace.root = {}", ws.root.display()));
        ctx.log(&format!("workspace.build = {}", ws.build_dir.display()));
        ctx.log(&format!("workspace.out = {}", ws.out_dir.display()));
        for (name, dir) in &ws.named_dirs {
            ctx.log(&format!("@{name} = {}", dir.display()));
        }

        let variants = load_variants(doc)?;
        validate_manifest(&variants, |raw| ws.resolve_config_path(raw))?;
        ctx.log(&format!(
            "variants: {}",
            variants.keys().cloned().collect::<Vec<_>>().join(", ")
        ));

        ctx.set_workspace_paths(ws);
        Ok(())
    }
}

#[Stage(id = "core", steps = [InitStep])]
pub struct CoreStage;
