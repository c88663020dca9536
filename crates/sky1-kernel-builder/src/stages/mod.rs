//! Pipeline stages. Each stage is a group of steps planned as tasks; a full
//! run plans every enabled stage, a stage command narrows the plan to one.

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::planner::Plan;

pub mod build;
pub mod core;
pub mod package;
pub mod publish;
pub mod source;
pub mod util;

pub trait Stage {
    fn id(&self) -> &'static str;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(core::CoreStage),
        Box::new(source::SourceStage),
        Box::new(build::BuildStage),
        Box::new(package::PackageStage),
        Box::new(publish::PublishStage),
    ]
}

const KNOWN_TABLES: &[&str] = &[
    "build",
    "workspace",
    "variants",
    "kconfig",
    "core",
    "source",
    "package",
    "publish",
];

/// Plan every enabled stage of a build definition.
pub fn plan_for(doc: &ConfigDoc) -> Result<Plan> {
    if let Some(tbl) = doc.value.as_table() {
        for key in tbl.keys() {
            if !KNOWN_TABLES.contains(&key.as_str()) {
                return Err(Error::msg(format!(
                    "unknown config table '{key}' (known: {})",
                    KNOWN_TABLES.join(", ")
                )));
            }
        }
    }
    let settings = util::build_settings(doc)?;
    crate::variants::resolve_variant(doc, &settings.variant)?;

    let mut plan = Plan::default();
    for stage in builtin_stages() {
        stage.plan(doc, &mut plan)?;
    }
    Ok(plan)
}

/// Plan a single stage. Earlier stages are expected to have left their
/// results on disk.
pub fn plan_stage(doc: &ConfigDoc, stage: &str) -> Result<Plan> {
    plan_for(doc)?.subset(&[stage])
}
