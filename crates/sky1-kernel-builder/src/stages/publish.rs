use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;

use sky1_kernel_builder_macros::{Stage, Step};

use crate::artifacts::{
    ArtifactManifest, DebFile, MANIFEST_FILE, filter_version, multi_version_warning,
};
use crate::config::ConfigDoc;
use crate::error::ErrorKind;
use crate::executor::{ExecCtx, require_tools};
use crate::repo::{PublishedPackage, check_no_downgrade, published_family, removal_set};
use crate::stages::util::{VariantCtx, default_true, pause_after_warning};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// reprepro base directory.
    pub repo: String,
    pub distribution: String,
    /// Defaults to the variant's component.
    pub component: Option<String>,
    #[serde(default = "default_true")]
    pub remove_old: bool,
    /// Publish exactly these files instead of the collected manifest.
    pub files: Vec<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repo: "@apt_repo".into(),
            distribution: "trixie".into(),
            component: None,
            remove_old: true,
            files: Vec::new(),
        }
    }
}

struct PublishTarget {
    repo: PathBuf,
    distribution: String,
    component: String,
}

impl PublishTarget {
    fn load(doc: &ConfigDoc, vc: &VariantCtx) -> Result<(PublishConfig, Self)> {
        let cfg: PublishConfig = doc.deserialize_path("publish")?.unwrap_or_default();
        let target = Self {
            repo: vc.ws.resolve_config_path(&cfg.repo)?,
            distribution: cfg.distribution.clone(),
            component: cfg
                .component
                .clone()
                .unwrap_or_else(|| vc.variant.component.clone()),
        };
        Ok((cfg, target))
    }

    fn reprepro(&self) -> Command {
        let mut cmd = Command::new("reprepro");
        cmd.arg("-b").arg(&self.repo).arg("-C").arg(&self.component);
        cmd
    }

    /// What the component currently holds of the variant's package family.
    /// Empty when the repository cannot be queried in dry-run mode.
    fn published(&self, ctx: &ExecCtx, patterns: &[String]) -> Result<Vec<PublishedPackage>> {
        if ctx.dry_run && (!self.repo.is_dir() || require_tools(&["reprepro"]).is_err()) {
            ctx.log(&format!(
                "DRY-RUN: repository {} not queryable; assuming it is empty",
                self.repo.display()
            ));
            return Ok(Vec::new());
        }
        if !self.repo.is_dir() {
            return Err(Error::missing(format!(
                "APT repository {} not found (set [publish].repo or SKB_PATH_APT_REPO)",
                self.repo.display()
            )));
        }
        let mut cmd = self.reprepro();
        cmd.arg("list").arg(&self.distribution);
        let listing = ctx.query_cmd(cmd)?;
        published_family(&listing, &self.component, patterns)
    }
}

/// Packages to publish: the explicit file list when given, otherwise the
/// collected manifest, narrowed by `[build].version_filter`.
fn incoming(ctx: &ExecCtx, vc: &VariantCtx, cfg: &PublishConfig) -> Result<Vec<DebFile>> {
    let paths: Vec<PathBuf> = if cfg.files.is_empty() {
        let out_dir = vc.out_dir()?;
        if ctx.dry_run && !out_dir.join(MANIFEST_FILE).is_file() {
            ctx.log(&format!(
                "DRY-RUN: no {MANIFEST_FILE} in {} yet",
                out_dir.display()
            ));
            return Ok(Vec::new());
        }
        ArtifactManifest::read(&out_dir)?.paths(&out_dir)
    } else {
        cfg.files
            .iter()
            .map(|f| vc.ws.resolve_config_path(f))
            .collect::<Result<_>>()?
    };

    let mut debs = Vec::with_capacity(paths.len());
    for path in paths {
        if !ctx.dry_run && !path.is_file() {
            return Err(Error::missing(format!("{} does not exist", path.display())));
        }
        debs.push(DebFile::parse(&path)?);
    }
    if let Some(filter) = vc.settings.version_filter.as_deref() {
        let before = debs.len();
        debs = filter_version(debs, filter);
        ctx.log(&format!(
            "version filter '{filter}' kept {} of {before} package(s)",
            debs.len()
        ));
    }
    if debs.is_empty() && !ctx.dry_run {
        return Err(Error::new(ErrorKind::NoArtifacts, "nothing to publish"));
    }
    Ok(debs)
}

#[Step(
    id = "publish.verify",
    stage = "publish",
    phase = "verify",
    provides = ["publish:verified"],
    after = ["package:meta?", "package:fixed?"],
    default_label = "Check for downgrades",
    required = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for VerifyStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl VerifyStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let (cfg, target) = PublishTarget::load(doc, &vc)?;
        let debs = incoming(ctx, &vc, &cfg)?;
        if let Some(warning) = multi_version_warning(&debs) {
            ctx.warn(&warning);
            pause_after_warning(ctx, vc.settings.multi_version_delay_secs);
        }

        let published = target.published(ctx, &vc.variant.artifact_patterns())?;
        ctx.log(&format!(
            "{} package(s) of this family published in {}/{}",
            published.len(),
            target.distribution,
            target.component
        ));
        check_no_downgrade(&published, &debs)?;
        ctx.log(&format!("{} package(s) clear to publish", debs.len()));
        Ok(())
    }
}

#[Step(
    id = "publish.upload",
    stage = "publish",
    phase = "upload",
    provides = ["publish:done"],
    after = ["publish.verify"],
    tools = ["reprepro"],
    default_label = "Publish to APT repository"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for UploadStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl UploadStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let (cfg, target) = PublishTarget::load(doc, &vc)?;
        let debs = incoming(ctx, &vc, &cfg)?;

        if cfg.remove_old {
            let patterns = vc.variant.artifact_patterns();
            let published = target.published(ctx, &patterns)?;
            let old = removal_set(&published, &patterns)?;
            if old.is_empty() {
                ctx.log("no earlier packages of this family to remove");
            } else {
                ctx.log(&format!(
                    "removing {}",
                    old.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
                let mut cmd = target.reprepro();
                cmd.arg("remove").arg(&target.distribution).args(&old);
                ctx.run_cmd(cmd)?;
            }
        }

        if debs.is_empty() {
            return Ok(());
        }
        let mut cmd = target.reprepro();
        cmd.arg("includedeb")
            .arg(&target.distribution)
            .args(debs.iter().map(|d| &d.path));
        ctx.run_cmd(cmd)?;
        ctx.log(&format!(
            "published {} package(s) to {}/{}",
            debs.len(),
            target.distribution,
            target.component
        ));
        Ok(())
    }
}

#[Stage(id = "publish", steps = [VerifyStep, UploadStep])]
pub struct PublishStage;
