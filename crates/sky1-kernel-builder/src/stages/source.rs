//! Source preparation: a pristine kernel tree per variant, with the variant's
//! patch set applied and recorded.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;

use sky1_kernel_builder_macros::{Stage, Step};

use crate::config::ConfigDoc;
use crate::error::ErrorKind;
use crate::executor::{ExecCtx, require_tools};
use crate::kversion::KernelVersion;
use crate::patchset::{SourceMarker, digest_patch_dir, list_patches, write_hash_marker};
use crate::stages::util::{VariantCtx, default_true, expand_version_template};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    #[default]
    Tarball,
    Git,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: SourceMode,
    pub tarball_url: String,
    /// Checkout to export from in git mode.
    pub git_repo: String,
    pub git_ref: String,
    pub download_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: SourceMode::Tarball,
            tarball_url: "https://cdn.kernel.org/pub/linux/kernel/v{major}.x/linux-{version}.tar.xz"
                .into(),
            git_repo: "@mainline".into(),
            git_ref: "v{version}".into(),
            download_timeout_secs: 600,
        }
    }
}

#[Step(
    id = "source.fetch",
    stage = "source",
    phase = "fetch",
    provides = ["source:tree"],
    after = ["core.init"],
    tools = ["tar"],
    default_label = "Fetch kernel source"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for FetchStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl FetchStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let kv = vc.settings.kernel_version()?;
        let src_cfg: SourceConfig = doc.deserialize_path("source")?.unwrap_or_default();
        let build_dir = vc.build_dir()?;
        let src_dir = vc.source_dir()?;

        ctx.log(&format!("kernel {kv} for variant '{}'", vc.variant.name));
        ctx.log(&format!("source.dir = {}", src_dir.display()));

        if !ctx.dry_run {
            fs::create_dir_all(&build_dir).map_err(|e| {
                Error::msg(format!("failed to create {}: {e}", build_dir.display()))
            })?;
            if src_dir.exists() {
                fs::remove_dir_all(&src_dir).map_err(|e| {
                    Error::msg(format!("failed to remove {}: {e}", src_dir.display()))
                })?;
            }
            fs::create_dir_all(&src_dir).map_err(|e| {
                Error::msg(format!("failed to create {}: {e}", src_dir.display()))
            })?;
        }

        let reference = match src_cfg.mode {
            SourceMode::Tarball => fetch_tarball(ctx, &src_cfg, &kv, &build_dir, &src_dir)?,
            SourceMode::Git => export_git_ref(ctx, &vc, &src_cfg, &kv, &build_dir, &src_dir)?,
        };

        if ctx.dry_run {
            return Ok(());
        }
        verify_makefile_version(&src_dir, &kv)?;
        SourceMarker {
            variant: vc.variant.name.clone(),
            kernel_version: kv.full(),
            reference: reference.clone(),
            patches_applied: 0,
            prepared_at: chrono::Utc::now().to_rfc3339(),
        }
        .write(&src_dir)?;
        ctx.log(&format!("prepared {} from {reference}", src_dir.display()));
        Ok(())
    }
}

fn tarball_name(url: &str, kv: &KernelVersion) -> String {
    url.rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("linux-{}.tar.xz", kv.full()))
}

fn fetch_tarball(
    ctx: &ExecCtx,
    cfg: &SourceConfig,
    kv: &KernelVersion,
    build_dir: &Path,
    src_dir: &Path,
) -> Result<String> {
    let url = expand_version_template(&cfg.tarball_url, kv);
    let archive = build_dir.join(tarball_name(&url, kv));
    if archive.is_file() {
        ctx.log(&format!("using cached {}", archive.display()));
    } else if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: download {url}"));
    } else {
        ctx.log(&format!("downloading {url}"));
        download(&url, &archive, cfg.download_timeout_secs)?;
    }

    let mut cmd = Command::new("tar");
    cmd.arg("-xf")
        .arg(&archive)
        .arg("-C")
        .arg(src_dir)
        .arg("--strip-components=1");
    ctx.run_cmd(cmd)?;
    Ok(url)
}

/// Download into a scratch directory next to `dest` and move it into place
/// only once complete, so an interrupted download never looks like a cached
/// archive.
fn download(url: &str, dest: &Path, timeout_secs: u64) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(url)
        .send()
        .map_err(|e| Error::missing(format!("download of {url} failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::missing(format!(
            "download of {url} failed with status {}",
            res.status()
        )));
    }
    write_complete(dest, |f| {
        res.copy_to(f)
            .map(|_| ())
            .map_err(|e| Error::msg(format!("download of {url} failed: {e}")))
    })
}

/// Write `dest` through a scratch file. Nothing is left behind when `fill`
/// fails.
fn write_complete(dest: &Path, fill: impl FnOnce(&mut fs::File) -> Result<()>) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let scratch = scratch_dir(parent, ".skb-download-")?;
    let part = scratch.path().join("part");
    let mut f = fs::File::create(&part)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", part.display())))?;
    fill(&mut f)?;
    drop(f);
    fs::rename(&part, dest)
        .map_err(|e| Error::msg(format!("failed to move download to {}: {e}", dest.display())))
}

fn scratch_dir(parent: &Path, prefix: &str) -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| Error::msg(format!("failed to create scratch dir in {}: {e}", parent.display())))
}

fn export_git_ref(
    ctx: &ExecCtx,
    vc: &VariantCtx,
    cfg: &SourceConfig,
    kv: &KernelVersion,
    build_dir: &Path,
    src_dir: &Path,
) -> Result<String> {
    if !ctx.dry_run {
        require_tools(&["git"])?;
    }
    let repo = vc.ws.resolve_config_path(&cfg.git_repo)?;
    if !ctx.dry_run && !repo.is_dir() {
        return Err(Error::missing(format!(
            "git checkout {} not found (set [workspace.paths] or its SKB_PATH_ variable)",
            repo.display()
        )));
    }
    let git_ref = expand_version_template(&cfg.git_ref, kv);
    // Removed with the scratch dir whether or not extraction succeeds.
    let scratch = if ctx.dry_run {
        None
    } else {
        Some(scratch_dir(build_dir, ".skb-export-")?)
    };
    let archive = scratch
        .as_ref()
        .map_or(build_dir, |d| d.path())
        .join("source-export.tar");

    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(&repo)
        .args(["archive", "--format=tar", "-o"])
        .arg(&archive)
        .arg(&git_ref);
    ctx.run_cmd(cmd)?;

    let mut cmd = Command::new("tar");
    cmd.arg("-xf").arg(&archive).arg("-C").arg(src_dir);
    ctx.run_cmd(cmd)?;
    Ok(format!("{}@{git_ref}", repo.display()))
}

fn verify_makefile_version(src_dir: &Path, want: &KernelVersion) -> Result<()> {
    let makefile = src_dir.join("Makefile");
    let text = fs::read_to_string(&makefile).map_err(|e| {
        Error::missing(format!("failed to read {}: {e}", makefile.display()))
    })?;
    let got = KernelVersion::from_makefile(&text)?;
    if got.release() != want.release() {
        return Err(Error::msg(format!(
            "source tree is {} but {} was requested",
            got.full(),
            want.full()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub applied: usize,
    pub digest: String,
}

/// Apply every patch of `patch_dir` to `src_dir`. A failing patch does not
/// stop the others; the run fails afterwards with the count. On success the
/// patch-set digest is recorded in the tree.
pub fn apply_patch_set(ctx: &ExecCtx, src_dir: &Path, patch_dir: &Path) -> Result<PatchOutcome> {
    if !ctx.dry_run && !src_dir.is_dir() {
        return Err(Error::missing(format!(
            "source tree {} not found; fetch it first",
            src_dir.display()
        )));
    }
    let patches = list_patches(patch_dir)?;
    let digest = digest_patch_dir(patch_dir)?;
    ctx.log(&format!(
        "{} patch(es) in {}",
        patches.len(),
        patch_dir.display()
    ));

    let mut failed: Vec<String> = Vec::new();
    for patch in &patches {
        let name = patch
            .strip_prefix(patch_dir)
            .unwrap_or(patch)
            .display()
            .to_string();
        let mut cmd = Command::new("patch");
        cmd.args(["-p1", "--forward", "--batch", "-d"])
            .arg(src_dir)
            .arg("-i")
            .arg(patch);
        match ctx.run_cmd(cmd) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::ToolFailed => {
                ctx.warn(&format!("{name} did not apply: {e}"));
                failed.push(name);
            }
            Err(e) => return Err(e),
        }
    }
    if !failed.is_empty() {
        return Err(Error::new(
            ErrorKind::PatchFailed,
            format!(
                "{} of {} patches failed to apply: {}",
                failed.len(),
                patches.len(),
                failed.join(", ")
            ),
        ));
    }

    if !ctx.dry_run {
        write_hash_marker(src_dir, &digest)?;
    }
    Ok(PatchOutcome {
        applied: patches.len(),
        digest,
    })
}

#[Step(
    id = "source.patch",
    stage = "source",
    phase = "patch",
    provides = ["source:patched"],
    after = ["source.fetch"],
    tools = ["patch"],
    default_label = "Apply patch set"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for PatchStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl PatchStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let src_dir = vc.source_dir()?;
        let patch_dir = vc.patch_dir()?;

        let outcome = apply_patch_set(ctx, &src_dir, &patch_dir)?;
        if ctx.dry_run {
            return Ok(());
        }

        record_patch_count(&src_dir, &vc.variant.name, outcome.applied)?;

        ctx.log(&format!(
            "applied {} patch(es); patch set {}",
            outcome.applied, outcome.digest
        ));
        Ok(())
    }
}

/// Update the marker `source.fetch` left in the tree with the patch count.
fn record_patch_count(src_dir: &Path, variant: &str, applied: usize) -> Result<()> {
    let mut marker = SourceMarker::read(src_dir)?.ok_or_else(|| {
        Error::missing(format!(
            "{} has no source marker; re-run source.fetch for variant '{variant}'",
            src_dir.display()
        ))
    })?;
    marker.variant = variant.to_string();
    marker.patches_applied = applied;
    marker.write(src_dir)
}

#[Stage(id = "source", steps = [FetchStep, PatchStep])]
pub struct SourceStage;
