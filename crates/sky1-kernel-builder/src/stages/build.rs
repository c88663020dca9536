use std::fs;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use sky1_kernel_builder_macros::{Stage, Step};

use crate::artifacts::{
    ArtifactManifest, ArtifactRecord, MANIFEST_FILE, multi_version_warning, select_artifacts,
};
use crate::config::ConfigDoc;
use crate::error::ErrorKind;
use crate::executor::ExecCtx;
use crate::kconfig;
use crate::patchset::{SourceMarker, check_staleness, hash_file};
use crate::stages::util::{VariantCtx, default_true, pause_after_warning};
use crate::{Error, Result};

#[Step(
    id = "build.verify",
    stage = "build",
    phase = "verify",
    provides = ["build:verified"],
    after = ["source:patched?"],
    default_label = "Check prepared source"
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
        let kv = vc.settings.kernel_version()?;
        let src_dir = vc.source_dir()?;
        let patch_dir = vc.patch_dir()?;

        if ctx.dry_run && !src_dir.is_dir() {
            ctx.log(&format!(
                "DRY-RUN: {} not prepared yet; staleness check skipped",
                src_dir.display()
            ));
            return Ok(());
        }

        let digest = check_staleness(&src_dir, &patch_dir, &vc.variant.name)?;
        if let Some(marker) = SourceMarker::read(&src_dir)? {
            if marker.kernel_version != kv.full() {
                return Err(Error::stale(format!(
                    "{} holds kernel {} but {} was requested; re-run `skb prepare`",
                    src_dir.display(),
                    marker.kernel_version,
                    kv.full()
                )));
            }
            ctx.log(&format!(
                "prepared from {} with {} patch(es) at {}",
                marker.reference, marker.patches_applied, marker.prepared_at
            ));
        }
        ctx.log(&format!("patch set {digest} matches the prepared source"));
        Ok(())
    }
}

/// Config targets the smoke test accepts. `all` stands for `allyesconfig`
/// followed by `allmodconfig`.
pub const SMOKE_TARGETS: &[&str] = &["allyesconfig", "allmodconfig", "defconfig", "randconfig", "all"];

/// Compile-only builds of the patched tree against stock config targets.
/// The kernels it produces are not meant to boot; it catches code that only
/// breaks with options the variant configs leave off.
#[Step(
    id = "build.smoke",
    stage = "build",
    phase = "smoke",
    provides = ["build:smoked"],
    after = ["build:verified?"],
    tools = ["make"],
    default_label = "Compile smoke test"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmokeStep {
    pub enabled: bool,
    pub label: Option<String>,
    pub targets: Vec<String>,
    /// How often `randconfig` is generated and built.
    pub repeat: u32,
    /// Build with `W=1`.
    pub warnings: bool,
    pub modules_only: bool,
}

impl Default for SmokeStep {
    fn default() -> Self {
        Self {
            enabled: false,
            label: None,
            targets: vec!["allyesconfig".into()],
            repeat: 1,
            warnings: false,
            modules_only: false,
        }
    }
}

/// One generated config and the build of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeRun {
    pub label: String,
    pub target: String,
}

/// Expand the configured targets into the builds to run, in order.
pub fn smoke_runs(targets: &[String], repeat: u32) -> Result<Vec<SmokeRun>> {
    let mut plain = Vec::new();
    for t in targets {
        match t.trim() {
            "all" => plain.extend(["allyesconfig", "allmodconfig"]),
            "randconfig" => plain.extend((0..repeat.max(1)).map(|_| "randconfig")),
            other if SMOKE_TARGETS.contains(&other) => plain.push(other),
            other => {
                return Err(Error::msg(format!(
                    "unknown smoke target '{other}' (known: {})",
                    SMOKE_TARGETS.join(", ")
                )));
            }
        }
    }
    if plain.is_empty() {
        return Err(Error::msg("[build.steps.smoke].targets is empty"));
    }
    let randconfigs = plain.iter().filter(|t| **t == "randconfig").count();
    let mut nth = 0;
    Ok(plain
        .into_iter()
        .map(|t| {
            let label = if t == "randconfig" && randconfigs > 1 {
                nth += 1;
                format!("randconfig[{nth}]")
            } else {
                t.to_string()
            };
            SmokeRun {
                label,
                target: t.to_string(),
            }
        })
        .collect())
}

impl SmokeStep {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let src_dir = vc.source_dir()?;
        let runs = smoke_runs(&cfg.targets, cfg.repeat)?;
        if !ctx.dry_run && !src_dir.is_dir() {
            return Err(Error::missing(format!(
                "prepared source {} not found; re-run `skb prepare`",
                src_dir.display()
            )));
        }
        ctx.log(&format!(
            "smoke targets: {}",
            runs.iter().map(|r| r.label.as_str()).collect::<Vec<_>>().join(", ")
        ));

        // The tree's own .config waits in a scratch dir and comes back
        // afterwards, pass or fail.
        let dot_config = src_dir.join(".config");
        let saved = if !ctx.dry_run && dot_config.is_file() {
            let build_dir = vc.build_dir()?;
            let scratch = tempfile::Builder::new()
                .prefix(".skb-smoke-")
                .tempdir_in(&build_dir)
                .map_err(|e| {
                    Error::msg(format!("failed to create scratch dir in {}: {e}", build_dir.display()))
                })?;
            let copy = scratch.path().join("config");
            fs::copy(&dot_config, &copy).map_err(|e| {
                Error::msg(format!("failed to save {}: {e}", dot_config.display()))
            })?;
            Some((scratch, copy))
        } else {
            None
        };

        let outcome = smoke_builds(cfg, ctx, &vc, &src_dir, &runs);
        if let Some((_scratch, copy)) = &saved {
            fs::copy(copy, &dot_config).map_err(|e| {
                Error::msg(format!("failed to restore {}: {e}", dot_config.display()))
            })?;
            ctx.log(&format!("restored {}", dot_config.display()));
        }
        let results = outcome?;

        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, passed)| !passed)
            .map(|(label, _)| label.as_str())
            .collect();
        for (label, passed) in &results {
            ctx.log(&format!("{label:<20} [{}]", if *passed { "PASS" } else { "FAIL" }));
        }
        if !failed.is_empty() {
            return Err(Error::new(
                ErrorKind::ToolFailed,
                format!(
                    "{} of {} smoke build(s) failed: {}",
                    failed.len(),
                    results.len(),
                    failed.join(", ")
                ),
            ));
        }
        Ok(())
    }
}

/// Run every smoke build; a failing build does not stop the next one.
fn smoke_builds(
    cfg: &SmokeStep,
    ctx: &ExecCtx,
    vc: &VariantCtx,
    src_dir: &Path,
    runs: &[SmokeRun],
) -> Result<Vec<(String, bool)>> {
    let make = || {
        let mut cmd = Command::new("make");
        cmd.arg("-C").arg(src_dir).args(vc.settings.make_target_args());
        cmd
    };
    let build_targets: &[&str] = if cfg.modules_only {
        &["modules"]
    } else {
        &["Image", "modules"]
    };

    let mut results = Vec::with_capacity(runs.len());
    for (i, run) in runs.iter().enumerate() {
        if i > 0 {
            let mut clean = make();
            clean.arg("clean");
            ctx.run_cmd(clean)?;
        }
        let mut generate = make();
        generate.arg(&run.target);
        let mut passed = tolerate_failure(ctx, &run.label, ctx.run_cmd(generate))?;
        if passed {
            if !ctx.dry_run {
                let options = fs::read_to_string(src_dir.join(".config"))
                    .map(|t| t.lines().filter(|l| l.starts_with("CONFIG_")).count())
                    .unwrap_or(0);
                ctx.log(&format!("{}: {options} config options", run.label));
            }
            let mut build = make();
            build.arg(format!("-j{}", vc.settings.jobs()));
            if cfg.warnings {
                build.arg("W=1");
            }
            build.args(build_targets);
            passed = tolerate_failure(ctx, &run.label, ctx.run_cmd(build))?;
        }
        results.push((run.label.clone(), passed));
    }
    Ok(results)
}

fn tolerate_failure(ctx: &ExecCtx, label: &str, res: Result<()>) -> Result<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::ToolFailed => {
            ctx.warn(&format!("{label}: {e}"));
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[Step(
    id = "build.configure",
    stage = "build",
    phase = "configure",
    provides = ["build:config"],
    after = ["build:verified?", "build:smoked?"],
    tools = ["make"],
    default_label = "Configure kernel"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigureStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Log every option `olddefconfig` added, removed or changed.
    pub review: bool,
}

impl Default for ConfigureStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            review: false,
        }
    }
}

impl ConfigureStep {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let src_dir = vc.source_dir()?;
        let config_file = vc.config_file()?;
        let dot_config = src_dir.join(".config");

        ctx.log(&format!("config = {}", config_file.display()));
        let committed = fs::read_to_string(&config_file).map_err(|e| {
            Error::missing(format!(
                "failed to read variant config {}: {e}",
                config_file.display()
            ))
        })?;
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: copy {} -> {}",
                config_file.display(),
                dot_config.display()
            ));
        } else {
            fs::write(&dot_config, &committed).map_err(|e| {
                Error::msg(format!("failed to write {}: {e}", dot_config.display()))
            })?;
        }

        let mut cmd = Command::new("make");
        cmd.arg("-C")
            .arg(&src_dir)
            .args(vc.settings.make_target_args())
            .arg("olddefconfig");
        ctx.run_cmd(cmd)?;
        if ctx.dry_run {
            return Ok(());
        }

        let resolved = fs::read_to_string(&dot_config)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", dot_config.display())))?;
        let drift = kconfig::drift_count(&committed, &resolved);
        if drift == 0 {
            ctx.log("olddefconfig kept the variant config as is");
        } else {
            ctx.log(&format!(
                "olddefconfig changed {drift} option line(s); consider refreshing {}",
                config_file.display()
            ));
        }
        if cfg.review {
            let review = kconfig::review(
                &kconfig::parse_config(&committed),
                &kconfig::parse_config(&resolved),
            );
            for line in review.render().lines() {
                ctx.log(line);
            }
        }
        Ok(())
    }
}

#[Step(
    id = "build.compile",
    stage = "build",
    phase = "compile",
    provides = ["build:packages"],
    after = ["build:config?"],
    tools = ["make", "dpkg-buildpackage"],
    default_label = "Build kernel packages"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompileStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CompileStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CompileStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let kv = vc.settings.kernel_version()?;
        let src_dir = vc.source_dir()?;
        let version = kv.deb_version(vc.settings.revision);

        ctx.log(&format!(
            "release {} version {version} jobs {}",
            vc.release(&kv),
            vc.settings.jobs()
        ));
        let mut cmd = Command::new("make");
        cmd.arg("-C")
            .arg(&src_dir)
            .arg(format!("-j{}", vc.settings.jobs()))
            .args(vc.settings.make_target_args())
            .arg("bindeb-pkg")
            .arg(format!("LOCALVERSION={}", vc.variant.localversion))
            .arg(format!("KDEB_PKGVERSION={version}"));
        if let Some(epoch) = crate::stages::util::source_date_epoch() {
            cmd.env("KBUILD_BUILD_TIMESTAMP", format!("@{epoch}"));
        }
        ctx.run_cmd(cmd)
    }
}

#[Step(
    id = "build.collect",
    stage = "build",
    phase = "collect",
    provides = ["build:artifacts"],
    after = ["build:packages?"],
    default_label = "Collect packages"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CollectStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CollectStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let kv = vc.settings.kernel_version()?;
        let build_dir = vc.build_dir()?;
        let out_dir = vc.out_dir()?;

        if ctx.dry_run && !build_dir.is_dir() {
            ctx.log(&format!(
                "DRY-RUN: collect {} -> {}",
                build_dir.display(),
                out_dir.display()
            ));
            return Ok(());
        }
        let manifest = collect_artifacts(
            ctx,
            &build_dir,
            &out_dir,
            &vc.variant.artifact_patterns(),
            CollectInfo {
                variant: &vc.variant.name,
                kernel_version: &kv.full(),
                revision: vc.settings.revision,
                delay_secs: vc.settings.multi_version_delay_secs,
            },
        )?;
        ctx.log(&format!(
            "collected {} package(s) into {}",
            manifest.artifacts.len(),
            out_dir.display()
        ));
        Ok(())
    }
}

pub struct CollectInfo<'a> {
    pub variant: &'a str,
    pub kernel_version: &'a str,
    pub revision: u32,
    pub delay_secs: u64,
}

/// Select a variant's packages from `build_dir`, copy them into `out_dir`
/// (replacing an earlier collection) and record them in `artifacts.json`.
pub fn collect_artifacts(
    ctx: &ExecCtx,
    build_dir: &Path,
    out_dir: &Path,
    patterns: &[String],
    info: CollectInfo<'_>,
) -> Result<ArtifactManifest> {
    let selection = select_artifacts(build_dir, patterns)?;
    if let Some(warning) = multi_version_warning(&selection) {
        ctx.warn(&warning);
        pause_after_warning(ctx, info.delay_secs);
    }

    let mut manifest = ArtifactManifest {
        variant: info.variant.to_string(),
        kernel_version: info.kernel_version.to_string(),
        revision: info.revision,
        collected_at: chrono::Utc::now().to_rfc3339(),
        artifacts: Vec::new(),
    };
    if ctx.dry_run {
        for deb in &selection {
            ctx.log(&format!("DRY-RUN: collect {}", deb.file_name()));
        }
        return Ok(manifest);
    }

    fs::create_dir_all(out_dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", out_dir.display())))?;
    clear_collection(out_dir)?;
    for deb in &selection {
        let dest = out_dir.join(deb.file_name());
        fs::copy(&deb.path, &dest).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                deb.path.display(),
                dest.display()
            ))
        })?;
        ctx.log(&format!("collected {}", deb.file_name()));
        manifest.artifacts.push(ArtifactRecord {
            file: deb.file_name(),
            name: deb.name.clone(),
            version: deb.version.clone(),
            arch: deb.arch.clone(),
            sha256: hash_file(&dest)?,
        });
    }
    manifest.write(out_dir)?;
    Ok(manifest)
}

fn clear_collection(out_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(out_dir)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", out_dir.display())))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if (name.ends_with(".deb") || name == MANIFEST_FILE) && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[Stage(
    id = "build",
    steps = [VerifyStep, SmokeStep, ConfigureStep, CompileStep, CollectStep]
)]
pub struct BuildStage;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemorySink;
    use std::sync::Arc;

    fn patterns() -> Vec<String> {
        [
            "linux-image-*-sky1_*.deb",
            "linux-headers-*-sky1_*.deb",
            "linux-image-*-sky1-dbg_*.deb",
            "linux-image-sky1_*.deb",
            "linux-headers-sky1_*.deb",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn info() -> CollectInfo<'static> {
        CollectInfo {
            variant: "main",
            kernel_version: "6.18.9",
            revision: 1,
            delay_secs: 0,
        }
    }

    #[test]
    fn collect_copies_the_selection_and_writes_a_manifest() {
        let build = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        for n in [
            "linux-image-6.18.9-sky1_6.18.9-1_arm64.deb",
            "linux-headers-6.18.9-sky1_6.18.9-1_arm64.deb",
            "linux-libc-dev_6.18.9-1_arm64.deb",
        ] {
            fs::write(build.path().join(n), n).expect("write");
        }
        fs::write(out.path().join("linux-image-6.18.8-sky1_6.18.8-1_arm64.deb"), "old")
            .expect("write");

        let sink = Arc::new(MemorySink::default());
        let ctx = ExecCtx::new(false, sink.clone());
        let manifest =
            collect_artifacts(&ctx, build.path(), out.path(), &patterns(), info()).expect("collect");

        let files: Vec<&str> = manifest.artifacts.iter().map(|a| a.file.as_str()).collect();
        assert_eq!(
            files,
            vec![
                "linux-image-6.18.9-sky1_6.18.9-1_arm64.deb",
                "linux-headers-6.18.9-sky1_6.18.9-1_arm64.deb",
            ]
        );
        assert!(!out.path().join("linux-image-6.18.8-sky1_6.18.8-1_arm64.deb").exists());
        assert!(!out.path().join("linux-libc-dev_6.18.9-1_arm64.deb").exists());
        assert_eq!(ArtifactManifest::read(out.path()).expect("read"), manifest);
        assert_eq!(manifest.artifacts[0].sha256.len(), 64);
    }

    #[test]
    fn smoke_targets_expand_in_order() {
        let targets = |t: &[&str]| t.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let labels = |runs: Vec<SmokeRun>| runs.into_iter().map(|r| r.label).collect::<Vec<_>>();

        assert_eq!(
            labels(smoke_runs(&targets(&["all", "defconfig"]), 1).expect("runs")),
            vec!["allyesconfig", "allmodconfig", "defconfig"]
        );
        let rand = smoke_runs(&targets(&["randconfig"]), 3).expect("runs");
        assert!(rand.iter().all(|r| r.target == "randconfig"));
        assert_eq!(
            labels(rand),
            vec!["randconfig[1]", "randconfig[2]", "randconfig[3]"]
        );
        assert_eq!(
            labels(smoke_runs(&targets(&["randconfig"]), 0).expect("runs")),
            vec!["randconfig"]
        );

        let err = smoke_runs(&targets(&["tinyconfig"]), 1).unwrap_err().to_string();
        assert!(err.contains("unknown smoke target 'tinyconfig'"), "{err}");
        assert!(smoke_runs(&[], 1).is_err());
    }

    #[test]
    fn mixed_versions_warn_but_continue() {
        let build = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        for n in [
            "linux-image-6.18.8-sky1_6.18.8-1_arm64.deb",
            "linux-image-6.18.9-sky1_6.18.9-1_arm64.deb",
        ] {
            fs::write(build.path().join(n), b"").expect("write");
        }
        let sink = Arc::new(MemorySink::default());
        let ctx = ExecCtx::new(false, sink.clone());
        let manifest =
            collect_artifacts(&ctx, build.path(), out.path(), &patterns(), info()).expect("collect");
        assert_eq!(manifest.artifacts.len(), 2);
        assert!(
            sink.lines()
                .iter()
                .any(|l| l.starts_with("WARNING: ") && l.contains("2 kernel versions")),
            "lines: {:?}",
            sink.lines()
        );
    }
}
