use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::debpkg::FixupVars;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::kversion::KernelVersion;
use crate::variants::{Variant, resolve_variant};
use crate::workspace::WorkspacePaths;

pub(crate) fn default_true() -> bool {
    true
}

/// `[build]`: what is being built. Command-line parameters land here too.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub kernel_version: Option<String>,
    pub revision: u32,
    pub variant: String,
    pub arch: String,
    /// `make -j`; 0 means one job per CPU.
    pub jobs: usize,
    pub version_filter: Option<String>,
    pub multi_version_delay_secs: u64,
    /// Toolchain prefix; when set, `make` also gets `ARCH` for a cross build.
    pub cross_compile: Option<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            kernel_version: None,
            revision: 1,
            variant: "main".into(),
            arch: "arm64".into(),
            jobs: 0,
            version_filter: None,
            multi_version_delay_secs: 5,
            cross_compile: None,
        }
    }
}

impl BuildSettings {
    pub fn kernel_version(&self) -> Result<KernelVersion> {
        let raw = self
            .kernel_version
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::missing("[build].kernel_version is not set"))?;
        KernelVersion::parse(raw)
    }

    /// `ARCH=`/`CROSS_COMPILE=` arguments for kernel `make` invocations.
    pub fn make_target_args(&self) -> Vec<String> {
        match self.cross_compile.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(prefix) => vec![
                format!("ARCH={}", self.arch),
                format!("CROSS_COMPILE={prefix}"),
            ],
            None => Vec::new(),
        }
    }

    pub fn jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs
        }
    }
}

pub fn build_settings(doc: &ConfigDoc) -> Result<BuildSettings> {
    let s: BuildSettings = doc.deserialize_path("build")?.unwrap_or_default();
    if s.revision == 0 {
        return Err(Error::msg("[build].revision must be at least 1"));
    }
    if s.arch.trim().is_empty() {
        return Err(Error::msg("[build].arch must not be empty"));
    }
    Ok(s)
}

/// Everything a step needs to know about the variant being worked on.
#[derive(Debug, Clone)]
pub struct VariantCtx {
    pub settings: BuildSettings,
    pub variant: Variant,
    pub ws: WorkspacePaths,
}

impl VariantCtx {
    pub fn load(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<Self> {
        let settings = build_settings(doc)?;
        let variant = resolve_variant(doc, &settings.variant)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        Ok(Self {
            settings,
            variant,
            ws,
        })
    }

    pub fn build_dir(&self) -> Result<PathBuf> {
        self.ws.variant_build_dir(&self.variant.name)
    }

    pub fn source_dir(&self) -> Result<PathBuf> {
        self.ws.source_dir(&self.variant.name)
    }

    pub fn out_dir(&self) -> Result<PathBuf> {
        self.ws.variant_out_dir(&self.variant.name)
    }

    pub fn config_file(&self) -> Result<PathBuf> {
        self.ws.resolve_config_path(&self.variant.config)
    }

    pub fn patch_dir(&self) -> Result<PathBuf> {
        self.ws.resolve_config_path(&self.variant.patches)
    }

    /// Kernel release including the variant's local version.
    pub fn release(&self, kv: &KernelVersion) -> String {
        format!("{}{}", kv.release(), self.variant.localversion)
    }

    pub fn fixup_vars(&self, kv: &KernelVersion, revision: u32) -> FixupVars {
        FixupVars {
            release: self.release(kv),
            version: kv.deb_version(revision),
            flavor: self.variant.flavor.clone(),
            source_date_epoch: source_date_epoch(),
        }
    }
}

pub fn source_date_epoch() -> Option<i64> {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

/// `{version}`, `{major}`, `{major_minor}` in source locations.
pub fn expand_version_template(raw: &str, kv: &KernelVersion) -> String {
    raw.replace("{version}", &kv.full())
        .replace("{major_minor}", &kv.major_minor())
        .replace("{major}", &kv.major.to_string())
}

/// Give the operator a chance to interrupt after a non-fatal warning.
pub fn pause_after_warning(ctx: &ExecCtx, secs: u64) {
    if ctx.dry_run || ctx.assume_yes || secs == 0 {
        return;
    }
    ctx.log(&format!("continuing in {secs}s (Ctrl-C to abort)"));
    std::thread::sleep(Duration::from_secs(secs));
}
