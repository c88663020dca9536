use std::path::Path;

use serde::Deserialize;

use sky1_kernel_builder_macros::{Stage, Step};

use crate::artifacts::{ArtifactManifest, ArtifactRecord, DebFile, MANIFEST_FILE};
use crate::config::ConfigDoc;
use crate::debpkg::{FixupRule, build_metapackage, default_fixups, metapackage_control, repack};
use crate::executor::ExecCtx;
use crate::kversion::KernelVersion;
use crate::patchset::hash_file;
use crate::stages::util::{VariantCtx, default_true};
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Replaces the builtin rules when given.
    pub fixups: Option<Vec<FixupRule>>,
    pub maintainer: String,
    #[serde(default = "default_true")]
    pub metapackages: bool,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fixups: None,
            maintainer: "Sky1 Kernel Builder <kernel@localhost>".into(),
            metapackages: true,
        }
    }
}

impl PackageConfig {
    pub fn rules(&self) -> Vec<FixupRule> {
        self.fixups.clone().unwrap_or_else(default_fixups)
    }
}

/// The collected manifest, or `None` in dry-run mode when nothing has been
/// collected yet.
fn read_manifest(ctx: &ExecCtx, out_dir: &Path) -> Result<Option<ArtifactManifest>> {
    if ctx.dry_run && !out_dir.join(MANIFEST_FILE).is_file() {
        ctx.log(&format!(
            "DRY-RUN: no {MANIFEST_FILE} in {} yet",
            out_dir.display()
        ));
        return Ok(None);
    }
    ArtifactManifest::read(out_dir).map(Some)
}

#[Step(
    id = "package.fixup",
    stage = "package",
    phase = "fixup",
    provides = ["package:fixed"],
    after = ["build:artifacts?"],
    tools = ["dpkg-deb"],
    default_label = "Post-process packages"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FixupStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for FixupStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl FixupStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let pkg: PackageConfig = doc.deserialize_path("package")?.unwrap_or_default();
        let out_dir = vc.out_dir()?;
        let Some(mut manifest) = read_manifest(ctx, &out_dir)? else {
            return Ok(());
        };
        let kv = KernelVersion::parse(&manifest.kernel_version)?;
        let rules = pkg.rules();

        let mut rewritten = 0usize;
        for record in &mut manifest.artifacts {
            let path = out_dir.join(&record.file);
            let mut vars = vc.fixup_vars(&kv, manifest.revision);
            vars.version = record.version.clone();
            if repack(ctx, &path, &record.name, &rules, &vars)? {
                record.sha256 = hash_file(&path)?;
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            manifest.write(&out_dir)?;
        }
        ctx.log(&format!(
            "{rewritten} of {} package(s) rewritten",
            manifest.artifacts.len()
        ));
        Ok(())
    }
}

#[Step(
    id = "package.meta",
    stage = "package",
    phase = "meta",
    provides = ["package:meta"],
    after = ["package:fixed?"],
    tools = ["dpkg-deb"],
    default_label = "Build metapackages"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetaStep {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for MetaStep {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl MetaStep {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let vc = VariantCtx::load(doc, ctx)?;
        let pkg: PackageConfig = doc.deserialize_path("package")?.unwrap_or_default();
        if !pkg.metapackages {
            ctx.log("metapackages disabled");
            return Ok(());
        }
        let out_dir = vc.out_dir()?;
        let Some(mut manifest) = read_manifest(ctx, &out_dir)? else {
            return Ok(());
        };
        let kv = KernelVersion::parse(&manifest.kernel_version)?;
        let release = vc.release(&kv);
        let version = kv.deb_version(manifest.revision);

        let [image_meta, headers_meta] = vc.variant.metapackage_names();
        let wanted = [
            (image_meta, format!("linux-image-{release}")),
            (headers_meta, format!("linux-headers-{release}")),
        ];
        for (meta, target) in wanted {
            if !manifest.artifacts.iter().any(|a| a.name == target) {
                ctx.log(&format!("{target} was not collected; skipping {meta}"));
                continue;
            }
            let control = metapackage_control(
                &meta,
                &version,
                &vc.settings.arch,
                &target,
                &pkg.maintainer,
            );
            let path = build_metapackage(ctx, &out_dir, &control)?;
            if ctx.dry_run {
                continue;
            }
            let deb = DebFile::parse(&path)?;
            manifest.artifacts.retain(|a| a.name != deb.name);
            manifest.artifacts.push(ArtifactRecord {
                file: deb.file_name(),
                name: deb.name.clone(),
                version: deb.version.clone(),
                arch: deb.arch.clone(),
                sha256: hash_file(&path)?,
            });
            ctx.log(&format!("built {}", deb.file_name()));
        }
        if !ctx.dry_run {
            manifest.write(&out_dir)?;
        }
        Ok(())
    }
}

#[Stage(id = "package", steps = [FixupStep, MetaStep])]
pub struct PackageStage;

#[cfg(test)]
mod tests {
    use super::*;
    use toml::Value;

    #[test]
    fn configured_fixups_replace_the_builtin_rules() {
        let doc = ConfigDoc {
            path: "<mem>".into(),
            value: toml::from_str::<Value>(
                r#"
[[package.fixups]]
matches = "linux-image-{release}"
provides = ["linux-image-{flavor}-any"]
"#,
            )
            .expect("toml"),
        };
        let pkg: PackageConfig = doc
            .deserialize_path("package")
            .expect("deserialize")
            .unwrap_or_default();
        let rules = pkg.rules();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].symlink.is_none());
        assert!(pkg.metapackages);

        assert_eq!(PackageConfig::default().rules(), default_fixups());
    }
}
