//! Build variants ("tracks"): each one names exactly one kernel config and one
//! patch directory, plus the naming its packages follow.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

pub const BUILTIN_VARIANTS: &[&str] = &["main", "latest", "rc", "next"];

/// Produced by `bindeb-pkg` but shipped by the upstream distribution.
pub const EXCLUDED_ARTIFACTS: &[&str] = &["linux-libc-dev_*"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VariantConfig {
    pub config: Option<String>,
    pub patches: Option<String>,
    pub localversion: Option<String>,
    pub flavor: Option<String>,
    pub component: Option<String>,
    pub patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
    /// Kernel config, as written in the build definition (may be `@alias/...`).
    pub config: String,
    pub patches: String,
    /// Appended to the kernel release (`-sky1-rc`).
    pub localversion: String,
    /// Suffix of the metapackage names (`linux-image-sky1-rc`).
    pub flavor: String,
    pub component: String,
    patterns: Option<Vec<String>>,
}

impl Variant {
    fn builtin(name: &str) -> Option<Self> {
        if !BUILTIN_VARIANTS.contains(&name) {
            return None;
        }
        let suffix = if name == "main" {
            String::new()
        } else {
            format!("-{name}")
        };
        Some(Self {
            name: name.to_string(),
            config: format!("@linux_sky1/config/config.sky1{suffix}"),
            patches: format!("@linux_sky1/patches/{name}"),
            localversion: format!("-sky1{suffix}"),
            flavor: format!("sky1{suffix}"),
            component: name.to_string(),
            patterns: None,
        })
    }

    fn apply(&mut self, cfg: VariantConfig) {
        let VariantConfig {
            config,
            patches,
            localversion,
            flavor,
            component,
            patterns,
        } = cfg;
        if let Some(v) = config {
            self.config = v;
        }
        if let Some(v) = patches {
            self.patches = v;
        }
        if let Some(v) = localversion {
            self.localversion = v;
        }
        if let Some(v) = flavor {
            self.flavor = v;
        }
        if let Some(v) = component {
            self.component = v;
        }
        if patterns.is_some() {
            self.patterns = patterns;
        }
    }

    fn from_config(name: &str, cfg: VariantConfig) -> Result<Self> {
        let need = |field: &Option<String>, key: &str| {
            field
                .clone()
                .ok_or_else(|| Error::msg(format!("variants.{name}.{key} is required")))
        };
        let localversion = need(&cfg.localversion, "localversion")?;
        let flavor = cfg
            .flavor
            .clone()
            .unwrap_or_else(|| localversion.trim_start_matches('-').to_string());
        Ok(Self {
            name: name.to_string(),
            config: need(&cfg.config, "config")?,
            patches: need(&cfg.patches, "patches")?,
            localversion,
            flavor,
            component: cfg.component.unwrap_or_else(|| name.to_string()),
            patterns: cfg.patterns,
        })
    }

    /// Ordered glob patterns selecting this variant's packages: image,
    /// headers, debug image, then the two metapackages.
    pub fn artifact_patterns(&self) -> Vec<String> {
        if let Some(patterns) = &self.patterns {
            return patterns
                .iter()
                .map(|p| {
                    p.replace("{localversion}", &self.localversion)
                        .replace("{flavor}", &self.flavor)
                })
                .collect();
        }
        let lv = &self.localversion;
        let flavor = &self.flavor;
        vec![
            format!("linux-image-*{lv}_*.deb"),
            format!("linux-headers-*{lv}_*.deb"),
            format!("linux-image-*{lv}-dbg_*.deb"),
            format!("linux-image-{flavor}_*.deb"),
            format!("linux-headers-{flavor}_*.deb"),
        ]
    }

    /// Names of the two metapackages tracking the newest build of the variant.
    pub fn metapackage_names(&self) -> [String; 2] {
        [
            format!("linux-image-{}", self.flavor),
            format!("linux-headers-{}", self.flavor),
        ]
    }
}

/// Builtin variants with `[variants.<name>]` applied on top.
pub fn load_variants(doc: &ConfigDoc) -> Result<BTreeMap<String, Variant>> {
    let mut out: BTreeMap<String, Variant> = BUILTIN_VARIANTS
        .iter()
        .filter_map(|n| Variant::builtin(n))
        .map(|v| (v.name.clone(), v))
        .collect();

    let overrides: BTreeMap<String, VariantConfig> =
        doc.deserialize_path("variants")?.unwrap_or_default();
    for (name, cfg) in overrides {
        if name.trim().is_empty() || name.contains(['/', '\\', '.']) {
            return Err(Error::msg(format!("invalid variant name '{name}'")));
        }
        match out.get_mut(&name) {
            Some(v) => v.apply(cfg),
            None => {
                let v = Variant::from_config(&name, cfg)?;
                out.insert(name, v);
            }
        }
    }
    Ok(out)
}

pub fn resolve_variant(doc: &ConfigDoc, name: &str) -> Result<Variant> {
    let mut all = load_variants(doc)?;
    all.remove(name).ok_or_else(|| {
        let known = all.keys().cloned().collect::<Vec<_>>().join(", ");
        Error::msg(format!("unknown variant '{name}' (known: {known})"))
    })
}

/// Each variant must own its config file and patch directory.
pub fn validate_manifest(
    variants: &BTreeMap<String, Variant>,
    resolve: impl Fn(&str) -> Result<PathBuf>,
) -> Result<()> {
    let mut configs: BTreeMap<PathBuf, &str> = BTreeMap::new();
    let mut patches: BTreeMap<PathBuf, &str> = BTreeMap::new();
    for (name, v) in variants {
        if let Some(other) = configs.insert(resolve(&v.config)?, name) {
            return Err(Error::msg(format!(
                "variants '{other}' and '{name}' share the config file {}",
                v.config
            )));
        }
        if let Some(other) = patches.insert(resolve(&v.patches)?, name) {
            return Err(Error::msg(format!(
                "variants '{other}' and '{name}' share the patch directory {}",
                v.patches
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use toml::Value;

    fn doc(text: &str) -> ConfigDoc {
        ConfigDoc {
            path: "<mem>".into(),
            value: toml::from_str::<Value>(text).expect("toml"),
        }
    }

    #[test]
    fn builtin_naming() {
        let d = ConfigDoc::empty("<mem>");
        let main = resolve_variant(&d, "main").expect("main");
        assert_eq!(main.localversion, "-sky1");
        assert_eq!(main.flavor, "sky1");
        assert_eq!(main.config, "@linux_sky1/config/config.sky1");

        let rc = resolve_variant(&d, "rc").expect("rc");
        assert_eq!(rc.localversion, "-sky1-rc");
        assert_eq!(rc.component, "rc");
        assert_eq!(rc.config, "@linux_sky1/config/config.sky1-rc");
        assert_eq!(rc.patches, "@linux_sky1/patches/rc");
    }

    #[test]
    fn patterns_are_ordered_and_depend_only_on_the_variant() {
        let rc = resolve_variant(&ConfigDoc::empty("<mem>"), "rc").expect("rc");
        let first = rc.artifact_patterns();
        assert_eq!(
            first,
            vec![
                "linux-image-*-sky1-rc_*.deb",
                "linux-headers-*-sky1-rc_*.deb",
                "linux-image-*-sky1-rc-dbg_*.deb",
                "linux-image-sky1-rc_*.deb",
                "linux-headers-sky1-rc_*.deb",
            ]
        );
        assert_eq!(first, rc.artifact_patterns());
    }

    #[test]
    fn explicit_patterns_are_templated() {
        let d = doc(
            "[variants.rc]\npatterns = [\"linux-image-*{localversion}_*.deb\", \"linux-image-{flavor}_*.deb\"]\n",
        );
        let rc = resolve_variant(&d, "rc").expect("rc");
        assert_eq!(
            rc.artifact_patterns(),
            vec!["linux-image-*-sky1-rc_*.deb", "linux-image-sky1-rc_*.deb"]
        );
    }

    #[test]
    fn custom_variant_needs_its_own_files() {
        let d = doc("[variants.lab]\nlocalversion = \"-lab\"\n");
        let err = load_variants(&d).unwrap_err().to_string();
        assert!(err.contains("variants.lab.config"), "unexpected err: {err}");
    }

    #[test]
    fn unknown_variant_lists_known_ones() {
        let err = resolve_variant(&ConfigDoc::empty("<mem>"), "stable")
            .unwrap_err()
            .to_string();
        assert!(err.contains("main, next, rc"), "unexpected err: {err}");
    }

    #[test]
    fn shared_patch_directory_is_rejected() {
        let d = doc("[variants.next]\npatches = \"@linux_sky1/patches/rc\"\n");
        let all = load_variants(&d).expect("load");
        let err = validate_manifest(&all, |raw| Ok(PathBuf::from(raw)))
            .unwrap_err()
            .to_string();
        assert!(err.contains("share the patch directory"), "unexpected err: {err}");

        let all = load_variants(&ConfigDoc::empty("<mem>")).expect("load");
        validate_manifest(&all, |raw| Ok(PathBuf::from(raw))).expect("builtins are distinct");
    }
}
