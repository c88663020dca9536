//! Kernel `.config` handling shared by `build.configure` and `skb config`.
//!
//! Track configs are plain kernel config files. The policy file is an ini
//! file of `[section]` headers and `OPTION=value` lines naming values every
//! track must agree on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

pub type ConfigMap = BTreeMap<String, String>;

/// Symbols that only record the toolchain a config was last written with.
const IGNORED: &[&str] = &[
    "CONFIG_CC_VERSION_TEXT",
    "CONFIG_GCC_VERSION",
    "CONFIG_LD_VERSION",
    "CONFIG_CLANG_VERSION",
    "CONFIG_AS_VERSION",
    "CONFIG_PAHOLE_VERSION",
    "CONFIG_RUSTC_VERSION",
    "CONFIG_BINDGEN_VERSION",
    "CONFIG_KERNEL_VERSION_GENERATION",
];

const SUBSYSTEMS: &[(&str, &str)] = &[
    ("DRM_", "Display/GPU"),
    ("SND_", "Audio"),
    ("NET_", "Network"),
    ("NFT_", "Network/Netfilter"),
    ("NF_", "Network/Netfilter"),
    ("CRYPTO_", "Crypto"),
    ("SECURITY_", "Security"),
    ("USB_", "USB"),
    ("PHY_", "PHY"),
    ("PCI_", "PCI"),
    ("ARM64_", "ARM64"),
    ("ARCH_", "Architecture"),
    ("CIX_", "Sky1"),
    ("SKY1_", "Sky1"),
    ("LINLON", "Sky1"),
    ("TRILIN", "Sky1"),
    ("PANTHOR", "Sky1"),
    ("ARMCHINA", "Sky1"),
    ("CDNSP_SKY1", "Sky1"),
];

/// Categories listed first in a review, in this order.
pub const PRIORITY_CATEGORIES: &[&str] =
    &["Sky1", "Display/GPU", "Audio", "USB", "PCI", "PHY", "Network"];

const SKY1_MARKERS: &[&str] = &[
    "CIX",
    "SKY1",
    "LINLON",
    "TRILIN",
    "PANTHOR",
    "ARMCHINA",
    "CDNSP_SKY1",
];

/// `CONFIG_USB_UAS` / `usb_uas` -> `USB_UAS`.
pub fn normalize_option(name: &str) -> String {
    let name = name.trim();
    name.strip_prefix("CONFIG_")
        .unwrap_or(name)
        .to_ascii_uppercase()
}

pub fn is_ignored(key: &str) -> bool {
    IGNORED.contains(&key)
}

pub fn categorize_option(key: &str) -> &'static str {
    let name = key.strip_prefix("CONFIG_").unwrap_or(key);
    SUBSYSTEMS
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map_or("Other", |(_, cat)| *cat)
}

pub fn is_sky1_option(key: &str) -> bool {
    let name = key.strip_prefix("CONFIG_").unwrap_or(key);
    SKY1_MARKERS.iter().any(|m| name.contains(m))
}

/// `CONFIG_X=v` lines map to `v`, `# CONFIG_X is not set` maps to `n`.
pub fn parse_config(text: &str) -> ConfigMap {
    let mut out = ConfigMap::new();
    for line in text.lines() {
        if line.starts_with("CONFIG_") {
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            out.insert(key.to_string(), value.to_string());
        } else if let Some(key) = line
            .strip_prefix("# ")
            .and_then(|l| l.strip_suffix(" is not set"))
            .filter(|k| k.starts_with("CONFIG_"))
        {
            out.insert(key.to_string(), "n".to_string());
        }
    }
    out
}

pub fn enabled_count(cfg: &ConfigMap) -> usize {
    cfg.values().filter(|v| v.as_str() != "n").count()
}

/// Rewrite an existing option line. Options the file does not mention are
/// left alone (they may not exist in that kernel version).
pub fn set_config_line(text: &str, option: &str, value: &str) -> (String, bool) {
    let key = format!("CONFIG_{}", normalize_option(option));
    let new_line = if value == "n" {
        format!("# {key} is not set")
    } else {
        format!("{key}={value}")
    };
    let enabled = format!("{key}=");
    let disabled = format!("# {key} is not set");

    let mut found = false;
    let mut out = String::with_capacity(text.len() + new_line.len());
    for line in text.lines() {
        if line.starts_with(&enabled) || line == disabled {
            found = true;
            out.push_str(&new_line);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    if !found {
        return (text.to_string(), false);
    }
    if !text.ends_with('\n') {
        out.pop();
    }
    let changed = out != text;
    (out, changed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub section: String,
    /// Bare upper-case option name (`USB_UAS`).
    pub option: String,
    pub value: String,
}

fn policy_key(line: &str) -> Option<(String, &str)> {
    let stripped = line.trim();
    if stripped.starts_with('#') || stripped.starts_with(';') || stripped.starts_with('[') {
        return None;
    }
    let (k, v) = stripped.split_once('=')?;
    Some((k.trim().to_ascii_uppercase(), v.trim()))
}

pub fn parse_policy(text: &str) -> Vec<PolicyEntry> {
    let mut section = String::from("unknown");
    let mut out = Vec::new();
    for line in text.lines() {
        let stripped = line.trim();
        if let Some(name) = stripped.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            section = name.trim().to_string();
            continue;
        }
        if let Some((option, value)) = policy_key(line) {
            out.push(PolicyEntry {
                section: section.clone(),
                option,
                value: value.to_string(),
            });
        }
    }
    out
}

/// `CONFIG_X -> required value`.
pub fn policy_requirements(entries: &[PolicyEntry]) -> ConfigMap {
    entries
        .iter()
        .map(|e| (format!("CONFIG_{}", e.option), e.value.clone()))
        .collect()
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Add or update `OPTION=value`. A new entry goes at the end of `section`,
/// which is created when missing.
pub fn set_policy_entry(text: &str, option: &str, value: &str, section: &str) -> (String, bool) {
    let bare = normalize_option(option);
    let entry = format!("{bare}={value}");
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();

    if let Some(i) = lines
        .iter()
        .position(|l| policy_key(l).is_some_and(|(k, _)| k == bare))
    {
        if lines[i].trim() == entry {
            return (text.to_string(), false);
        }
        lines[i] = entry;
        return (join_lines(&lines), true);
    }

    let header = format!("[{section}]");
    let mut in_section = false;
    let mut insert_at = None;
    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim();
        if stripped == header {
            in_section = true;
            insert_at = Some(i + 1);
            continue;
        }
        if in_section {
            if stripped.starts_with('[') || stripped.is_empty() {
                break;
            }
            insert_at = Some(i + 1);
        }
    }
    match insert_at {
        Some(i) => lines.insert(i, entry),
        None => {
            lines.push(String::new());
            lines.push(header);
            lines.push(entry);
        }
    }
    (join_lines(&lines), true)
}

pub fn remove_policy_entry(text: &str, option: &str) -> (String, bool) {
    let bare = normalize_option(option);
    let lines: Vec<String> = text
        .lines()
        .filter(|l| !policy_key(l).is_some_and(|(k, _)| k == bare))
        .map(str::to_string)
        .collect();
    let removed = lines.len() != text.lines().count();
    if !removed {
        return (text.to_string(), false);
    }
    (join_lines(&lines), true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub track: String,
    pub option: String,
    /// `None` when the track does not mention the option at all.
    pub actual: Option<String>,
    pub required: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub option: String,
    /// Value per track, `-` where unset.
    pub values: Vec<(String, String)>,
}

impl Divergence {
    pub fn is_divergent(&self) -> bool {
        self.values.iter().map(|(_, v)| v).collect::<BTreeSet<_>>().len() > 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub violations: Vec<Violation>,
    /// Every Sky1-specific option, divergent or not.
    pub sky1_options: Vec<Divergence>,
}

impl ReconcileReport {
    pub fn divergent(&self) -> impl Iterator<Item = &Divergence> {
        self.sky1_options.iter().filter(|d| d.is_divergent())
    }

    pub fn render(&self, verbose: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "--- Policy Check ---");
        if self.violations.is_empty() {
            let _ = writeln!(out, "  All options match policy.");
        }
        for v in &self.violations {
            match &v.actual {
                Some(actual) => {
                    let _ = writeln!(out, "  {:25} {}={actual}  (policy: {})", v.track, v.option, v.required);
                }
                None => {
                    let _ = writeln!(out, "  {:25} {}  MISSING  (policy: {})", v.track, v.option, v.required);
                }
            }
        }
        let _ = writeln!(
            out,
            "\n--- {} ---",
            if verbose { "Sky1-Specific Options (all)" } else { "Sky1-Specific Divergence" }
        );
        let shown: Vec<&Divergence> = if verbose {
            self.sky1_options.iter().collect()
        } else {
            self.divergent().collect()
        };
        if shown.is_empty() {
            let _ = writeln!(out, "  All Sky1-specific options are consistent across tracks.");
        }
        for d in shown {
            let parts = d
                .values
                .iter()
                .map(|(t, v)| format!("{t}={v}"))
                .collect::<Vec<_>>()
                .join("  ");
            let mark = if d.is_divergent() { " ***" } else { "" };
            let _ = writeln!(out, "  {:45} {parts}{mark}", d.option);
        }
        let _ = writeln!(out, "\n--- Summary ---");
        let _ = writeln!(out, "  {} policy violation(s)", self.violations.len());
        let _ = writeln!(out, "  {} divergent Sky1-specific option(s)", self.divergent().count());
        let _ = writeln!(out, "  {} total Sky1-specific options checked", self.sky1_options.len());
        out
    }
}

/// Check every track against the policy and compare Sky1-specific options
/// across tracks.
pub fn reconcile(tracks: &[(String, ConfigMap)], policy: &ConfigMap) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    for (option, required) in policy {
        for (track, cfg) in tracks {
            let actual = cfg.get(option);
            if actual != Some(required) {
                report.violations.push(Violation {
                    track: track.clone(),
                    option: option.clone(),
                    actual: actual.cloned(),
                    required: required.clone(),
                });
            }
        }
    }

    let sky1: BTreeSet<&String> = tracks
        .iter()
        .flat_map(|(_, cfg)| cfg.keys())
        .filter(|k| is_sky1_option(k))
        .collect();
    for option in sky1 {
        report.sky1_options.push(Divergence {
            option: option.clone(),
            values: tracks
                .iter()
                .map(|(t, cfg)| (t.clone(), cfg.get(option).cloned().unwrap_or_else(|| "-".into())))
                .collect(),
        });
    }
    report
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigReview {
    pub added: ConfigMap,
    pub removed: ConfigMap,
    pub changed: BTreeMap<String, (String, String)>,
}

impl ConfigReview {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn added_by_category(&self) -> BTreeMap<&'static str, Vec<(&str, &str)>> {
        let mut out: BTreeMap<&'static str, Vec<(&str, &str)>> = BTreeMap::new();
        for (k, v) in &self.added {
            out.entry(categorize_option(k))
                .or_default()
                .push((k.as_str(), v.as_str()));
        }
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.added.is_empty() {
            let _ = writeln!(out, "--- NEW options ({}) ---", self.added.len());
            let mut by_cat = self.added_by_category();
            let mut order: Vec<&'static str> = PRIORITY_CATEGORIES
                .iter()
                .copied()
                .filter(|c| by_cat.contains_key(c))
                .collect();
            order.extend(
                by_cat
                    .keys()
                    .copied()
                    .filter(|c| !PRIORITY_CATEGORIES.contains(c)),
            );
            for cat in order {
                let items = by_cat.remove(cat).unwrap_or_default();
                let limit = if PRIORITY_CATEGORIES.contains(&cat) || items.len() <= 10 {
                    let _ = writeln!(out, "\n  [{cat}]");
                    items.len()
                } else {
                    let _ = writeln!(out, "\n  [{cat}] ({} options, showing first 5)", items.len());
                    5
                };
                for (k, v) in &items[..limit] {
                    let _ = writeln!(out, "    {k}={v}");
                }
                if limit < items.len() {
                    let _ = writeln!(out, "    ... ({} more)", items.len() - limit);
                }
            }
            out.push('\n');
        }
        if !self.removed.is_empty() {
            let _ = writeln!(out, "--- REMOVED options ({}) ---", self.removed.len());
            let was_enabled: Vec<_> = self
                .removed
                .iter()
                .filter(|(_, v)| matches!(v.as_str(), "y" | "m"))
                .collect();
            if !was_enabled.is_empty() {
                let _ = writeln!(out, "\n  Previously ENABLED (review!):");
                for (k, v) in was_enabled {
                    let _ = writeln!(out, "    {k} (was: {v})");
                }
            }
            let disabled = self.removed.values().filter(|v| v.as_str() == "n").count();
            if disabled > 0 {
                let _ = writeln!(out, "\n  Previously disabled ({disabled} options, no action needed)");
            }
            out.push('\n');
        }
        if !self.changed.is_empty() {
            let _ = writeln!(out, "--- CHANGED values ({}) ---", self.changed.len());
            for (k, (old, new)) in &self.changed {
                let flag = if is_sky1_option(k) { " [Sky1]" } else { "" };
                let _ = writeln!(out, "  {k}: {old} -> {new}{flag}");
            }
            out.push('\n');
        }
        let _ = writeln!(out, "--- Summary ---");
        let _ = writeln!(out, "  {} new options", self.added.len());
        let _ = writeln!(out, "  {} removed options", self.removed.len());
        let _ = writeln!(out, "  {} changed values", self.changed.len());
        out
    }
}

/// What changed between two configs, e.g. before and after `olddefconfig`.
pub fn review(old: &ConfigMap, new: &ConfigMap) -> ConfigReview {
    let mut r = ConfigReview::default();
    for (k, v) in new {
        if is_ignored(k) {
            continue;
        }
        match old.get(k) {
            None => {
                r.added.insert(k.clone(), v.clone());
            }
            Some(prev) if prev != v => {
                r.changed.insert(k.clone(), (prev.clone(), v.clone()));
            }
            Some(_) => {}
        }
    }
    for (k, v) in old {
        if !is_ignored(k) && !new.contains_key(k) {
            r.removed.insert(k.clone(), v.clone());
        }
    }
    r
}

/// Option lines present in only one of the two configs, toolchain symbols
/// aside.
pub fn drift_count(local: &str, release: &str) -> usize {
    let lines = |text: &str| -> BTreeSet<String> {
        text.lines()
            .filter(|l| l.starts_with("CONFIG_"))
            .filter(|l| !is_ignored(l.split_once('=').map_or(*l, |(k, _)| k)))
            .map(str::to_string)
            .collect()
    };
    let a = lines(local);
    let b = lines(release);
    a.symmetric_difference(&b).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = "\
CONFIG_CC_VERSION_TEXT=\"gcc 14.2.0\"
CONFIG_USB_UAS=m
# CONFIG_DRM_PANTHOR is not set
CONFIG_ARCH_CIX=y
";

    #[test]
    fn parses_enabled_and_unset_options() {
        let cfg = parse_config(CFG);
        assert_eq!(cfg["CONFIG_USB_UAS"], "m");
        assert_eq!(cfg["CONFIG_DRM_PANTHOR"], "n");
        assert_eq!(enabled_count(&cfg), 3);
    }

    #[test]
    fn set_config_line_rewrites_both_forms() {
        let (text, changed) = set_config_line(CFG, "DRM_PANTHOR", "m");
        assert!(changed);
        assert!(text.contains("\nCONFIG_DRM_PANTHOR=m\n"));

        let (text, changed) = set_config_line(&text, "CONFIG_USB_UAS", "n");
        assert!(changed);
        assert!(text.contains("# CONFIG_USB_UAS is not set"));

        let (same, changed) = set_config_line(&text, "USB_UAS", "n");
        assert!(!changed);
        assert_eq!(same, text);

        let (_, changed) = set_config_line(CFG, "NOT_THERE", "y");
        assert!(!changed);
    }

    #[test]
    fn policy_entries_are_added_updated_and_removed() {
        let policy = "[usb]\nUSB_UAS=m\n\n[gpu]\nDRM_PANTHOR=m\n";
        let (text, changed) = set_policy_entry(policy, "usb_storage", "y", "usb");
        assert!(changed);
        assert_eq!(text, "[usb]\nUSB_UAS=m\nUSB_STORAGE=y\n\n[gpu]\nDRM_PANTHOR=m\n");

        let (text, changed) = set_policy_entry(&text, "DRM_PANTHOR", "y", "gpu");
        assert!(changed);
        assert!(text.contains("DRM_PANTHOR=y"));
        let (_, changed) = set_policy_entry(&text, "DRM_PANTHOR", "y", "gpu");
        assert!(!changed);

        let (text, changed) = set_policy_entry(&text, "SND_SOC_CIX", "m", "audio");
        assert!(changed);
        assert!(text.ends_with("\n[audio]\nSND_SOC_CIX=m\n"));

        let (text, removed) = remove_policy_entry(&text, "CONFIG_USB_UAS");
        assert!(removed);
        assert!(!text.contains("USB_UAS"));

        let entries = parse_policy(&text);
        assert!(entries.contains(&PolicyEntry {
            section: "audio".into(),
            option: "SND_SOC_CIX".into(),
            value: "m".into(),
        }));
    }

    #[test]
    fn reconcile_reports_violations_and_divergence() {
        let lts = parse_config("CONFIG_USB_UAS=m\nCONFIG_ARCH_CIX=y\nCONFIG_DRM_PANTHOR=m\n");
        let rc = parse_config("CONFIG_ARCH_CIX=y\n# CONFIG_DRM_PANTHOR is not set\n");
        let policy = ConfigMap::from([("CONFIG_USB_UAS".to_string(), "m".to_string())]);

        let report = reconcile(&[("main".into(), lts), ("rc".into(), rc)], &policy);
        assert_eq!(
            report.violations,
            vec![Violation {
                track: "rc".into(),
                option: "CONFIG_USB_UAS".into(),
                actual: None,
                required: "m".into(),
            }]
        );
        let divergent: Vec<&str> = report.divergent().map(|d| d.option.as_str()).collect();
        assert_eq!(divergent, vec!["CONFIG_DRM_PANTHOR"]);
        assert_eq!(report.sky1_options.len(), 2);
        assert!(report.render(false).contains("1 policy violation(s)"));
    }

    #[test]
    fn review_ignores_toolchain_symbols() {
        let old = parse_config("CONFIG_CC_VERSION_TEXT=\"gcc 13\"\nCONFIG_USB_UAS=m\nCONFIG_OLD=y\n");
        let new = parse_config(
            "CONFIG_CC_VERSION_TEXT=\"gcc 14\"\nCONFIG_USB_UAS=y\nCONFIG_DRM_NEW=m\nCONFIG_CIX_DDR=y\n",
        );
        let r = review(&old, &new);
        assert_eq!(r.added.keys().collect::<Vec<_>>(), vec!["CONFIG_CIX_DDR", "CONFIG_DRM_NEW"]);
        assert_eq!(r.removed.keys().collect::<Vec<_>>(), vec!["CONFIG_OLD"]);
        assert_eq!(
            r.changed.get("CONFIG_USB_UAS"),
            Some(&("m".to_string(), "y".to_string()))
        );
        let cats = r.added_by_category();
        assert_eq!(cats["Sky1"], vec![("CONFIG_CIX_DDR", "y")]);
        assert_eq!(cats["Display/GPU"], vec![("CONFIG_DRM_NEW", "m")]);

        let text = r.render();
        assert!(text.find("[Sky1]") < text.find("[Display/GPU]"));
    }

    #[test]
    fn drift_counts_differing_lines() {
        let local = "CONFIG_GCC_VERSION=140200\nCONFIG_USB_UAS=m\nCONFIG_A=y\n";
        let release = "CONFIG_GCC_VERSION=130300\nCONFIG_USB_UAS=y\nCONFIG_A=y\n";
        assert_eq!(drift_count(local, release), 2);
        assert_eq!(drift_count(release, release), 0);
    }

    #[test]
    fn categories_and_markers() {
        assert_eq!(categorize_option("CONFIG_NF_TABLES"), "Network/Netfilter");
        assert_eq!(categorize_option("CONFIG_EXT4_FS"), "Other");
        assert!(is_sky1_option("CONFIG_PHY_CIX_PCIE"));
        assert!(!is_sky1_option("CONFIG_USB_UAS"));
    }
}
