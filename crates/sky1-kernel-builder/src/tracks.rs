//! Maintenance of the per-variant kernel configs behind `skb config`.
//!
//! Every command first computes a [`ChangeSet`]; nothing is written unless
//! the caller applies it.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::kconfig::{
    self, ConfigMap, ReconcileReport, enabled_count, normalize_option, parse_config, parse_policy,
    policy_requirements, remove_policy_entry, set_config_line, set_policy_entry,
};
use crate::variants::load_variants;
use crate::workspace::WorkspacePaths;

/// `[kconfig]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KconfigSettings {
    pub policy: String,
}

impl Default for KconfigSettings {
    fn default() -> Self {
        Self {
            policy: "@linux_sky1/config/config-policy.ini".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub variant: String,
    pub path: PathBuf,
}

impl Track {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// One config file per variant, in variant order.
pub fn tracks(doc: &ConfigDoc, ws: &WorkspacePaths) -> Result<Vec<Track>> {
    load_variants(doc)?
        .into_values()
        .map(|v| {
            Ok(Track {
                path: ws.resolve_config_path(&v.config)?,
                variant: v.name,
            })
        })
        .collect()
}

pub fn policy_path(doc: &ConfigDoc, ws: &WorkspacePaths) -> Result<PathBuf> {
    let s: KconfigSettings = doc.deserialize_path("kconfig")?.unwrap_or_default();
    ws.resolve_config_path(&s.policy)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))
}

fn read_if_exists(path: &Path) -> Result<Option<String>> {
    if path.is_file() { read(path).map(Some) } else { Ok(None) }
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub description: String,
    pub new_text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<FileChange>,
    pub notes: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn render(&self, apply: bool) -> String {
        let mut out = String::new();
        for n in &self.notes {
            let _ = writeln!(out, "  warn: {n}");
        }
        if self.changes.is_empty() {
            let _ = writeln!(out, "No changes needed.");
            return out;
        }
        let _ = writeln!(
            out,
            "{}: {} file(s) to update\n",
            if apply { "Will apply" } else { "Dry run" },
            self.changes.len()
        );
        for c in &self.changes {
            let _ = writeln!(out, "  {}: {}", c.path.display(), c.description);
        }
        if !apply {
            let _ = writeln!(out, "\nPass --apply to write changes.");
        }
        out
    }

    pub fn apply(&self) -> Result<()> {
        for c in &self.changes {
            fs::write(&c.path, &c.new_text)
                .map_err(|e| Error::msg(format!("failed to write {}: {e}", c.path.display())))?;
            tracing::info!(path = %c.path.display(), "{}", c.description);
        }
        Ok(())
    }
}

/// Value of one option in every track and in the policy.
pub fn show(tracks: &[Track], policy: &Path, option: &str) -> Result<String> {
    let bare = normalize_option(option);
    let key = format!("CONFIG_{bare}");
    let mut out = format!("=== {key} ===\n\n");
    for t in tracks {
        let shown = match read_if_exists(&t.path)? {
            None => "(file missing)".to_string(),
            Some(text) => match parse_config(&text).get(&key).map(String::as_str) {
                Some("n") => format!("# {key} is not set"),
                Some(v) => format!("{key}={v}"),
                None => "(not found)".to_string(),
            },
        };
        let _ = writeln!(out, "  {:25} {shown}", t.file_name());
    }
    let entry = read_if_exists(policy)?
        .map(|text| parse_policy(&text))
        .unwrap_or_default()
        .into_iter()
        .find(|e| e.option == bare);
    match entry {
        Some(e) => {
            let _ = writeln!(out, "  {:25} [{}] {}={}", "policy", e.section, e.option, e.value);
        }
        None => {
            let _ = writeln!(out, "  {:25} (not in policy)", "policy");
        }
    }
    Ok(out)
}

/// Set an option in every track that mentions it, and optionally record it
/// in the policy under `policy_section`.
pub fn plan_set(
    tracks: &[Track],
    policy: &Path,
    option: &str,
    value: &str,
    policy_section: Option<&str>,
) -> Result<ChangeSet> {
    let key = format!("CONFIG_{}", normalize_option(option));
    let mut set = ChangeSet::default();
    for t in tracks {
        let Some(text) = read_if_exists(&t.path)? else {
            set.notes.push(format!("{} does not exist", t.path.display()));
            continue;
        };
        let (new_text, changed) = set_config_line(&text, option, value);
        if changed {
            set.changes.push(FileChange {
                path: t.path.clone(),
                description: format!("set {key}={value}"),
                new_text,
            });
        } else if !parse_config(&text).contains_key(&key) {
            set.notes.push(format!(
                "{key} not found in {} (may not exist in this kernel version)",
                t.file_name()
            ));
        }
    }
    if let Some(section) = policy_section {
        let text = read_if_exists(policy)?.unwrap_or_default();
        let (new_text, changed) = set_policy_entry(&text, option, value, section);
        if changed {
            set.changes.push(FileChange {
                path: policy.to_path_buf(),
                description: format!("add {}={value} to [{section}]", normalize_option(option)),
                new_text,
            });
        }
    }
    Ok(set)
}

/// Drop an option from the policy. Config values are left alone.
pub fn plan_remove(policy: &Path, option: &str) -> Result<ChangeSet> {
    let mut set = ChangeSet::default();
    let Some(text) = read_if_exists(policy)? else {
        set.notes.push(format!("{} does not exist", policy.display()));
        return Ok(set);
    };
    let (new_text, changed) = remove_policy_entry(&text, option);
    if changed {
        set.changes.push(FileChange {
            path: policy.to_path_buf(),
            description: format!("remove {} from policy", normalize_option(option)),
            new_text,
        });
    }
    Ok(set)
}

pub struct Reconciliation {
    pub loaded: Vec<(Track, usize)>,
    pub report: ReconcileReport,
    /// Rewrites of policy violations, when fixing was asked for.
    pub fixes: ChangeSet,
}

/// Check every existing track against the policy and each other. With `fix`,
/// values violating the policy are rewritten; missing options are not added.
pub fn reconcile_tracks(tracks: &[Track], policy: &Path, fix: bool) -> Result<Reconciliation> {
    let mut loaded = Vec::new();
    let mut texts = Vec::new();
    let mut configs: Vec<(String, ConfigMap)> = Vec::new();
    for t in tracks {
        let Some(text) = read_if_exists(&t.path)? else {
            continue;
        };
        let cfg = parse_config(&text);
        loaded.push((t.clone(), enabled_count(&cfg)));
        configs.push((t.file_name(), cfg));
        texts.push(text);
    }
    let requirements = read_if_exists(policy)?
        .map(|text| policy_requirements(&parse_policy(&text)))
        .unwrap_or_default();
    let report = kconfig::reconcile(&configs, &requirements);

    let mut fixes = ChangeSet::default();
    if fix {
        for ((track, _), text) in loaded.iter().zip(&texts) {
            let mut new_text = text.clone();
            let mut fixed = Vec::new();
            for v in report
                .violations
                .iter()
                .filter(|v| v.track == track.file_name() && v.actual.is_some())
            {
                let (t, changed) = set_config_line(&new_text, &v.option, &v.required);
                if changed {
                    new_text = t;
                    fixed.push(format!("{}={}", v.option, v.required));
                }
            }
            if !fixed.is_empty() {
                fixes.changes.push(FileChange {
                    path: track.path.clone(),
                    description: format!("fix {}", fixed.join(", ")),
                    new_text,
                });
            }
        }
    }
    Ok(Reconciliation {
        loaded,
        report,
        fixes,
    })
}

/// Review the options that differ between two config files.
pub fn review_files(old: &Path, new: &Path) -> Result<String> {
    let r = kconfig::review(&parse_config(&read(old)?), &parse_config(&read(new)?));
    let mut out = format!(
        "=== Config Review ===\n  Old: {}\n  New: {}\n\n",
        old.display(),
        new.display()
    );
    out.push_str(&r.render());
    Ok(out)
}
