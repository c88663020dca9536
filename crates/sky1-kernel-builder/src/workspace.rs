use std::collections::BTreeMap;
use std::fs;
use std::path::Component;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Sibling checkouts the pipeline expects next to the workspace unless
/// `[workspace.paths]` or `SKB_PATH_<NAME>` says otherwise.
pub const BUILTIN_PATHS: &[(&str, &str)] = &[
    ("linux_sky1", "../linux-sky1"),
    ("apt_repo", "../apt-repo"),
    ("mainline", "../mainline-linux"),
];

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    pub build_dir: String,
    pub out_dir: String,
    pub paths: BTreeMap<String, String>,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            paths: BTreeMap::new(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    // Resolve a user-configured path:
    // - `@alias/...` expands from the named directories
    // - absolute paths are used as-is
    // - relative paths are rooted at workspace root
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        resolve_config_path(self, raw)
    }

    /// Per-variant scratch area. `make bindeb-pkg` drops its packages here,
    /// next to the prepared source.
    pub fn variant_build_dir(&self, variant: &str) -> Result<PathBuf> {
        resolve_under(&self.root, &self.build_dir, variant)
    }

    /// The prepared (fetched and patched) kernel tree of a variant.
    pub fn source_dir(&self, variant: &str) -> Result<PathBuf> {
        Ok(self.variant_build_dir(variant)?.join("src"))
    }

    /// Where collected and post-processed packages of a variant end up.
    pub fn variant_out_dir(&self, variant: &str) -> Result<PathBuf> {
        resolve_under(&self.root, &self.out_dir, variant)
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    let named_dirs = resolve_named_dirs(&root, &build_dir, &out_dir, &cfg.paths, |k| {
        std::env::var(k).ok()
    })?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
        named_dirs,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Build => safe_remove_dir_all(&paths.root, &paths.build_dir)?,
        CleanMode::Out => safe_remove_dir_all(&paths.root, &paths.out_dir)?,
        CleanMode::All => {
            safe_remove_dir_all(&paths.root, &paths.build_dir)?;
            safe_remove_dir_all(&paths.root, &paths.out_dir)?;
        }
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }

    Ok(paths)
}

/// `SKB_PATH_<NAME>` for a named path (`linux_sky1` -> `SKB_PATH_LINUX_SKY1`).
pub fn env_override_key(name: &str) -> String {
    format!("SKB_PATH_{}", name.to_ascii_uppercase().replace('-', "_"))
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    resolve_user_path(root, p)
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn resolve_named_dirs(
    root: &Path,
    build_dir: &Path,
    out_dir: &Path,
    paths: &BTreeMap<String, String>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut raw: BTreeMap<String, String> = BUILTIN_PATHS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for (name, value) in paths {
        let key = name.trim();
        if key.is_empty() {
            return Err(Error::msg("workspace.paths has an empty key"));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::msg(format!(
                "workspace.paths key '{key}' is invalid (allowed: a-zA-Z0-9_-)"
            )));
        }
        if matches!(key, "root" | "build" | "out") {
            return Err(Error::msg(format!("workspace.paths key '{key}' is reserved")));
        }
        raw.insert(key.to_string(), value.clone());
    }

    let mut out = BTreeMap::<String, PathBuf>::new();
    out.insert("root".into(), root.to_path_buf());
    out.insert("build".into(), build_dir.to_path_buf());
    out.insert("out".into(), out_dir.to_path_buf());
    for (name, value) in raw {
        let value = match env(&env_override_key(&name)).filter(|v| !v.trim().is_empty()) {
            Some(v) => {
                tracing::debug!(alias = %name, path = %v, "workspace path overridden from environment");
                v
            }
            None => value,
        };
        out.insert(name, resolve_user_path(root, &value)?);
    }
    Ok(out)
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))?;
    Ok(())
}

fn resolve_config_path(ws: &WorkspacePaths, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::msg("empty path"));
    }

    if let Some(after_at) = raw.strip_prefix('@') {
        let (alias, rest) = match after_at.split_once('/') {
            Some((a, r)) => (a.trim(), Some(r)),
            None => (after_at.trim(), None),
        };
        if alias.is_empty() {
            return Err(Error::msg(format!("invalid alias path '{raw}'")));
        }
        let base = ws.named_dirs.get(alias).ok_or_else(|| {
            let known = ws.named_dirs.keys().cloned().collect::<Vec<_>>().join(", ");
            Error::msg(format!(
                "unknown workspace path alias '{alias}' in '{raw}' (known: {known})"
            ))
        })?;
        return Ok(match rest {
            Some(r) if !r.is_empty() => base.join(r),
            _ => base.to_path_buf(),
        });
    }

    let pb = PathBuf::from(raw);
    Ok(if pb.is_absolute() {
        pb
    } else {
        ws.root.join(pb)
    })
}

fn resolve_under(root: &Path, base: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(Error::msg("empty relative path"));
    }
    if Path::new(rel)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::msg(format!(
            "invalid relative path '{rel}' (must stay below {})",
            base.display()
        )));
    }
    let out = base.join(rel);
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let out_can = out.canonicalize().unwrap_or_else(|_| out.clone());
    if !out_can.starts_with(&root_can) {
        return Err(Error::msg(format!(
            "refusing path '{}' (outside workspace root '{}')",
            out.display(),
            root.display()
        )));
    }
    Ok(out)
}
