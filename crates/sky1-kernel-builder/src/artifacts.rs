//! Selecting a variant's packages from a directory of build output.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::kversion::KernelVersion;
use crate::variants::EXCLUDED_ARTIFACTS;

pub const MANIFEST_FILE: &str = "artifacts.json";

/// A `.deb` named the Debian way: `name_version_arch.deb`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebFile {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    /// Version without the Debian revision (`6.19.0~rc7`).
    pub upstream: String,
    pub revision: String,
    pub arch: String,
}

impl DebFile {
    pub fn parse(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bad = || Error::msg(format!("'{file_name}' is not named name_version_arch.deb"));
        let stem = file_name.strip_suffix(".deb").ok_or_else(bad)?;
        let mut parts = stem.split('_');
        let (Some(name), Some(version), Some(arch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        if name.is_empty() || version.is_empty() || arch.is_empty() {
            return Err(bad());
        }
        let (upstream, revision) = split_revision(version);
        Ok(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            version: version.to_string(),
            upstream: upstream.to_string(),
            revision: revision.to_string(),
            arch: arch.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}_{}.deb", self.name, self.version, self.arch)
    }
}

/// `6.19.0~rc7-5` -> (`6.19.0~rc7`, `5`). A version without a revision keeps
/// everything as upstream.
pub fn split_revision(version: &str) -> (&str, &str) {
    let version = version.split_once(':').map_or(version, |(_, v)| v);
    version.rsplit_once('-').unwrap_or((version, ""))
}

/// Numeric revision, if the revision is a plain number.
pub fn revision_number(revision: &str) -> Option<u64> {
    revision.parse().ok()
}

fn glob_set(patterns: &[String]) -> Result<Vec<GlobSet>> {
    patterns
        .iter()
        .map(|p| -> Result<GlobSet> {
            let mut b = GlobSetBuilder::new();
            b.add(Glob::new(p)?);
            Ok(b.build()?)
        })
        .collect()
}

fn excluded_set() -> Result<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in EXCLUDED_ARTIFACTS {
        b.add(Glob::new(p)?);
    }
    Ok(b.build()?)
}

fn deb_files_in(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Err(Error::missing(format!(
            "artifact directory {} does not exist",
            dir.display()
        )));
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".deb") && entry.file_type()?.is_file() {
            out.push((name, entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

/// Files in `dir` matching `patterns`, in pattern order. Excluded packages
/// never match; no match at all is an error listing what is there.
pub fn select_artifacts(dir: &Path, patterns: &[String]) -> Result<Vec<DebFile>> {
    let candidates = deb_files_in(dir)?;
    let excluded = excluded_set()?;
    let sets = glob_set(patterns)?;

    let mut taken = BTreeSet::<&str>::new();
    let mut out = Vec::new();
    for set in &sets {
        for (name, path) in &candidates {
            if excluded.is_match(name) || taken.contains(name.as_str()) || !set.is_match(name) {
                continue;
            }
            taken.insert(name.as_str());
            out.push(DebFile::parse(path)?);
        }
    }

    if out.is_empty() {
        let present = if candidates.is_empty() {
            "no .deb files".to_string()
        } else {
            candidates
                .iter()
                .map(|(n, _)| n.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        return Err(Error::new(
            ErrorKind::NoArtifacts,
            format!(
                "no artifacts in {} match [{}]; present: {present}",
                dir.display(),
                patterns.join(", ")
            ),
        ));
    }
    Ok(out)
}

/// Distinct upstream kernel versions in a selection.
pub fn upstream_versions(selection: &[DebFile]) -> BTreeSet<String> {
    selection.iter().map(|d| d.upstream.clone()).collect()
}

/// Warning text when a selection mixes kernel versions, which usually means
/// stale packages from an earlier build are still lying around.
pub fn multi_version_warning(selection: &[DebFile]) -> Option<String> {
    let versions = upstream_versions(selection);
    (versions.len() > 1).then(|| {
        format!(
            "artifacts span {} kernel versions ({}); stale packages from an earlier build may be published",
            versions.len(),
            versions.into_iter().collect::<Vec<_>>().join(", ")
        )
    })
}

/// Keep artifacts of one kernel version. The filter may be written as a tag
/// (`6.19-rc7`) or as a version prefix (`6.18`).
pub fn filter_version(selection: Vec<DebFile>, filter: &str) -> Vec<DebFile> {
    let filter = filter.trim();
    if filter.is_empty() {
        return selection;
    }
    let wanted = KernelVersion::parse(filter)
        .ok()
        .filter(|v| v.sublevel != 0 || v.is_rc() || filter.matches('.').count() == 2)
        .map(|v| v.debian_upstream());
    selection
        .into_iter()
        .filter(|d| match &wanted {
            Some(exact) => d.upstream == *exact,
            None => {
                d.upstream == filter
                    || d.upstream
                        .strip_prefix(filter)
                        .is_some_and(|rest| rest.starts_with(['.', '~']))
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub file: String,
    pub name: String,
    pub version: String,
    pub arch: String,
    pub sha256: String,
}

/// `artifacts.json` written next to the collected packages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactManifest {
    pub variant: String,
    pub kernel_version: String,
    pub revision: u32,
    pub collected_at: String,
    pub artifacts: Vec<ArtifactRecord>,
}

impl ArtifactManifest {
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| Error::msg(format!("artifact manifest encode failed: {e}")))?;
        fs::write(&path, body + "\n")
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        Ok(path)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).map_err(|e| {
            Error::missing(format!(
                "failed to read {} (run `skb build` first): {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::msg(format!("invalid artifact manifest {}: {e}", path.display())))
    }

    pub fn paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.artifacts.iter().map(|a| dir.join(&a.file)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, names: &[&str]) {
        for n in names {
            fs::write(dir.join(n), b"").expect("write");
        }
    }

    fn rc_patterns() -> Vec<String> {
        [
            "linux-image-*-sky1-rc_*.deb",
            "linux-headers-*-sky1-rc_*.deb",
            "linux-image-*-sky1-rc-dbg_*.deb",
            "linux-image-sky1-rc_*.deb",
            "linux-headers-sky1-rc_*.deb",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn parses_debian_file_names() {
        let d = DebFile::parse(Path::new("/x/linux-image-6.19.0-rc7-sky1-rc_6.19.0~rc7-5_arm64.deb"))
            .expect("parse");
        assert_eq!(d.name, "linux-image-6.19.0-rc7-sky1-rc");
        assert_eq!(d.upstream, "6.19.0~rc7");
        assert_eq!(d.revision, "5");
        assert_eq!(d.arch, "arm64");
        assert!(DebFile::parse(Path::new("README.deb")).is_err());
    }

    #[test]
    fn selects_in_pattern_order_and_skips_libc_dev() {
        let tmp = tempfile::tempdir().expect("tempdir");
        touch(
            tmp.path(),
            &[
                "linux-headers-6.19.0-rc7-sky1-rc_6.19.0~rc7-5_arm64.deb",
                "linux-image-6.19.0-rc7-sky1-rc_6.19.0~rc7-5_arm64.deb",
                "linux-image-6.19.0-rc7-sky1-rc-dbg_6.19.0~rc7-5_arm64.deb",
                "linux-libc-dev_6.19.0~rc7-5_arm64.deb",
                "linux-image-6.18.9-sky1_6.18.9-1_arm64.deb",
            ],
        );
        let names: Vec<String> = select_artifacts(tmp.path(), &rc_patterns())
            .expect("select")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "linux-image-6.19.0-rc7-sky1-rc",
                "linux-headers-6.19.0-rc7-sky1-rc",
                "linux-image-6.19.0-rc7-sky1-rc-dbg",
            ]
        );
    }

    #[test]
    fn libc_dev_is_excluded_even_when_a_pattern_names_it() {
        let tmp = tempfile::tempdir().expect("tempdir");
        touch(tmp.path(), &["linux-libc-dev_6.18.9-1_arm64.deb"]);
        let err = select_artifacts(tmp.path(), &["linux-*.deb".to_string()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoArtifacts);
    }

    #[test]
    fn no_match_lists_present_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        touch(tmp.path(), &["linux-image-6.18.9-sky1_6.18.9-1_arm64.deb"]);
        let err = select_artifacts(tmp.path(), &rc_patterns()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoArtifacts);
        assert!(err.to_string().contains("linux-image-6.18.9-sky1_6.18.9-1_arm64.deb"));
    }

    #[test]
    fn mixed_versions_produce_a_warning() {
        let tmp = tempfile::tempdir().expect("tempdir");
        touch(
            tmp.path(),
            &[
                "linux-image-6.19.0-rc6-sky1-rc_6.19.0~rc6-2_arm64.deb",
                "linux-image-6.19.0-rc7-sky1-rc_6.19.0~rc7-1_arm64.deb",
            ],
        );
        let sel = select_artifacts(tmp.path(), &rc_patterns()).expect("select");
        let warning = multi_version_warning(&sel).expect("warning");
        assert!(warning.contains("6.19.0~rc6, 6.19.0~rc7"), "unexpected: {warning}");
        assert!(multi_version_warning(&sel[..1]).is_none());
    }

    #[test]
    fn version_filter_accepts_tags_and_prefixes() {
        let sel: Vec<DebFile> = [
            "linux-image-6.18.9-sky1_6.18.9-1_arm64.deb",
            "linux-image-6.18.10-sky1_6.18.10-1_arm64.deb",
            "linux-image-6.1.5-sky1_6.1.5-1_arm64.deb",
            "linux-image-6.19.0-rc7-sky1-rc_6.19.0~rc7-1_arm64.deb",
        ]
        .iter()
        .map(|n| DebFile::parse(Path::new(n)).expect("parse"))
        .collect();

        let upstreams = |v: Vec<DebFile>| v.into_iter().map(|d| d.upstream).collect::<Vec<_>>();
        assert_eq!(upstreams(filter_version(sel.clone(), "6.18.9")), vec!["6.18.9"]);
        assert_eq!(
            upstreams(filter_version(sel.clone(), "6.18")),
            vec!["6.18.9", "6.18.10"]
        );
        assert_eq!(
            upstreams(filter_version(sel.clone(), "6.19-rc7")),
            vec!["6.19.0~rc7"]
        );
        assert_eq!(filter_version(sel, "").len(), 4);
    }
}
