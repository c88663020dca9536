//! Patch-set identity and the markers a prepared source tree carries.
//!
//! The identity of a patch directory is a digest over `<sha256>  <relpath>`
//! lines of every regular file in it, sorted, so it does not depend on the
//! order the filesystem lists entries in. Preparation records that digest
//! inside the source tree; every build recomputes it and refuses to go on
//! when the two differ.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const HASH_MARKER: &str = ".skb-patchset.sha256";
pub const SOURCE_MARKER: &str = ".skb-source";

fn rel_string(root: &Path, p: &Path) -> Result<String> {
    let rel = p
        .strip_prefix(root)
        .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn regular_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.is_dir() {
        return Err(Error::missing(format!(
            "patch directory {} does not exist",
            dir.display()
        )));
    }
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        out.push((rel_string(dir, entry.path())?, entry.path().to_path_buf()));
    }
    out.sort();
    Ok(out)
}

/// Order-independent content digest of a patch directory. An empty directory
/// digests to the SHA-256 of empty input.
pub fn digest_patch_dir(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for (rel, path) in regular_files(dir)? {
        hasher.update(format!("{}  {}\n", hash_file(&path)?, rel).as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Patches to apply, in application order.
pub fn list_patches(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(regular_files(dir)?
        .into_iter()
        .filter(|(rel, _)| rel.ends_with(".patch") || rel.ends_with(".diff"))
        .map(|(_, p)| p)
        .collect())
}

pub fn write_hash_marker(src_dir: &Path, digest: &str) -> Result<()> {
    let path = src_dir.join(HASH_MARKER);
    fs::write(&path, format!("{digest}\n"))
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
}

pub fn read_hash_marker(src_dir: &Path) -> Result<Option<String>> {
    let path = src_dir.join(HASH_MARKER);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    Ok(Some(raw.trim().to_string()))
}

/// What a prepared tree was prepared from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMarker {
    pub variant: String,
    pub kernel_version: String,
    /// Tarball URL or git ref the tree came from.
    pub reference: String,
    pub patches_applied: usize,
    pub prepared_at: String,
}

impl SourceMarker {
    pub fn write(&self, src_dir: &Path) -> Result<()> {
        let path = src_dir.join(SOURCE_MARKER);
        let body = format!(
            "variant={}\nkernel_version={}\nreference={}\npatches_applied={}\nprepared_at={}\n",
            self.variant, self.kernel_version, self.reference, self.patches_applied, self.prepared_at
        );
        fs::write(&path, body)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
    }

    pub fn read(src_dir: &Path) -> Result<Option<Self>> {
        let path = src_dir.join(SOURCE_MARKER);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        let mut marker = SourceMarker {
            variant: String::new(),
            kernel_version: String::new(),
            reference: String::new(),
            patches_applied: 0,
            prepared_at: String::new(),
        };
        for line in raw.lines() {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let v = v.trim().to_string();
            match k.trim() {
                "variant" => marker.variant = v,
                "kernel_version" => marker.kernel_version = v,
                "reference" => marker.reference = v,
                "patches_applied" => {
                    marker.patches_applied = v.parse().map_err(|_| {
                        Error::msg(format!(
                            "{}: invalid patches_applied '{v}'",
                            path.display()
                        ))
                    })?
                }
                "prepared_at" => marker.prepared_at = v,
                _ => {}
            }
        }
        Ok(Some(marker))
    }
}

/// Refuse to build a tree prepared from a different patch set or variant.
/// Returns the current digest.
pub fn check_staleness(src_dir: &Path, patch_dir: &Path, variant: &str) -> Result<String> {
    let reprepare = format!("re-run `skb prepare` for variant '{variant}'");
    if !src_dir.is_dir() {
        return Err(Error::missing(format!(
            "prepared source {} not found; {reprepare}",
            src_dir.display()
        )));
    }
    let Some(recorded) = read_hash_marker(src_dir)? else {
        return Err(Error::missing(format!(
            "{} has no {HASH_MARKER}; {reprepare}",
            src_dir.display()
        )));
    };
    if let Some(marker) = SourceMarker::read(src_dir)? {
        if marker.variant != variant {
            return Err(Error::stale(format!(
                "{} was prepared for variant '{}', not '{variant}'; {reprepare}",
                src_dir.display(),
                marker.variant
            )));
        }
    }
    let current = digest_patch_dir(patch_dir)?;
    if current != recorded {
        return Err(Error::stale(format!(
            "patch set {} changed since the source was prepared (recorded {}, now {}); {reprepare}",
            patch_dir.display(),
            short(&recorded),
            short(&current)
        )));
    }
    Ok(current)
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn corrupt_patch_count_names_the_marker() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join(SOURCE_MARKER),
            "variant=main\nkernel_version=6.18.9\npatches_applied=twelve\n",
        )
        .expect("write");
        let err = SourceMarker::read(tmp.path()).unwrap_err().to_string();
        assert!(err.contains(SOURCE_MARKER), "{err}");
        assert!(err.contains("'twelve'"), "{err}");

        fs::write(tmp.path().join(SOURCE_MARKER), "patches_applied=12\n").expect("write");
        let marker = SourceMarker::read(tmp.path()).expect("read").expect("marker");
        assert_eq!(marker.patches_applied, 12);
    }

    #[test]
    fn empty_directory_digests_to_empty_input() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(digest_patch_dir(tmp.path()).expect("digest"), EMPTY_SHA256);
    }

    #[test]
    fn digest_ignores_creation_order() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        fs::write(a.path().join("0001-a.patch"), "one").expect("write");
        fs::write(a.path().join("0002-b.patch"), "two").expect("write");
        fs::write(b.path().join("0002-b.patch"), "two").expect("write");
        fs::write(b.path().join("0001-a.patch"), "one").expect("write");
        assert_eq!(
            digest_patch_dir(a.path()).expect("digest a"),
            digest_patch_dir(b.path()).expect("digest b")
        );
    }

    #[test]
    fn digest_covers_names_and_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("0001-a.patch"), "one").expect("write");
        let before = digest_patch_dir(tmp.path()).expect("digest");
        fs::rename(tmp.path().join("0001-a.patch"), tmp.path().join("0001-b.patch"))
            .expect("rename");
        assert_ne!(before, digest_patch_dir(tmp.path()).expect("digest"));
    }

    #[test]
    fn patches_listed_in_name_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["0002-b.patch", "README", "0001-a.diff", "0003-c.patch"] {
            fs::write(tmp.path().join(name), "x").expect("write");
        }
        let names: Vec<String> = list_patches(tmp.path())
            .expect("list")
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["0001-a.diff", "0002-b.patch", "0003-c.patch"]);
    }

    #[test]
    fn missing_patch_directory_is_a_missing_prerequisite() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = digest_patch_dir(&tmp.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingPrerequisite);
    }

    #[test]
    fn source_marker_survives_a_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = SourceMarker {
            variant: "rc".into(),
            kernel_version: "6.19-rc7".into(),
            reference: "v6.19-rc7".into(),
            patches_applied: 12,
            prepared_at: "2026-01-30T10:00:00Z".into(),
        };
        marker.write(tmp.path()).expect("write");
        assert_eq!(SourceMarker::read(tmp.path()).expect("read"), Some(marker));
    }
}
