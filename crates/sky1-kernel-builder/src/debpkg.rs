//! Post-processing of the packages `make bindeb-pkg` produces.
//!
//! Kernel variants are installed side by side, so their packages must not
//! fight over files. A [`FixupRule`] strips paths a package should not own,
//! pins the sibling package it belongs with, adds a version-independent
//! `Provides` alias and installs hooks maintaining a symlink. Every edit
//! checks for itself first: running the rules twice leaves the second run
//! with nothing to do.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use globset::Glob;
use serde::Deserialize;

use crate::control::ControlParagraph;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

const HOOK_BEGIN: &str = "# >>> skb symlink";
const HOOK_END: &str = "# <<< skb symlink";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SymlinkHook {
    /// Absolute path of the link on the target system.
    pub link: String,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FixupRule {
    /// Glob over package names.
    pub matches: String,
    /// Paths (relative to `/`) the package must not ship.
    #[serde(default)]
    pub strip: Vec<String>,
    /// Sibling package pinned to the exact same version in `Depends`.
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub symlink: Option<SymlinkHook>,
    #[serde(default)]
    pub provides: Vec<String>,
}

/// Values substituted into `{release}`, `{version}` and `{flavor}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixupVars {
    /// Kernel release including the local version (`6.18.9-sky1`).
    pub release: String,
    /// Debian version of the build (`6.18.9-1`).
    pub version: String,
    pub flavor: String,
    /// Timestamp given to files the post-processor writes.
    pub source_date_epoch: Option<i64>,
}

impl FixupVars {
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{release}", &self.release)
            .replace("{version}", &self.version)
            .replace("{flavor}", &self.flavor)
    }
}

/// Rules applied when `[[package.fixups]]` is not given.
///
/// The image package gives up its `build` link to the headers package, which
/// recreates it from its own hooks; the headers package depends on the image
/// of the same build.
pub fn default_fixups() -> Vec<FixupRule> {
    vec![
        FixupRule {
            matches: "linux-image-{release}".into(),
            strip: vec!["lib/modules/{release}/build".into()],
            depends_on: None,
            symlink: None,
            provides: vec!["linux-image-{flavor}-any".into()],
        },
        FixupRule {
            matches: "linux-headers-{release}".into(),
            strip: vec![],
            depends_on: Some("linux-image-{release}".into()),
            symlink: Some(SymlinkHook {
                link: "/lib/modules/{release}/build".into(),
                target: "/usr/src/linux-headers-{release}".into(),
            }),
            provides: vec!["linux-headers-{flavor}-any".into()],
        },
    ]
}

pub fn rule_applies(rule: &FixupRule, vars: &FixupVars, package: &str) -> Result<bool> {
    Ok(Glob::new(&vars.render(&rule.matches))?
        .compile_matcher()
        .is_match(package))
}

fn relative_inside(root: &Path, raw: &str) -> Result<PathBuf> {
    let rel = Path::new(raw.trim_start_matches('/'));
    if rel.as_os_str().is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(Error::msg(format!("invalid package path '{raw}'")));
    }
    Ok(root.join(rel))
}

fn strip_path(root: &Path, raw: &str) -> Result<bool> {
    let path = relative_inside(root, raw)?;
    let Ok(meta) = fs::symlink_metadata(&path) else {
        return Ok(false);
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(&path)
    } else {
        fs::remove_file(&path)
    };
    removed.map_err(|e| Error::msg(format!("failed to remove {}: {e}", path.display())))?;

    // md5sums must not list files the package no longer ships.
    let md5sums = root.join("DEBIAN/md5sums");
    if md5sums.exists() {
        let prefix = raw.trim_start_matches('/');
        let text = fs::read_to_string(&md5sums)?;
        let kept: String = text
            .lines()
            .filter(|line| {
                let file = line.split_once("  ").map_or("", |(_, f)| f);
                file != prefix && !file.starts_with(&format!("{prefix}/"))
            })
            .map(|l| format!("{l}\n"))
            .collect();
        if kept != text {
            fs::write(&md5sums, kept)?;
        }
    }
    Ok(true)
}

fn hook_block(kind: &str, hook: &SymlinkHook) -> String {
    let body = match kind {
        "postinst" => {
            let parent = Path::new(&hook.link)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".into());
            format!(
                "if [ \"$1\" = configure ]; then\n    mkdir -p '{parent}'\n    ln -sfn '{}' '{}'\nfi\n",
                hook.target, hook.link
            )
        }
        _ => format!(
            "if [ \"$1\" = remove ] && [ -L '{link}' ]; then\n    rm -f '{link}'\nfi\n",
            link = hook.link
        ),
    };
    format!("{HOOK_BEGIN} {}\n{body}{HOOK_END}\n", hook.link)
}

/// Insert or refresh the marked block in a maintainer script. Returns the new
/// text, or `None` when the block is already there.
pub fn inject_hook(existing: Option<&str>, block: &str) -> Option<String> {
    let Some(text) = existing else {
        return Some(format!("#!/bin/sh\nset -e\n\n{block}"));
    };
    let begin = block.lines().next().unwrap_or(HOOK_BEGIN);

    let mut lines: Vec<&str> = Vec::new();
    let mut old_block = String::new();
    let mut insert_at: Option<usize> = None;
    let mut in_block = false;
    for line in text.lines() {
        if !in_block && line == begin {
            in_block = true;
            insert_at.get_or_insert(lines.len());
            old_block.push_str(line);
            old_block.push('\n');
            continue;
        }
        if in_block {
            old_block.push_str(line);
            old_block.push('\n');
            if line == HOOK_END {
                in_block = false;
            }
            continue;
        }
        lines.push(line);
    }
    if old_block == block {
        return None;
    }

    let at = insert_at.unwrap_or_else(|| {
        // Hooks placed after a trailing `exit 0` would never run.
        match lines.iter().rposition(|l| !l.trim().is_empty()) {
            Some(i) if lines[i].trim() == "exit 0" => i,
            _ => lines.len(),
        }
    });
    let mut out = String::new();
    for line in &lines[..at] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(block);
    for line in &lines[at..] {
        out.push_str(line);
        out.push('\n');
    }
    Some(out)
}

fn write_script(path: &Path, text: &str, mtime: Option<i64>) -> Result<()> {
    fs::write(path, text)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    if let Some(epoch) = mtime {
        let t = filetime::FileTime::from_unix_time(epoch, 0);
        filetime::set_file_mtime(path, t)?;
    }
    Ok(())
}

/// Apply one rule to an unpacked package (`dpkg-deb -R` layout). Returns a
/// line per change made; empty when the package already conforms.
pub fn fixup_tree(root: &Path, rule: &FixupRule, vars: &FixupVars) -> Result<Vec<String>> {
    let control_path = root.join("DEBIAN/control");
    let control_text = fs::read_to_string(&control_path).map_err(|e| {
        Error::missing(format!("failed to read {}: {e}", control_path.display()))
    })?;
    let mut control = ControlParagraph::parse(&control_text)?;
    let mut changes = Vec::new();

    for raw in &rule.strip {
        let raw = vars.render(raw);
        if strip_path(root, &raw)? {
            changes.push(format!("stripped /{}", raw.trim_start_matches('/')));
        }
    }

    if let Some(dep) = &rule.depends_on {
        let relation = format!("{} (= {})", vars.render(dep), vars.version);
        if control.ensure_relation("Depends", &relation) {
            changes.push(format!("Depends: {relation}"));
        }
    }
    for alias in &rule.provides {
        let alias = vars.render(alias);
        if control.ensure_relation("Provides", &alias) {
            changes.push(format!("Provides: {alias}"));
        }
    }

    if let Some(hook) = &rule.symlink {
        let hook = SymlinkHook {
            link: vars.render(&hook.link),
            target: vars.render(&hook.target),
        };
        for kind in ["postinst", "prerm"] {
            let path = root.join("DEBIAN").join(kind);
            let existing = match fs::read_to_string(&path) {
                Ok(t) => Some(t),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    return Err(Error::msg(format!("failed to read {}: {e}", path.display())));
                }
            };
            if let Some(text) = inject_hook(existing.as_deref(), &hook_block(kind, &hook)) {
                write_script(&path, &text, vars.source_date_epoch)?;
                changes.push(format!("{kind} hook for {}", hook.link));
            }
        }
    }

    let rendered = control.to_string();
    if rendered != control_text {
        fs::write(&control_path, rendered)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", control_path.display())))?;
    }
    Ok(changes)
}

/// Unpack `deb`, apply every matching rule and rebuild it in place when
/// anything changed. Returns whether the file was rewritten.
pub fn repack(
    ctx: &ExecCtx,
    deb: &Path,
    package: &str,
    rules: &[FixupRule],
    vars: &FixupVars,
) -> Result<bool> {
    let mut applicable = Vec::new();
    for rule in rules {
        if rule_applies(rule, vars, package)? {
            applicable.push(rule);
        }
    }
    if applicable.is_empty() {
        return Ok(false);
    }

    let parent = deb.parent().unwrap_or_else(|| Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(".skb-fixup-")
        .tempdir_in(parent)
        .map_err(|e| Error::msg(format!("failed to create scratch dir in {}: {e}", parent.display())))?;
    let root = scratch.path().join("root");

    let mut cmd = Command::new("dpkg-deb");
    cmd.arg("-R").arg(deb).arg(&root);
    ctx.run_cmd(cmd)?;
    if ctx.dry_run {
        return Ok(false);
    }

    let mut changes = Vec::new();
    for rule in applicable {
        changes.extend(fixup_tree(&root, rule, vars)?);
    }
    if changes.is_empty() {
        ctx.log(&format!("{package}: already conforms"));
        return Ok(false);
    }
    for c in &changes {
        ctx.log(&format!("{package}: {c}"));
    }

    let rebuilt = scratch.path().join("out.deb");
    let mut cmd = Command::new("dpkg-deb");
    cmd.args(["-b", "--root-owner-group"]).arg(&root).arg(&rebuilt);
    ctx.run_cmd(cmd)?;
    fs::rename(&rebuilt, deb)
        .map_err(|e| Error::msg(format!("failed to replace {}: {e}", deb.display())))?;
    Ok(true)
}

/// Control paragraph of a metapackage that follows the newest build.
pub fn metapackage_control(
    name: &str,
    version: &str,
    arch: &str,
    depends: &str,
    maintainer: &str,
) -> ControlParagraph {
    let mut p = ControlParagraph::default();
    p.set("Package", name);
    p.set("Version", version);
    p.set("Architecture", arch);
    p.set("Maintainer", maintainer);
    p.set("Section", "kernel");
    p.set("Priority", "optional");
    p.set("Depends", format!("{depends} (= {version})"));
    p.set(
        "Description",
        format!("Sky1 kernel metapackage\n This package depends on {depends}, the current build."),
    );
    p
}

pub fn build_metapackage(
    ctx: &ExecCtx,
    out_dir: &Path,
    control: &ControlParagraph,
) -> Result<PathBuf> {
    let field = |k: &str| {
        control
            .get(k)
            .map(str::to_string)
            .ok_or_else(|| Error::msg(format!("metapackage control has no {k}")))
    };
    let file = out_dir.join(format!(
        "{}_{}_{}.deb",
        field("Package")?,
        field("Version")?,
        field("Architecture")?
    ));

    let scratch = tempfile::Builder::new()
        .prefix(".skb-meta-")
        .tempdir_in(out_dir)
        .map_err(|e| Error::msg(format!("failed to create scratch dir in {}: {e}", out_dir.display())))?;
    let debian = scratch.path().join("DEBIAN");
    fs::create_dir_all(&debian)?;
    fs::write(debian.join("control"), control.to_string())?;

    let mut cmd = Command::new("dpkg-deb");
    cmd.args(["-b", "--root-owner-group"]).arg(scratch.path()).arg(&file);
    ctx.run_cmd(cmd)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> FixupVars {
        FixupVars {
            release: "6.18.9-sky1".into(),
            version: "6.18.9-1".into(),
            flavor: "sky1".into(),
            source_date_epoch: Some(1_700_000_000),
        }
    }

    fn unpacked(package: &str) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().expect("tempdir");
        let debian = tmp.path().join("DEBIAN");
        fs::create_dir_all(&debian).expect("mkdir");
        fs::write(
            debian.join("control"),
            format!("Package: {package}\nVersion: 6.18.9-1\nArchitecture: arm64\nDepends: kmod\n"),
        )
        .expect("control");
        tmp
    }

    #[test]
    fn default_rules_match_their_packages() {
        let rules = default_fixups();
        let v = vars();
        assert!(rule_applies(&rules[0], &v, "linux-image-6.18.9-sky1").expect("glob"));
        assert!(!rule_applies(&rules[0], &v, "linux-image-6.18.9-sky1-dbg").expect("glob"));
        assert!(rule_applies(&rules[1], &v, "linux-headers-6.18.9-sky1").expect("glob"));
    }

    #[test]
    fn headers_fixup_is_idempotent() {
        let pkg = unpacked("linux-headers-6.18.9-sky1");
        let rule = &default_fixups()[1];

        let first = fixup_tree(pkg.path(), rule, &vars()).expect("first run");
        assert_eq!(first.len(), 4, "unexpected changes: {first:?}");
        let control = fs::read_to_string(pkg.path().join("DEBIAN/control")).expect("control");
        let postinst = fs::read_to_string(pkg.path().join("DEBIAN/postinst")).expect("postinst");

        let second = fixup_tree(pkg.path(), rule, &vars()).expect("second run");
        assert!(second.is_empty(), "second run changed: {second:?}");
        assert_eq!(
            fs::read_to_string(pkg.path().join("DEBIAN/control")).expect("control"),
            control
        );
        assert_eq!(
            fs::read_to_string(pkg.path().join("DEBIAN/postinst")).expect("postinst"),
            postinst
        );

        assert!(control.contains("Depends: kmod, linux-image-6.18.9-sky1 (= 6.18.9-1)"));
        assert!(postinst.starts_with("#!/bin/sh\n"));
        assert!(postinst.contains("ln -sfn '/usr/src/linux-headers-6.18.9-sky1' '/lib/modules/6.18.9-sky1/build'"));
        assert_eq!(postinst.matches(HOOK_BEGIN).count(), 1);

        let mode = fs::metadata(pkg.path().join("DEBIAN/prerm"))
            .expect("prerm")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn image_fixup_strips_the_build_link() {
        let pkg = unpacked("linux-image-6.18.9-sky1");
        let modules = pkg.path().join("lib/modules/6.18.9-sky1");
        fs::create_dir_all(&modules).expect("mkdir");
        std::os::unix::fs::symlink("/usr/src/linux-headers-6.18.9-sky1", modules.join("build"))
            .expect("symlink");
        fs::write(modules.join("modules.order"), "").expect("write");

        let changes = fixup_tree(pkg.path(), &default_fixups()[0], &vars()).expect("fixup");
        assert_eq!(
            changes,
            vec![
                "stripped /lib/modules/6.18.9-sky1/build".to_string(),
                "Provides: linux-image-sky1-any".to_string(),
            ]
        );
        assert!(fs::symlink_metadata(modules.join("build")).is_err());
        assert!(modules.join("modules.order").exists());
        assert!(fixup_tree(pkg.path(), &default_fixups()[0], &vars())
            .expect("again")
            .is_empty());
    }

    #[test]
    fn hook_goes_before_a_trailing_exit() {
        let block = "# >>> skb symlink /x\n:\n# <<< skb symlink\n";
        let out = inject_hook(Some("#!/bin/sh\nset -e\nrun-parts /etc/kernel/postinst.d\nexit 0\n"), block)
            .expect("changed");
        assert!(out.ends_with(&format!("{block}exit 0\n")), "got: {out}");
        assert!(inject_hook(Some(&out), block).is_none());
    }

    #[test]
    fn changed_hook_block_is_replaced_not_duplicated() {
        let old = "# >>> skb symlink /x\necho old\n# <<< skb symlink\n";
        let new = "# >>> skb symlink /x\necho new\n# <<< skb symlink\n";
        let script = format!("#!/bin/sh\n{old}exit 0\n");
        let out = inject_hook(Some(&script), new).expect("changed");
        assert_eq!(out, format!("#!/bin/sh\n{new}exit 0\n"));
    }

    #[test]
    fn strip_rejects_escaping_paths() {
        let pkg = unpacked("p");
        assert!(strip_path(pkg.path(), "../etc").is_err());
    }

    #[test]
    fn metapackage_pins_the_build() {
        let p = metapackage_control(
            "linux-image-sky1-rc",
            "6.19.0~rc7-5",
            "arm64",
            "linux-image-6.19.0-rc7-sky1-rc",
            "Sky1 <pkg@example.org>",
        );
        assert_eq!(
            p.get("Depends"),
            Some("linux-image-6.19.0-rc7-sky1-rc (= 6.19.0~rc7-5)")
        );
    }
}
