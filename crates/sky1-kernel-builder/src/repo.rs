//! What the APT repository already holds, and what publishing may do to it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use globset::{Glob, GlobSetBuilder};

use crate::artifacts::{DebFile, revision_number, split_revision};
use crate::error::{Error, Result};
use crate::variants::EXCLUDED_ARTIFACTS;

/// One line of `reprepro list` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPackage {
    pub codename: String,
    pub component: String,
    pub arch: String,
    pub name: String,
    pub version: String,
}

impl PublishedPackage {
    pub fn upstream(&self) -> &str {
        split_revision(&self.version).0
    }

    pub fn revision(&self) -> &str {
        split_revision(&self.version).1
    }

    fn file_name(&self) -> String {
        format!("{}_{}_{}.deb", self.name, self.version, self.arch)
    }
}

/// Parse `codename|component|arch: name version` lines. Anything else is
/// ignored.
pub fn parse_listing(text: &str) -> Vec<PublishedPackage> {
    text.lines()
        .filter_map(|line| {
            let (target, pkg) = line.trim().split_once(": ")?;
            let mut t = target.split('|');
            let (codename, component, arch) = (t.next()?, t.next()?, t.next()?);
            let (name, version) = pkg.trim().split_once(' ')?;
            Some(PublishedPackage {
                codename: codename.to_string(),
                component: component.to_string(),
                arch: arch.to_string(),
                name: name.to_string(),
                version: version.trim().to_string(),
            })
        })
        .collect()
}

/// Revisions compare numerically when both are numbers.
pub fn compare_revisions(a: &str, b: &str) -> Ordering {
    match (revision_number(a), revision_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn max_revisions<'a>(
    items: impl Iterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<&'a str, &'a str> {
    let mut out: BTreeMap<&str, &str> = BTreeMap::new();
    for (upstream, revision) in items {
        let slot = out.entry(upstream).or_insert(revision);
        if compare_revisions(revision, slot) == Ordering::Greater {
            *slot = revision;
        }
    }
    out
}

/// Refuse an upload whose highest revision is below the highest revision the
/// component already holds for the same upstream version. Other upstream
/// versions are not compared.
pub fn check_no_downgrade(published: &[PublishedPackage], incoming: &[DebFile]) -> Result<()> {
    let have = max_revisions(published.iter().map(|p| (p.upstream(), p.revision())));
    let want = max_revisions(
        incoming
            .iter()
            .map(|d| (d.upstream.as_str(), d.revision.as_str())),
    );
    for (upstream, new_rev) in want {
        let Some(old_rev) = have.get(upstream) else {
            continue;
        };
        if compare_revisions(new_rev, old_rev) == Ordering::Less {
            return Err(Error::downgrade(format!(
                "refusing to publish {upstream}-{new_rev}: the repository already has revision {old_rev} of {upstream}; bump the revision to at least {old_rev}"
            )));
        }
    }
    Ok(())
}

/// Published packages of the family described by `patterns`. Packages the
/// upstream distribution ships never belong to a family.
pub fn family(published: &[PublishedPackage], patterns: &[String]) -> Result<Vec<PublishedPackage>> {
    let mut family = GlobSetBuilder::new();
    for p in patterns {
        family.add(Glob::new(p)?);
    }
    let family = family.build()?;
    let mut excluded = GlobSetBuilder::new();
    for p in EXCLUDED_ARTIFACTS {
        excluded.add(Glob::new(p)?);
    }
    let excluded = excluded.build()?;

    Ok(published
        .iter()
        .filter(|p| {
            let f = p.file_name();
            family.is_match(&f) && !excluded.is_match(&f)
        })
        .cloned()
        .collect())
}

/// The part of a `reprepro list` listing an upload of one variant is judged
/// against: its component, its package family.
pub fn published_family(
    listing: &str,
    component: &str,
    patterns: &[String],
) -> Result<Vec<PublishedPackage>> {
    let in_component: Vec<PublishedPackage> = parse_listing(listing)
        .into_iter()
        .filter(|p| p.component == component)
        .collect();
    family(&in_component, patterns)
}

/// Published package names belonging to the family described by `patterns`.
pub fn removal_set(published: &[PublishedPackage], patterns: &[String]) -> Result<BTreeSet<String>> {
    Ok(family(published, patterns)?
        .into_iter()
        .map(|p| p.name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::Path;

    const LISTING: &str = "\
trixie|rc|arm64: linux-headers-6.19.0-rc7-sky1-rc 6.19.0~rc7-5
trixie|rc|arm64: linux-image-6.19.0-rc7-sky1-rc 6.19.0~rc7-5
trixie|rc|arm64: linux-image-sky1-rc 6.19.0~rc7-5
trixie|rc|arm64: linux-libc-dev 6.19.0~rc7-5
trixie|rc|arm64: sky1-firmware 20260101-1
";

    fn incoming(names: &[&str]) -> Vec<DebFile> {
        names
            .iter()
            .map(|n| DebFile::parse(Path::new(n)).expect("parse"))
            .collect()
    }

    #[test]
    fn parses_reprepro_listing() {
        let pkgs = parse_listing(LISTING);
        assert_eq!(pkgs.len(), 5);
        assert_eq!(pkgs[0].component, "rc");
        assert_eq!(pkgs[0].name, "linux-headers-6.19.0-rc7-sky1-rc");
        assert_eq!(pkgs[0].upstream(), "6.19.0~rc7");
        assert_eq!(pkgs[0].revision(), "5");
        assert!(parse_listing("garbage\n\n").is_empty());
    }

    #[test]
    fn lower_revision_is_a_downgrade() {
        let published = parse_listing(LISTING);
        let err = check_no_downgrade(
            &published,
            &incoming(&["linux-image-6.19.0-rc7-sky1-rc_6.19.0~rc7-3_arm64.deb"]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Downgrade);
    }

    #[test]
    fn equal_or_higher_revision_is_accepted() {
        let published = parse_listing(LISTING);
        for rev in ["5", "6", "10"] {
            let name = format!("linux-image-6.19.0-rc7-sky1-rc_6.19.0~rc7-{rev}_arm64.deb");
            check_no_downgrade(&published, &incoming(&[&name])).expect("accepted");
        }
    }

    #[test]
    fn other_upstream_versions_are_not_compared() {
        let published = parse_listing(LISTING);
        check_no_downgrade(
            &published,
            &incoming(&["linux-image-6.19.0-rc8-sky1-rc_6.19.0~rc8-1_arm64.deb"]),
        )
        .expect("new upstream starts over at revision 1");
    }

    #[test]
    fn removal_set_covers_the_family_only() {
        let published = parse_listing(LISTING);
        let patterns: Vec<String> = [
            "linux-image-*-sky1-rc_*.deb",
            "linux-headers-*-sky1-rc_*.deb",
            "linux-image-sky1-rc_*.deb",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let names = removal_set(&published, &patterns).expect("removal set");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec![
                "linux-headers-6.19.0-rc7-sky1-rc",
                "linux-image-6.19.0-rc7-sky1-rc",
                "linux-image-sky1-rc",
            ]
        );
    }

    #[test]
    fn libc_dev_at_a_higher_revision_does_not_block_the_family() {
        let patterns = vec!["linux-image-*-sky1-rc_*.deb".to_string()];
        let listing = format!(
            "{LISTING}trixie|rc|arm64: linux-libc-dev 6.19.0~rc7-9\ntrixie|main|arm64: linux-image-6.19.0-rc7-sky1-rc 6.19.0~rc7-9\n"
        );
        let published = published_family(&listing, "rc", &patterns).expect("family");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].version, "6.19.0~rc7-5");
        check_no_downgrade(
            &published,
            &incoming(&["linux-image-6.19.0-rc7-sky1-rc_6.19.0~rc7-6_arm64.deb"]),
        )
        .expect("only the family's own revision counts");

        let everything = family(&parse_listing(LISTING), &["*".to_string()]).expect("family");
        assert!(everything.iter().all(|p| p.name != "linux-libc-dev"));
        assert_eq!(everything.len(), 4);
    }

    #[test]
    fn revisions_compare_numerically() {
        assert_eq!(compare_revisions("10", "9"), Ordering::Greater);
        assert_eq!(compare_revisions("5", "5"), Ordering::Equal);
    }
}
