//! Kernel version strings in their three spellings: the upstream tag form
//! (`6.19-rc7`), the release form `make kernelrelease` prints (`6.19.0-rc7`)
//! and the Debian upstream form (`6.19.0~rc7`).

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(\d+)\.(\d+)(?:\.(\d+))?((?:-rc\d+)?)$").expect("version regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub sublevel: u32,
    /// `EXTRAVERSION`, including its leading dash (`-rc7`), or empty.
    pub extra: String,
}

impl KernelVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let caps = VERSION_RE
            .captures(raw)
            .ok_or_else(|| Error::msg(format!("invalid kernel version '{raw}'")))?;
        let num = |i: usize| -> Result<u32> {
            caps.get(i)
                .map(|m| m.as_str().parse::<u32>())
                .transpose()
                .map(Option::unwrap_or_default)
                .map_err(|e| Error::msg(format!("invalid kernel version '{raw}': {e}")))
        };
        Ok(Self {
            major: num(1)?,
            minor: num(2)?,
            sublevel: num(3)?,
            extra: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
    }

    /// Read `VERSION`/`PATCHLEVEL`/`SUBLEVEL`/`EXTRAVERSION` from the head of
    /// a kernel Makefile.
    pub fn from_makefile(text: &str) -> Result<Self> {
        let mut fields: [Option<&str>; 4] = [None; 4];
        for line in text.lines().take(10) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let slot = match key.trim() {
                "VERSION" => 0,
                "PATCHLEVEL" => 1,
                "SUBLEVEL" => 2,
                "EXTRAVERSION" => 3,
                _ => continue,
            };
            fields[slot] = Some(value.trim());
        }
        let num = |slot: usize, name: &str| -> Result<u32> {
            match fields[slot].filter(|v| !v.is_empty()) {
                Some(v) => v
                    .parse()
                    .map_err(|_| Error::msg(format!("Makefile {name} '{v}' is not a number"))),
                None if slot == 2 => Ok(0),
                None => Err(Error::msg(format!("Makefile has no {name}"))),
            }
        };
        Ok(Self {
            major: num(0, "VERSION")?,
            minor: num(1, "PATCHLEVEL")?,
            sublevel: num(2, "SUBLEVEL")?,
            extra: fields[3].unwrap_or_default().to_string(),
        })
    }

    pub fn is_rc(&self) -> bool {
        self.extra.starts_with("-rc")
    }

    /// Upstream tag spelling, as kernel.org names tarballs and tags: a zero
    /// sublevel is dropped (`6.19`, `6.19-rc7`).
    pub fn full(&self) -> String {
        if self.sublevel == 0 {
            format!("{}.{}{}", self.major, self.minor, self.extra)
        } else {
            format!("{}.{}.{}{}", self.major, self.minor, self.sublevel, self.extra)
        }
    }

    pub fn major_minor(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// `make kernelrelease` without a local version.
    pub fn release(&self) -> String {
        format!("{}.{}.{}{}", self.major, self.minor, self.sublevel, self.extra)
    }

    /// Upstream part of the Debian version. `~` makes release candidates sort
    /// below the final release.
    pub fn debian_upstream(&self) -> String {
        format!(
            "{}.{}.{}{}",
            self.major,
            self.minor,
            self.sublevel,
            self.extra.replacen('-', "~", 1)
        )
    }

    /// Full Debian version for a package revision.
    pub fn deb_version(&self, revision: u32) -> String {
        format!("{}-{}", self.debian_upstream(), revision)
    }

    pub fn sort_key(&self) -> (u32, u32, u32, u8, u32) {
        let rc = self
            .extra
            .strip_prefix("-rc")
            .and_then(|n| n.parse::<u32>().ok());
        match rc {
            Some(n) => (self.major, self.minor, self.sublevel, 0, n),
            None => (self.major, self.minor, self.sublevel, 1, 0),
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full())
    }
}

/// Sort key for upstream tags (`v6.18.7`, `v6.19-rc7`, `v6.19`). Tags that do
/// not parse sort first.
pub fn tag_sort_key(tag: &str) -> Option<(u32, u32, u32, u8, u32)> {
    KernelVersion::parse(tag).ok().map(|v| v.sort_key())
}
