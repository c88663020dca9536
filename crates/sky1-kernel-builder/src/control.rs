//! Debian binary package control files (`DEBIAN/control`).
//!
//! Only what the post-processor needs: one paragraph, fields in their
//! original order, multi-line values kept verbatim.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlParagraph {
    fields: Vec<(String, String)>,
}

impl ControlParagraph {
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields: Vec<(String, String)> = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                if fields.is_empty() {
                    continue;
                }
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let Some((_, value)) = fields.last_mut() else {
                    return Err(Error::msg(format!(
                        "control line {} continues a field that does not exist",
                        i + 1
                    )));
                };
                value.push('\n');
                value.push_str(line);
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::msg(format!(
                    "control line {} is not 'Field: value': {line}",
                    i + 1
                )));
            };
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }
        if fields.is_empty() {
            return Err(Error::msg("empty control file"));
        }
        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace a field in place, or append it.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self
            .fields
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.fields.remove(idx).1)
    }

    pub fn has_relation(&self, field: &str, package: &str) -> bool {
        self.get(field)
            .is_some_and(|v| split_relations(v).any(|r| relation_package(r) == package))
    }

    /// Make `field` carry `relation` exactly once. An existing relation on the
    /// same package is replaced; returns whether the paragraph changed.
    pub fn ensure_relation(&mut self, field: &str, relation: &str) -> bool {
        let relation = relation.trim();
        let package = relation_package(relation);
        let mut entries: Vec<String> = self
            .get(field)
            .map(|v| split_relations(v).map(str::to_string).collect())
            .unwrap_or_default();

        match entries.iter().position(|r| relation_package(r) == package) {
            Some(i) if entries[i] == relation => return false,
            Some(i) => entries[i] = relation.to_string(),
            None => entries.push(relation.to_string()),
        }
        self.set(field, entries.join(", "));
        true
    }
}

impl fmt::Display for ControlParagraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            if value.starts_with('\n') {
                writeln!(f, "{name}:{value}")?;
            } else {
                writeln!(f, "{name}: {value}")?;
            }
        }
        Ok(())
    }
}

fn split_relations(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|r| !r.is_empty())
}

/// Package a relation entry is about: `linux-image-6.18.9-sky1 (= 6.18.9-1)`
/// -> `linux-image-6.18.9-sky1`. For alternatives the first one counts.
pub fn relation_package(relation: &str) -> &str {
    let first = relation.split('|').next().unwrap_or(relation).trim();
    let end = first
        .find(|c: char| c.is_whitespace() || c == '(' || c == ':' || c == '[')
        .unwrap_or(first.len());
    &first[..end]
}
