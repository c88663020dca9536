//! Build definition loading.
//!
//! A build definition is a TOML file. It may name a single parent with a
//! root-level `extends = "..."` and pull fragments in with `imports = [...]` at
//! any table level. Imported tables merge underneath the local ones, so the
//! file doing the importing always wins.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    /// An empty document; every section falls back to its defaults.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    /// Set a dotted path, creating intermediate tables. Used to fold
    /// command-line parameters over the loaded file.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segs: Vec<&str> = path.split('.').map(str::trim).collect();
        let Some((last, parents)) = segs.split_last().filter(|_| segs.iter().all(|s| !s.is_empty()))
        else {
            return Err(Error::msg(format!("invalid config path '{path}'")));
        };

        let mut cur = &mut self.value;
        for seg in parents {
            let tbl = cur
                .as_table_mut()
                .ok_or_else(|| Error::msg(format!("config path '{path}' crosses a non-table")))?;
            cur = tbl
                .entry(seg.to_string())
                .or_insert_with(|| Value::Table(Default::default()));
        }
        let tbl = cur
            .as_table_mut()
            .ok_or_else(|| Error::msg(format!("config path '{path}' crosses a non-table")))?;
        tbl.insert(last.to_string(), value);
        Ok(())
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => *base_slot = child_val,
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    merge_values(base, overlay);
}

fn relative_to(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn imports_of(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let s = v.as_str().ok_or_else(|| {
            Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            ))
        })?;
        if !s.trim().is_empty() {
            out.push(s.trim().to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = imports_of(file, tbl)?;
    tbl.remove("imports");
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            merge_values(&mut acc, load_inner(&relative_to(file, &imp), stack)?);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file, v, stack)?;
    }
    Ok(())
}

fn load_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "build definition import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path).map_err(|e| {
        Error::missing(format!(
            "failed to read build definition {}: {e}",
            path.display()
        ))
    })?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(parent) = value.get("extends").and_then(Value::as_str) {
        out = load_inner(&relative_to(path, parent), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    inline_imports(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imports_merge_under_local_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("common.toml"),
            "[build]\narch = \"arm64\"\nrevision = 1\n",
        )
        .expect("write common");
        fs::write(
            tmp.path().join("rc.toml"),
            "imports = [\"common.toml\"]\n[build]\nvariant = \"rc\"\nrevision = 4\n",
        )
        .expect("write rc");

        let doc = load(&tmp.path().join("rc.toml")).expect("load");
        assert_eq!(
            doc.value_path("build.arch").and_then(Value::as_str),
            Some("arm64")
        );
        assert_eq!(
            doc.value_path("build.revision").and_then(Value::as_integer),
            Some(4)
        );
        assert!(doc.value_path("imports").is_none());
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&tmp.path().join("a.toml")).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn set_path_creates_tables() {
        let mut doc = ConfigDoc::empty("<mem>");
        doc.set_path("build.kernel_version", Value::String("6.18.9".into()))
            .expect("set");
        assert_eq!(
            doc.value_path("build.kernel_version").and_then(Value::as_str),
            Some("6.18.9")
        );
    }
}
