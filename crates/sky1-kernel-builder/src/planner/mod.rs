use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub stage: String,
    pub phase: String,
    /// Task ids or provide tokens. A trailing `?` makes the edge optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

fn split_optional(dep: &str) -> (&str, bool) {
    dep.strip_suffix('?')
        .map(|d| (d, true))
        .unwrap_or((dep, false))
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Resolve a dependency to a task id. `Ok(None)` for an optional dependency
    /// nothing satisfies.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = split_optional(dep);
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{}'", dep)))
        }
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let provides = self.provides_index()?;

        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, task) in &self.tasks {
            incoming.entry(id.as_str()).or_insert(0);
            outgoing.entry(id.as_str()).or_default();
            for dep in &task.after {
                let dep_id = self.resolve_dep(&provides, dep.as_str()).map_err(|e| {
                    Error::msg(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        id, dep, e
                    ))
                })?;
                let Some(dep_id) = dep_id else {
                    continue;
                };
                if outgoing.entry(dep_id).or_default().insert(id.as_str()) {
                    *incoming.entry(id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    /// Keep only the tasks of the named stages.
    ///
    /// Edges into dropped tasks are removed: those tasks ran in an earlier
    /// invocation and left their results on disk, which the kept tasks check
    /// for themselves.
    pub fn subset(&self, stages: &[&str]) -> Result<Plan> {
        for s in stages {
            if !self.tasks.values().any(|t| t.stage == *s) {
                return Err(Error::msg(format!("plan has no tasks for stage '{s}'")));
            }
        }
        let provides = self.provides_index()?;
        let mut out = Plan::default();
        for task in self.tasks.values() {
            if !stages.contains(&task.stage.as_str()) {
                continue;
            }
            let mut kept = task.clone();
            kept.after.clear();
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep(&provides, dep.as_str())? else {
                    continue;
                };
                let same_subset = self
                    .tasks
                    .get(dep_id)
                    .is_some_and(|d| stages.contains(&d.stage.as_str()));
                if same_subset {
                    kept.after.push(dep.clone());
                }
            }
            out.add(kept)?;
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let provides = self.provides_index()?;

        let mut out = String::from("digraph pipeline {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.stage, task.phase
            ));
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                if let Some(dep_id) = self.resolve_dep(&provides, dep.as_str())? {
                    out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep_id, task.id));
                }
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}
