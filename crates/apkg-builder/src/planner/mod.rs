use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

pub const LAYOUT_BARRIER_ID: &str = "core.barrier.layout";
pub const LAYOUT_DONE: &str = "layout:done";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` marks the dependency optional.
    pub after: Vec<String>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn provider_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out = BTreeMap::new();
        for task in self.tasks.values() {
            for token in &task.provides {
                if let Some(prev) = out.insert(token.as_str(), task.id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{token}' is produced by both '{prev}' and '{}'",
                        task.id
                    )));
                }
            }
        }
        Ok(out)
    }

    // Resolved (dependency, dependent) pairs; unmet optional deps are dropped.
    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let providers = self.provider_index()?;
        let mut out = Vec::new();
        for task in self.tasks.values() {
            for raw in &task.after {
                let (dep, optional) = match raw.strip_suffix('?') {
                    Some(d) => (d, true),
                    None => (raw.as_str(), false),
                };
                let resolved = match self.tasks.get_key_value(dep) {
                    Some((id, _)) => Some(id.as_str()),
                    None => providers.get(dep).copied(),
                };
                match resolved {
                    Some(dep_id) => out.push((dep_id, task.id.as_str())),
                    None if optional => {}
                    None => {
                        return Err(Error::msg(format!(
                            "task '{}' has unknown dependency '{dep}'",
                            task.id
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Deterministic topological order (ties broken by task id).
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut pending: BTreeMap<&str, usize> =
            self.tasks.keys().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (dep, task) in self.edges()? {
            if dependents.entry(dep).or_default().insert(task)
                && let Some(n) = pending.get_mut(task)
            {
                *n += 1;
            }
        }

        let mut ready: VecDeque<&str> = pending
            .iter()
            .filter_map(|(id, n)| (*n == 0).then_some(*id))
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(id) = ready.pop_front() {
            if let Some(task) = self.tasks.get(id) {
                out.push(task);
            }
            for child in dependents.get(id).into_iter().flatten() {
                if let Some(n) = pending.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let stuck: Vec<&str> = pending
                .iter()
                .filter_map(|(id, n)| (*n > 0).then_some(*id))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                stuck.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_barrier(LAYOUT_BARRIER_ID, "Layout barrier", "layout:", LAYOUT_DONE)
    }

    // A barrier depends on every task that provides a token under `prefix`,
    // so consumers wait on one token instead of enumerating producers.
    fn add_barrier(&mut self, id: &str, label: &str, prefix: &str, token: &str) -> Result<()> {
        if self.tasks.contains_key(id) {
            return Ok(());
        }
        let after: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.provides.iter().any(|p| p.starts_with(prefix)))
            .map(|t| t.id.clone())
            .collect();
        self.add(Task {
            id: id.into(),
            label: label.into(),
            module: "core".into(),
            phase: "barrier".into(),
            after,
            provides: vec![token.into()],
        })
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (dep, task) in self.edges()? {
            out.push_str(&format!("  \"{dep}\" -> \"{task}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_dependencies_and_tokens() {
        let mut plan = Plan::default();
        plan.add(task("b.consume", &["layout:done"], &[])).unwrap();
        plan.add(task("a.produce", &["core.init"], &["layout:x"])).unwrap();
        plan.add(task("core.init", &[], &[])).unwrap();
        plan.finalize_default().unwrap();

        let ids: Vec<&str> = plan.ordered().unwrap().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["core.init", "a.produce", LAYOUT_BARRIER_ID, "b.consume"]
        );
    }

    #[test]
    fn optional_dependency_may_be_missing() {
        let mut plan = Plan::default();
        plan.add(task("x", &["missing?"], &[])).unwrap();
        assert_eq!(plan.ordered().unwrap().len(), 1);

        plan.add(task("y", &["missing"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("unknown dependency 'missing'"), "unexpected err: {err}");
    }

    #[test]
    fn rejects_cycles_and_duplicate_tokens() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        assert!(plan.ordered().unwrap_err().to_string().contains("cycle"));

        let mut plan = Plan::default();
        plan.add(task("a", &[], &["tok"])).unwrap();
        plan.add(task("b", &[], &["tok"])).unwrap();
        assert!(plan.ordered().is_err());
        assert!(plan.add(task("a", &[], &[])).is_err());
    }
}
