//! Dependency ordering for an epic's task set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{CoordError, Result};
use crate::types::{Task, TaskId, TaskStatus};

/// Deterministic topological order of `tasks` (Kahn's algorithm, ties broken
/// by task ID). Dependencies outside the set are treated as external and do
/// not constrain the order. A cycle fails with the offending path.
pub fn topological_order(tasks: &[Task]) -> Result<Vec<TaskId>> {
    let ids: BTreeSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut indegree: BTreeMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for task in tasks {
        for dep in task.dependencies.iter().filter(|d| ids.contains(d.as_str())) {
            *indegree.entry(task.id.as_str()).or_default() += 1;
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(ids.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for &next in dependents.get(id).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(next) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() < ids.len() {
        let remaining: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(CoordError::CyclicDependency {
            cycle: find_cycle(tasks, &remaining),
        });
    }
    Ok(order)
}

/// Walk dependency edges among `remaining` until a node repeats.
fn find_cycle(tasks: &[Task], remaining: &BTreeSet<&str>) -> Vec<String> {
    let deps: HashMap<&str, Vec<&str>> = tasks
        .iter()
        .filter(|t| remaining.contains(t.id.as_str()))
        .map(|t| {
            let inside: Vec<&str> = t
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| remaining.contains(d))
                .collect();
            (t.id.as_str(), inside)
        })
        .collect();

    // Every remaining node has an in-set dependency, so the walk must repeat.
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let Some(next) = deps.get(current).and_then(|d| d.first()).copied() else {
            return path.into_iter().map(String::from).collect();
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

/// True when every dependency of `task` is `complete` in `statuses`.
pub fn is_ready(task: &Task, statuses: &HashMap<TaskId, TaskStatus>) -> bool {
    task.dependencies
        .iter()
        .all(|dep| statuses.get(dep) == Some(&TaskStatus::Complete))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: &str, deps: &[&str]) -> Task {
        let now = Utc::now();
        Task {
            id: id.into(),
            sprint_id: "s".into(),
            title: id.into(),
            description: None,
            status: TaskStatus::Todo,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            claimed_by: None,
            completed_by: None,
            required_capabilities: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
            block_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn orders_dependencies_first_with_id_ties() {
        let tasks = vec![
            task("c", &["a", "b"]),
            task("b", &["a"]),
            task("a", &[]),
            task("d", &[]),
        ];
        assert_eq!(topological_order(&tasks).unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn external_dependencies_do_not_block_ordering() {
        let tasks = vec![task("b", &["elsewhere"]), task("a", &["b"])];
        assert_eq!(topological_order(&tasks).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let tasks = vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"]), task("z", &[])];
        match topological_order(&tasks) {
            Err(CoordError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![task("a", &["a"])];
        assert!(matches!(
            topological_order(&tasks),
            Err(CoordError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn readiness_requires_complete_dependencies() {
        let t = task("b", &["a"]);
        let mut statuses = HashMap::new();
        statuses.insert("a".to_string(), TaskStatus::InProgress);
        assert!(!is_ready(&t, &statuses));
        statuses.insert("a".to_string(), TaskStatus::Complete);
        assert!(is_ready(&t, &statuses));
    }
}
