//! Deterministic topological sort and reverse-reachability helpers.
//!
//! Mirrors the shape of Python's `graphlib.TopologicalSorter` prepare/get_ready/done
//! loop: nodes become "ready" once all of their dependencies have been marked done,
//! and each readiness wave is emitted in sorted order so that instantiation order is
//! reproducible across runs.

use crate::core::error::CanaryError;
use std::collections::{HashMap, HashSet, VecDeque};

/// Kahn's-algorithm topological sort over `graph: id -> [dependency ids]`.
///
/// Returns ids in dependency-first order (a dependency always precedes its
/// dependents). Ids not present as keys in `graph` but referenced as dependencies are
/// treated as already-satisfied leaves. Within a single readiness wave, ids are
/// emitted in sorted order for determinism.
pub fn topo_sort(graph: &HashMap<String, Vec<String>>) -> Result<Vec<String>, CanaryError> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in graph.keys() {
        indegree.entry(id.as_str()).or_insert(0);
    }
    for (id, deps) in graph {
        for dep in deps {
            // every node mentioned anywhere must have an indegree entry, even if it
            // never appears as a key (an already-resolved leaf).
            indegree.entry(dep.as_str()).or_insert(0);
            *indegree.entry(id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();

    let mut queue: VecDeque<&str> = ready.into();
    let mut order: Vec<String> = Vec::with_capacity(indegree.len());
    let mut remaining = indegree.clone();

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            let mut newly_ready: Vec<&str> = Vec::new();
            for &child in children {
                let deg = remaining.get_mut(child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(child);
                }
            }
            newly_ready.sort_unstable();
            for child in newly_ready {
                queue.push_back(child);
            }
        }
    }

    if order.len() != indegree.len() {
        let unresolved: Vec<String> = indegree
            .keys()
            .filter(|id| !order.contains(&id.to_string()))
            .map(|s| s.to_string())
            .collect();
        return Err(CanaryError::DependencyCycle(unresolved));
    }
    Ok(order)
}

/// All nodes reachable from `roots` by following `graph` edges (inclusive of roots).
pub fn reachable_nodes(graph: &HashMap<String, Vec<String>>, roots: &[String]) -> HashSet<String> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = roots.to_vec();
    while let Some(node) = stack.pop() {
        if !visited.insert(node.clone()) {
            continue;
        }
        if let Some(deps) = graph.get(&node) {
            for dep in deps {
                if !visited.contains(dep) {
                    stack.push(dep.clone());
                }
            }
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_linear_chain() {
        let graph = g(&[("b", &["a"]), ("a", &[])]);
        let order = topo_sort(&graph).unwrap();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_deterministic_within_wave() {
        let graph = g(&[("c", &["a"]), ("b", &["a"]), ("a", &[])]);
        let order = topo_sort(&graph).unwrap();
        assert_eq!(order[0], "a");
        assert_eq!(&order[1..], &["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_cycle_detected() {
        let graph = g(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(
            topo_sort(&graph),
            Err(CanaryError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_reachable_nodes() {
        let graph = g(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let reached = reachable_nodes(&graph, &["c".to_string()]);
        assert_eq!(reached.len(), 3);
    }
}
