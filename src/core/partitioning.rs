//! Scheduler batching policies (C6): bin-packing ready cases into batches under
//! count/isolation/duration policies, plus the runtime estimator used to size
//! duration-based batches before a case has ever run.
//!
//! Grounded in `util/partitioning.py`'s `partition_n_atomic` / `partition_n` /
//! `partition_t` / `runtime()` / `tile()`; the 2D packer here is a shelf-packing
//! reconstruction of the source's guillotine packer (see `DESIGN.md`), not a literal
//! port of its `Block`/`Node`/`Packer` classes.

use std::collections::HashMap;

/// One unit of work as seen by the batcher: just enough shape to bin-pack on.
#[derive(Debug, Clone)]
pub struct PackItem {
    pub id: String,
    pub cpus: u32,
    pub gpus: u32,
    pub runtime: f64,
    pub exclusive: bool,
}

impl PackItem {
    /// `sqrt(cpus^2 + gpus^2 + runtime^2)`, the scalar size used to balance batches.
    pub fn size(&self) -> f64 {
        ((self.cpus as f64).powi(2) + (self.gpus as f64).powi(2) + self.runtime.powi(2)).sqrt()
    }
}

/// Prior observed durations for a spec, used by [`estimate_runtime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeHistory {
    pub mean: f64,
    pub max: f64,
    pub count: u32,
}

/// Scale factor applied to a runtime estimate that isn't backed by enough history,
/// bucketed by the estimate's own magnitude: short estimates get a wider safety
/// margin since they're the least reliable.
fn decile_multiplier(value: f64) -> f64 {
    if value <= 10.0 {
        5.0
    } else if value <= 30.0 {
        4.0
    } else if value <= 60.0 {
        3.0
    } else if value <= 300.0 {
        2.0
    } else {
        1.25
    }
}

/// Estimate a case's runtime for batching purposes: a stable prior mean wins outright;
/// a thin history blends mean/max and widens by [`decile_multiplier`]; no history at
/// all falls back to the declared timeout.
pub fn estimate_runtime(declared_timeout: f64, history: Option<&RuntimeHistory>) -> f64 {
    match history {
        Some(h) if h.count >= 3 => h.mean,
        Some(h) if h.count > 0 => {
            let blended = (h.mean + h.max) / 2.0;
            blended * decile_multiplier(blended)
        }
        _ => declared_timeout,
    }
}

/// Group `items` by connected dependency component (an "atomic" unit that must stay
/// in the same batch), then greedily assign whole groups to `n` batches using
/// longest-processing-time-first load balancing, minimizing the spread of summed
/// `size()` across batches.
pub fn partition_n_atomic(
    items: &[PackItem],
    dep_groups: &[Vec<usize>],
    n: usize,
) -> Vec<Vec<String>> {
    let n = n.max(1);
    let mut groups: Vec<(f64, Vec<usize>)> = dep_groups
        .iter()
        .map(|g| {
            let size: f64 = g.iter().map(|&i| items[i].size()).sum();
            (size, g.clone())
        })
        .collect();
    groups.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

    let mut bins: Vec<Vec<String>> = vec![Vec::new(); n];
    let mut bin_sizes = vec![0.0f64; n];
    for (size, group) in groups {
        let (min_idx, _) = bin_sizes
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        bin_sizes[min_idx] += size;
        bins[min_idx].extend(group.into_iter().map(|i| items[i].id.clone()));
    }
    bins
}

/// Distribute `levels` (already topologically ordered groups of ready items) across
/// `n` batches proportionally to each level's total size, preserving level order
/// within each batch.
pub fn partition_n(items: &[PackItem], levels: &[Vec<usize>], n: usize) -> Vec<Vec<String>> {
    let n = n.max(1);
    let mut bins: Vec<Vec<String>> = vec![Vec::new(); n];
    let mut bin_sizes = vec![0.0f64; n];

    for level in levels {
        let mut ordered: Vec<usize> = level.clone();
        ordered.sort_by(|&a, &b| items[b].size().partial_cmp(&items[a].size()).unwrap());
        for idx in ordered {
            let (min_idx, _) = bin_sizes
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .unwrap();
            bin_sizes[min_idx] += items[idx].size();
            bins[min_idx].push(items[idx].id.clone());
        }
    }
    bins
}

/// A single node-timeslice in the 2D packing: a fixed `width` (total cpus across the
/// strip) and the items placed on it so far.
struct Shelf {
    remaining_width: u32,
    height: f64,
    items: Vec<String>,
}

/// First-fit-decreasing 2D packing of cases as rectangles `(width = cpus, height =
/// runtime)` into strips of the given `width`. Cases flagged `exclusive` occupy a
/// full-width shelf by themselves. Returns one batch per shelf.
pub fn partition_t(items: &[PackItem], width: u32, min_height: f64) -> Vec<Vec<String>> {
    let width = width.max(1);
    let mut ordered: Vec<&PackItem> = items.iter().collect();
    ordered.sort_by(|a, b| b.runtime.partial_cmp(&a.runtime).unwrap());

    let mut shelves: Vec<Shelf> = Vec::new();
    for item in ordered {
        if item.exclusive {
            shelves.push(Shelf {
                remaining_width: 0,
                height: item.runtime.max(min_height),
                items: vec![item.id.clone()],
            });
            continue;
        }
        let cpus = item.cpus.max(1).min(width);
        let fit = shelves
            .iter_mut()
            .find(|s| s.remaining_width >= cpus && s.height >= item.runtime);
        match fit {
            Some(shelf) => {
                shelf.remaining_width -= cpus;
                shelf.items.push(item.id.clone());
            }
            None => {
                shelves.push(Shelf {
                    remaining_width: width - cpus,
                    height: item.runtime.max(min_height),
                    items: vec![item.id.clone()],
                });
            }
        }
    }
    shelves.into_iter().map(|s| s.items).collect()
}

/// First-fit-decreasing tiling used by `duration` batching to pick a strip width from
/// `cpus_per_node` given the widest case's cpu request.
pub fn tile(max_cpus: u32, cpus_per_node: u32) -> u32 {
    let cpus_per_node = cpus_per_node.max(1);
    ((max_cpus + cpus_per_node - 1) / cpus_per_node) * cpus_per_node
}

/// Connected components of the dependency graph restricted to `ids`, used by
/// [`partition_n_atomic`] to find atomic groups.
pub fn dependency_groups(ids: &[String], edges: &HashMap<String, Vec<String>>) -> Vec<Vec<usize>> {
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (i, id) in ids.iter().enumerate() {
        if let Some(deps) = edges.get(id) {
            for dep in deps {
                if let Some(&j) = index.get(dep.as_str()) {
                    adj[i].push(j);
                    adj[j].push(i);
                }
            }
        }
    }
    let mut visited = vec![false; ids.len()];
    let mut groups = Vec::new();
    for start in 0..ids.len() {
        if visited[start] {
            continue;
        }
        let mut stack = vec![start];
        let mut group = Vec::new();
        visited[start] = true;
        while let Some(n) = stack.pop() {
            group.push(n);
            for &m in &adj[n] {
                if !visited[m] {
                    visited[m] = true;
                    stack.push(m);
                }
            }
        }
        group.sort_unstable();
        groups.push(group);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, cpus: u32, runtime: f64) -> PackItem {
        PackItem {
            id: id.to_string(),
            cpus,
            gpus: 0,
            runtime,
            exclusive: false,
        }
    }

    #[test]
    fn test_estimate_runtime_no_history_uses_timeout() {
        assert_eq!(estimate_runtime(30.0, None), 30.0);
    }

    #[test]
    fn test_estimate_runtime_stable_history_uses_mean() {
        let h = RuntimeHistory {
            mean: 12.0,
            max: 20.0,
            count: 5,
        };
        assert_eq!(estimate_runtime(30.0, Some(&h)), 12.0);
    }

    #[test]
    fn test_estimate_runtime_thin_history_widens() {
        let h = RuntimeHistory {
            mean: 2.0,
            max: 4.0,
            count: 1,
        };
        let est = estimate_runtime(30.0, Some(&h));
        assert!(est > 3.0);
    }

    #[test]
    fn test_partition_n_balances_sizes() {
        let items = vec![item("a", 1, 10.0), item("b", 1, 1.0), item("c", 1, 1.0)];
        let levels = vec![vec![0, 1, 2]];
        let bins = partition_n(&items, &levels, 2);
        assert_eq!(bins.iter().map(|b| b.len()).sum::<usize>(), 3);
        assert!(bins.iter().any(|b| b.contains(&"a".to_string())));
    }

    #[test]
    fn test_partition_n_atomic_keeps_group_together() {
        let items = vec![item("a", 1, 5.0), item("b", 1, 5.0), item("c", 1, 1.0)];
        let groups = vec![vec![0, 1], vec![2]];
        let bins = partition_n_atomic(&items, &groups, 2);
        let bin_with_a = bins.iter().find(|b| b.contains(&"a".to_string())).unwrap();
        assert!(bin_with_a.contains(&"b".to_string()));
    }

    #[test]
    fn test_partition_t_isolates_exclusive() {
        let mut items = vec![item("a", 2, 5.0), item("b", 2, 5.0)];
        items[0].exclusive = true;
        let batches = partition_t(&items, 4, 1.0);
        let excl_batch = batches.iter().find(|b| b.contains(&"a".to_string())).unwrap();
        assert_eq!(excl_batch.len(), 1);
    }

    #[test]
    fn test_tile_rounds_up_to_node_multiple() {
        assert_eq!(tile(5, 4), 8);
        assert_eq!(tile(4, 4), 4);
    }

    #[test]
    fn test_dependency_groups_connects_chain() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut edges = HashMap::new();
        edges.insert("b".to_string(), vec!["a".to_string()]);
        let groups = dependency_groups(&ids, &edges);
        assert_eq!(groups.len(), 2);
    }
}
