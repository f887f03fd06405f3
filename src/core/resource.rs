//! Resource pool (C5): typed resource inventory with satisfy/acquire/release.

use std::collections::HashMap;
use std::sync::Mutex;

/// One concrete resource instance (e.g. a single CPU core or GPU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub gid: u32,
    pub lid: u32,
    pub slots: u32,
}

/// A conjunctive requirement: one group must fit entirely within a single resource
/// type's remaining capacity. `required_resources()` on a spec returns a disjunction
/// (`Vec<Vec<(type, slots)>>`) of these groups.
pub type RequiredGroup = Vec<(String, u32)>;

#[derive(Debug, Clone)]
pub struct Allocation {
    pub resource_type: String,
    pub instances: Vec<Instance>,
}

struct TypeInventory {
    instances: Vec<Instance>,
    acquired_slots: u32,
}

impl TypeInventory {
    fn total_slots(&self) -> u32 {
        self.instances.iter().map(|i| i.slots).sum()
    }

    fn available_slots(&self) -> u32 {
        self.total_slots() - self.acquired_slots
    }
}

/// Named resource-type inventory (`cpus`, `gpus`, `nodes`, …) guarded by a single
/// mutex; critical sections (fit-check, acquire, release) are always short.
pub struct ResourcePool {
    inner: Mutex<HashMap<String, TypeInventory>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        ResourcePool {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register `count` instances of `resource_type`, each with `slots` capacity, all
    /// on node-local id `lid` (single-node pools pass `lid = 0`).
    pub fn add_type(&self, resource_type: &str, count: u32, slots: u32, lid: u32) {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard
            .entry(resource_type.to_string())
            .or_insert_with(|| TypeInventory {
                instances: Vec::new(),
                acquired_slots: 0,
            });
        let base_gid = entry.instances.len() as u32;
        for i in 0..count {
            entry.instances.push(Instance {
                gid: base_gid + i,
                lid,
                slots,
            });
        }
    }

    pub fn count(&self, resource_type: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .get(resource_type)
            .map(|t| t.total_slots())
            .unwrap_or(0)
    }

    /// First-node per-type capacity, used to derive `nodes` -> per-node cpus/gpus.
    pub fn pinfo(&self, key: &str) -> Option<u32> {
        let resource_type = key.strip_suffix("_per_node")?;
        let guard = self.inner.lock().unwrap();
        let inv = guard.get(resource_type)?;
        let node0: u32 = inv
            .instances
            .iter()
            .filter(|i| i.lid == 0)
            .map(|i| i.slots)
            .sum();
        Some(node0)
    }

    /// True iff at least one disjunct group can fit in present capacity without
    /// acquiring anything.
    pub fn satisfies(&self, required: &[RequiredGroup]) -> bool {
        let guard = self.inner.lock().unwrap();
        required.iter().any(|group| {
            group.iter().all(|(ty, slots)| {
                guard
                    .get(ty)
                    .map(|inv| inv.available_slots() >= *slots)
                    .unwrap_or(false)
            })
        })
    }

    /// Acquire the first disjunct group that fits, in group order. Returns `None` if
    /// no group currently fits (caller should wait and retry).
    pub fn acquire(&self, required: &[RequiredGroup]) -> Option<Vec<Allocation>> {
        let mut guard = self.inner.lock().unwrap();
        for group in required {
            let fits = group.iter().all(|(ty, slots)| {
                guard
                    .get(ty)
                    .map(|inv| inv.available_slots() >= *slots)
                    .unwrap_or(false)
            });
            if !fits {
                continue;
            }
            let mut allocations = Vec::with_capacity(group.len());
            for (ty, slots) in group {
                let inv = guard.get_mut(ty).unwrap();
                inv.acquired_slots += slots;
                allocations.push(Allocation {
                    resource_type: ty.clone(),
                    instances: inv.instances.clone(),
                });
            }
            return Some(allocations);
        }
        None
    }

    pub fn release(&self, allocations: &[Allocation], required: &[RequiredGroup]) {
        let mut guard = self.inner.lock().unwrap();
        let slots_by_type: HashMap<&str, u32> = required
            .iter()
            .flatten()
            .map(|(ty, slots)| (ty.as_str(), *slots))
            .collect();
        for alloc in allocations {
            if let Some(inv) = guard.get_mut(&alloc.resource_type) {
                let slots = slots_by_type.get(alloc.resource_type.as_str()).copied().unwrap_or(0);
                inv.acquired_slots = inv.acquired_slots.saturating_sub(slots);
            }
        }
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_and_satisfies() {
        let pool = ResourcePool::new();
        pool.add_type("cpu", 4, 1, 0);
        assert_eq!(pool.count("cpu"), 4);
        assert!(pool.satisfies(&[vec![("cpu".to_string(), 4)]]));
        assert!(!pool.satisfies(&[vec![("cpu".to_string(), 5)]]));
    }

    #[test]
    fn test_acquire_release_conserves_capacity() {
        let pool = ResourcePool::new();
        pool.add_type("cpu", 4, 1, 0);
        let required = vec![vec![("cpu".to_string(), 3)]];
        let alloc = pool.acquire(&required).unwrap();
        assert!(!pool.satisfies(&[vec![("cpu".to_string(), 2)]]));
        pool.release(&alloc, &required);
        assert!(pool.satisfies(&[vec![("cpu".to_string(), 4)]]));
    }

    #[test]
    fn test_acquire_fails_when_insufficient() {
        let pool = ResourcePool::new();
        pool.add_type("cpu", 2, 1, 0);
        let required = vec![vec![("cpu".to_string(), 3)]];
        assert!(pool.acquire(&required).is_none());
    }

    #[test]
    fn test_pinfo_per_node() {
        let pool = ResourcePool::new();
        pool.add_type("cpu", 8, 1, 0);
        assert_eq!(pool.pinfo("cpu_per_node"), Some(8));
        assert_eq!(pool.pinfo("gpu_per_node"), None);
    }

    #[test]
    fn test_disjunctive_groups_first_fit() {
        let pool = ResourcePool::new();
        pool.add_type("cpu", 2, 1, 0);
        pool.add_type("gpu", 4, 1, 0);
        let required = vec![vec![("cpu".to_string(), 4)], vec![("gpu".to_string(), 2)]];
        let alloc = pool.acquire(&required).unwrap();
        assert_eq!(alloc[0].resource_type, "gpu");
    }
}
