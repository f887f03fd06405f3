//! Selector (C4): applies the rule chain to mask specs, propagates masks through the
//! dependency graph, and finalizes a topologically ordered survivor list.

use crate::core::error::CanaryError;
use crate::core::graph::topo_sort;
use crate::core::resource::ResourcePool;
use crate::core::rules::{ResourceCapacityRule, Rule};
use crate::core::spec::{Mask, ResolvedSpec};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A serializable, replay-able record of a selection pass.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SelectorSnapshot {
    pub spec_set_id: String,
    pub masked: HashMap<String, String>,
    pub rules: Vec<serde_json::Value>,
    pub created_on: f64,
}

pub struct Selector<'a> {
    rules: Vec<Box<dyn Rule>>,
    pool: &'a ResourcePool,
}

impl<'a> Selector<'a> {
    /// `ResourceCapacityRule` is always prepended to whatever rules the caller asks
    /// for.
    pub fn new(pool: &'a ResourcePool, mut rules: Vec<Box<dyn Rule>>) -> Self {
        let mut all: Vec<Box<dyn Rule>> = vec![Box::new(ResourceCapacityRule::new())];
        all.append(&mut rules);
        Selector { rules: all, pool }
    }

    /// Evaluate the rule chain against every spec, propagate masks to dependents, and
    /// return the masked-id -> reason map plus a snapshot. Does not drop masked specs;
    /// call [`finalize`] for the survivor list.
    pub fn run(&self, specs: &[Arc<ResolvedSpec>]) -> SelectorSnapshot {
        let mut masked: HashMap<String, String> = HashMap::new();

        for spec in specs {
            spec.core.set_mask(Mask::unmasked());
            for rule in &self.rules {
                let outcome = rule.evaluate(spec, self.pool);
                if !outcome.ok {
                    let reason = outcome.reason.unwrap_or_else(|| rule.default_reason());
                    spec.core.set_mask(Mask::masked(reason.clone()));
                    masked.insert(spec.core.id.clone(), reason);
                    break;
                }
            }
        }

        self.propagate_masks(specs, &mut masked);

        let spec_set_id = hash_spec_ids(specs);
        let rule_descriptions: Vec<serde_json::Value> =
            self.rules.iter().map(|r| r.describe()).collect();
        SelectorSnapshot {
            spec_set_id,
            masked,
            rules: rule_descriptions,
            created_on: now_secs(),
        }
    }

    /// BFS forward through the dependency graph: if X is masked, every spec with X as
    /// a direct or transitive dependency is masked too.
    fn propagate_masks(&self, specs: &[Arc<ResolvedSpec>], masked: &mut HashMap<String, String>) {
        let mut dependents: HashMap<String, Vec<Arc<ResolvedSpec>>> = HashMap::new();
        for spec in specs {
            for dep in &spec.dependencies {
                dependents
                    .entry(dep.core.id.clone())
                    .or_default()
                    .push(spec.clone());
            }
        }

        let mut queue: VecDeque<String> = masked.keys().cloned().collect();
        while let Some(id) = queue.pop_front() {
            if let Some(children) = dependents.get(&id) {
                for child in children {
                    if masked.contains_key(&child.core.id) {
                        continue;
                    }
                    let reason = "One or more dependencies masked".to_string();
                    child.core.set_mask(Mask::masked(reason.clone()));
                    masked.insert(child.core.id.clone(), reason);
                    queue.push_back(child.core.id.clone());
                }
            }
        }
    }

    /// Drop masked specs and topologically re-emit the survivors with dependency
    /// references replaced by the finalized peers.
    pub fn finalize(
        &self,
        specs: Vec<Arc<ResolvedSpec>>,
        masked: &HashMap<String, String>,
    ) -> Result<Vec<Arc<ResolvedSpec>>, CanaryError> {
        let survivors: Vec<Arc<ResolvedSpec>> = specs
            .into_iter()
            .filter(|s| !masked.contains_key(&s.core.id))
            .collect();

        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        for s in &survivors {
            graph.insert(
                s.core.id.clone(),
                s.dependencies.iter().map(|d| d.core.id.clone()).collect(),
            );
        }
        let order = topo_sort(&graph)?;
        let by_id: HashMap<String, Arc<ResolvedSpec>> =
            survivors.into_iter().map(|s| (s.core.id.clone(), s)).collect();
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.get(&id).cloned())
            .collect())
    }
}

fn hash_spec_ids(specs: &[Arc<ResolvedSpec>]) -> String {
    let mut ids: Vec<&str> = specs.iter().map(|s| s.core.id.as_str()).collect();
    ids.sort_unstable();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::generator::GeneratorRegistry;
    use crate::core::rules::KeywordRule;
    use std::io::Write;

    fn make(dir: &std::path::Path, name: &str, content: &str) -> crate::core::spec::UnresolvedSpec {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", content).unwrap();
        let registry = GeneratorRegistry::with_defaults();
        let config = Config::default();
        registry.generate(dir, std::path::Path::new(name), &config).unwrap().remove(0)
    }

    #[test]
    fn test_mask_propagation_to_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let a = make(dir.path(), "a.canary", "family: a\nkeywords: slow\n");
        let b_draft = make(dir.path(), "b.canary", "family: b\n");
        let a_resolved = Arc::new(a.resolve(Vec::new(), Vec::new()));
        let b_resolved = Arc::new(b_draft.resolve(vec![a_resolved.clone()], vec!["success".to_string()]));

        let pool = ResourcePool::new();
        let selector = Selector::new(
            &pool,
            vec![Box::new(KeywordRule {
                exprs: vec!["not slow".to_string()],
            })],
        );
        let specs = vec![a_resolved.clone(), b_resolved.clone()];
        let snapshot = selector.run(&specs);
        assert!(snapshot.masked.contains_key(&a_resolved.core.id));
        assert!(snapshot.masked.contains_key(&b_resolved.core.id));
        assert!(snapshot.masked[&b_resolved.core.id].contains("dependencies"));
    }

    #[test]
    fn test_finalize_drops_masked_and_keeps_topo_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = make(dir.path(), "a.canary", "family: a\n");
        let b_draft = make(dir.path(), "b.canary", "family: b\n");
        let a_resolved = Arc::new(a.resolve(Vec::new(), Vec::new()));
        let b_resolved = Arc::new(b_draft.resolve(vec![a_resolved.clone()], vec!["success".to_string()]));

        let pool = ResourcePool::new();
        let selector = Selector::new(&pool, Vec::new());
        let specs = vec![a_resolved.clone(), b_resolved.clone()];
        let snapshot = selector.run(&specs);
        assert!(snapshot.masked.is_empty());
        let finalized = selector.finalize(specs, &snapshot.masked).unwrap();
        assert_eq!(finalized.len(), 2);
        assert_eq!(finalized[0].core.id, a_resolved.core.id);
    }
}
