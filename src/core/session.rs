//! Session (C8): one run of a resolved spec set against an execution workspace.
//!
//! A session owns a `TestCase` per spec, wired to its dependencies' `TestCase`s
//! (not just their specs) so the scheduler can read live status without a second
//! lookup. Naming follows `core::time::session_timestamp()`, the same
//! microsecond-precision, path-safe timestamp the teacher's own run-id scheme uses.

use crate::core::config::Config;
use crate::core::error::CanaryError;
use crate::core::executor::Executor;
use crate::core::resource::ResourcePool;
use crate::core::scheduler::{self, Scheduler};
use crate::core::spec::ResolvedSpec;
use crate::core::testcase::{ExecutionSpace, Status, TestCase, Timekeeper};
use crate::core::time::session_timestamp;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Session {
    pub name: String,
    pub root: PathBuf,
    pub cases: Vec<Arc<TestCase>>,
}

impl Session {
    /// Start a new session under `sessions_root`, one `TestCase` per spec in `specs`
    /// (assumed dependency-first, as returned by [`crate::core::builder::Builder::run`]
    /// or [`crate::core::selector::Selector::finalize`]).
    pub fn create(sessions_root: &Path, specs: &[Arc<ResolvedSpec>]) -> Result<Session, CanaryError> {
        let name = session_timestamp();
        let root = sessions_root.join(&name);
        std::fs::create_dir_all(&root)?;
        let cases = build_cases(specs, &root, &name);
        Ok(Session { name, root, cases })
    }

    /// Reopen an existing session directory against the current spec set, for `rerun`
    /// / `log` / `report` flows that need the original session's workspace layout.
    pub fn load(sessions_root: &Path, name: &str, specs: &[Arc<ResolvedSpec>]) -> Result<Session, CanaryError> {
        let root = sessions_root.join(name);
        if !root.exists() {
            return Err(CanaryError::NotFound(format!("session {}", name)));
        }
        let cases = build_cases(specs, &root, name);
        Ok(Session {
            name: name.to_string(),
            root,
            cases,
        })
    }

    /// Run every case to completion and return the worst-status aggregate exit code.
    pub fn run(&self, config: &Config, pool: &ResourcePool) -> i32 {
        scheduler::install_signal_handlers();
        let executor = Arc::new(Executor::new(config));
        let scheduler = Scheduler::new(pool, config).with_fail_fast(config.fail_fast);
        scheduler.run(self.cases.clone(), executor)
    }

    /// Snapshot of every case's terminal status/timing/workspace, ready for
    /// `database::put_results`.
    pub fn results(&self) -> Vec<(String, Status, Timekeeper, ExecutionSpace)> {
        self.cases
            .iter()
            .map(|c| {
                (
                    c.id().to_string(),
                    c.status.lock().unwrap().clone(),
                    c.timekeeper.lock().unwrap().clone(),
                    c.workspace.clone(),
                )
            })
            .collect()
    }
}

fn build_cases(specs: &[Arc<ResolvedSpec>], root: &Path, name: &str) -> Vec<Arc<TestCase>> {
    let mut by_id: HashMap<String, Arc<TestCase>> = HashMap::with_capacity(specs.len());
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let dependencies: Vec<Arc<TestCase>> = spec
            .dependencies
            .iter()
            .filter_map(|d| by_id.get(&d.core.id).cloned())
            .collect();
        let case = Arc::new(TestCase::new(spec.clone(), root, name, dependencies));
        by_id.insert(spec.core.id.clone(), case.clone());
        out.push(case);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generator::GeneratorRegistry;

    #[test]
    fn test_create_builds_one_case_per_spec() {
        let dir = tempfile::tempdir().unwrap();
        let registry = GeneratorRegistry::with_defaults();
        let config = Config::default();
        std::fs::write(dir.path().join("a.canary"), "family: a\n").unwrap();
        let draft = registry
            .generate(dir.path(), Path::new("a.canary"), &config)
            .unwrap()
            .remove(0);
        let spec = Arc::new(draft.resolve(Vec::new(), Vec::new()));

        let sessions_root = dir.path().join("sessions");
        let session = Session::create(&sessions_root, &[spec]).unwrap();
        assert_eq!(session.cases.len(), 1);
        assert!(session.root.exists());
    }

    #[test]
    fn test_load_missing_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = Session::load(dir.path(), "nope", &[]).unwrap_err();
        assert!(matches!(err, CanaryError::NotFound(_)));
    }
}
