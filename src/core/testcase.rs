//! Runtime `TestCase`: a `ResolvedSpec` paired with an execution workspace, mutable
//! status, and timing/measurement bookkeeping.

use crate::core::spec::ResolvedSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSpace {
    pub root: PathBuf,
    pub path: PathBuf,
    pub session: String,
}

impl ExecutionSpace {
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateKind {
    Created,
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Diffed,
    Timeout,
    Skipped,
    Cancelled,
    NotRun,
    Unknown,
    Masked,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Pass,
    Fail,
    Skip,
    None,
}

impl StateKind {
    pub fn category(&self) -> Category {
        match self {
            StateKind::Success => Category::Pass,
            StateKind::Diffed | StateKind::Failed | StateKind::Timeout | StateKind::Cancelled
            | StateKind::Invalid | StateKind::Unknown => Category::Fail,
            StateKind::Skipped | StateKind::Masked | StateKind::NotRun => Category::Skip,
            StateKind::Created | StateKind::Pending | StateKind::Ready | StateKind::Running => {
                Category::None
            }
        }
    }

    /// Per-status exit-code table (spec.md §4.8): `PASS=0, DIFF=64, SKIP=63, FAIL=1,
    /// TIMEOUT=2, NOT_RUN=3`.
    pub fn exit_code(&self) -> i32 {
        match self {
            StateKind::Success => 0,
            StateKind::Diffed => 64,
            StateKind::Skipped | StateKind::Masked => 63,
            StateKind::Timeout => 2,
            StateKind::NotRun => 3,
            StateKind::Failed | StateKind::Cancelled | StateKind::Invalid | StateKind::Unknown => 1,
            StateKind::Created | StateKind::Pending | StateKind::Ready | StateKind::Running => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: StateKind,
    pub reason: Option<String>,
    pub code: Option<i32>,
    pub category: Category,
}

impl Status {
    pub fn new(state: StateKind) -> Self {
        Status {
            category: state.category(),
            state,
            reason: None,
            code: None,
        }
    }

    pub fn with_reason(state: StateKind, reason: impl Into<String>) -> Self {
        let mut s = Status::new(state);
        s.reason = Some(reason.into());
        s
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timekeeper {
    pub started_on: Option<String>,
    pub finished_on: Option<String>,
    pub duration: Option<f64>,
}

/// A resolved spec materialized into one on-disk directory under a session's work
/// tree, owned exclusively by that `Session`.
pub struct TestCase {
    pub spec: Arc<ResolvedSpec>,
    pub workspace: ExecutionSpace,
    pub status: Mutex<Status>,
    pub timekeeper: Mutex<Timekeeper>,
    pub measurements: Mutex<HashMap<String, serde_json::Value>>,
    pub dependencies: Vec<Arc<TestCase>>,
    pub dep_done_criteria: Vec<String>,
}

impl TestCase {
    pub fn new(
        spec: Arc<ResolvedSpec>,
        session_root: &Path,
        session_name: &str,
        dependencies: Vec<Arc<TestCase>>,
    ) -> Self {
        assert_eq!(
            dependencies.len(),
            spec.dep_done_criteria.len(),
            "dependencies/dep_done_criteria length mismatch"
        );
        let rel = spec
            .core
            .file_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(spec.display_name());
        let workspace = ExecutionSpace {
            root: session_root.join("work"),
            path: rel,
            session: session_name.to_string(),
        };
        let dep_done_criteria = spec.dep_done_criteria.clone();
        TestCase {
            spec,
            workspace,
            status: Mutex::new(Status::new(StateKind::Created)),
            timekeeper: Mutex::new(Timekeeper::default()),
            measurements: Mutex::new(HashMap::new()),
            dependencies,
            dep_done_criteria,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.core.id
    }

    pub fn state(&self) -> StateKind {
        self.status.lock().unwrap().state
    }

    pub fn set_status(&self, status: Status) {
        *self.status.lock().unwrap() = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_table() {
        assert_eq!(StateKind::Success.exit_code(), 0);
        assert_eq!(StateKind::Diffed.exit_code(), 64);
        assert_eq!(StateKind::Skipped.exit_code(), 63);
        assert_eq!(StateKind::Failed.exit_code(), 1);
        assert_eq!(StateKind::Timeout.exit_code(), 2);
        assert_eq!(StateKind::NotRun.exit_code(), 3);
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(StateKind::Success.category(), Category::Pass);
        assert_eq!(StateKind::Failed.category(), Category::Fail);
        assert_eq!(StateKind::Skipped.category(), Category::Skip);
        assert_eq!(StateKind::Running.category(), Category::None);
    }
}
