//! Executor (C7): per-case setup/launch/supervise/interpret/finish protocol.
//!
//! Mirrors `launcher.py`'s `SubprocessLauncher` (env/module/rcfile setup around a
//! `subprocess.run`) for the launch step, and spec.md §4.7's outcome-interpretation
//! table. Two-stage cancellation (SIGINT, grace period, then kill) uses `libc`
//! directly since the teacher's own child-supervision code
//! (`container.rs::execute_container_with_timeout`) only hard-kills and no crate in
//! the corpus sends POSIX signals.

use crate::core::config::Config;
use crate::core::error::CanaryError;
use crate::core::spec::{AssetAction, EnvOp, ResolvedSpec, XStatus};
use crate::core::testcase::{Category, Status, StateKind, TestCase, Timekeeper};
use crate::core::time::iso_now_micros;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Grace period between SIGINT and a hard kill once a case exceeds its timeout.
const CANCEL_GRACE: Duration = Duration::from_secs(3);
/// How often the supervise loop polls the child for exit / timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Executor {
    config: Config,
}

impl Executor {
    /// Owns a clone of `config` rather than borrowing it, so an `Executor` can be
    /// shared across dispatch threads behind an `Arc` without a lifetime parameter.
    pub fn new(config: &Config) -> Self {
        Executor {
            config: config.clone(),
        }
    }

    /// Create `workspace.dir`, place the test file, and materialize each asset.
    pub fn setup(&self, case: &TestCase) -> Result<(), CanaryError> {
        let dir = case.workspace.dir();
        std::fs::create_dir_all(&dir)?;

        let spec = &case.spec;
        let src_file = spec.core.file_root.join(&spec.core.file_path);
        let dst_file = dir.join(
            spec.core
                .file_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("testfile")),
        );
        place_file(&src_file, &dst_file, self.config.copy_all_resources)?;

        for asset in &spec.core.assets {
            if !asset.src.exists() {
                return Err(CanaryError::MissingAsset {
                    spec_id: spec.core.id.clone(),
                    path: asset.src.clone(),
                });
            }
            let dst = dir.join(&asset.dst);
            match asset.action {
                AssetAction::None => {}
                AssetAction::Copy => {
                    std::fs::copy(&asset.src, &dst)?;
                }
                AssetAction::Link => symlink_best_effort(&asset.src, &dst)?,
            }
        }
        case.set_status(Status::new(StateKind::Ready));
        Ok(())
    }

    /// Build the child environment: process env, `environment_modifications` in
    /// order, `workspace.dir` prepended to `PATH`/`PYTHONPATH`, and resource-group
    /// vars.
    fn build_env(&self, case: &TestCase, resource_ids: &HashMap<String, Vec<u32>>) -> HashMap<String, String> {
        let spec = &case.spec;
        let mut env: HashMap<String, String> = std::env::vars().collect();
        for (k, v) in &spec.core.environment {
            env.insert(k.clone(), v.clone());
        }
        for m in &spec.core.environment_modifications {
            match m.op {
                EnvOp::Set => {
                    if let Some(v) = &m.value {
                        env.insert(m.name.clone(), v.clone());
                    }
                }
                EnvOp::Unset => {
                    env.remove(&m.name);
                }
                EnvOp::PrependPath => {
                    let v = m.value.clone().unwrap_or_default();
                    let existing = env.get(&m.name).cloned().unwrap_or_default();
                    let joined = if existing.is_empty() {
                        v
                    } else {
                        format!("{}{}{}", v, m.sep, existing)
                    };
                    env.insert(m.name.clone(), joined);
                }
                EnvOp::AppendPath => {
                    let v = m.value.clone().unwrap_or_default();
                    let existing = env.get(&m.name).cloned().unwrap_or_default();
                    let joined = if existing.is_empty() {
                        v
                    } else {
                        format!("{}{}{}", existing, m.sep, v)
                    };
                    env.insert(m.name.clone(), joined);
                }
            }
        }
        let dir = case.workspace.dir().to_string_lossy().to_string();
        for key in ["PATH", "PYTHONPATH"] {
            let existing = env.get(key).cloned().unwrap_or_default();
            let joined = if existing.is_empty() {
                dir.clone()
            } else {
                format!("{}:{}", dir, existing)
            };
            env.insert(key.to_string(), joined);
        }
        for (ty, ids) in resource_ids {
            let var = format!("CANARY_{}", ty.to_uppercase());
            let joined = ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
            env.insert(var, joined);
        }
        env
    }

    /// Launch the case's command, capturing stdout/stderr into the workspace, and
    /// supervise it until exit or timeout.
    pub fn launch_and_supervise(
        &self,
        case: &TestCase,
        resource_ids: &HashMap<String, Vec<u32>>,
    ) -> Result<ExecutionOutcome, CanaryError> {
        let dir = case.workspace.dir();
        let env = self.build_env(case, resource_ids);
        let mut command = case
            .spec
            .core
            .attributes
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("true")
            .to_string();
        // `canary run ... -- ARGS...` passes trailing args verbatim to every case's
        // command line via this env var, set once by the CLI before the session runs.
        if let Some(extra) = env.get("CANARY_ARGS") {
            if !extra.is_empty() {
                command.push(' ');
                command.push_str(extra);
            }
        }

        let stdout_path = dir.join(&case.spec.core.stdout);
        let stdout_file = std::fs::File::create(&stdout_path)?;
        let stderr_target: Stdio = match &case.spec.core.stderr {
            Some(name) => Stdio::from(std::fs::File::create(dir.join(name))?),
            None => Stdio::from(stdout_file.try_clone()?),
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&dir)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::from(stdout_file))
            .stderr(stderr_target);

        let started = iso_now_micros();
        case.timekeeper.lock().unwrap().started_on = Some(started.clone());
        case.set_status(Status::new(StateKind::Running));

        let mut child = cmd
            .spawn()
            .map_err(|e| CanaryError::LaunchFailed(e.to_string()))?;

        let timeout = Duration::from_secs_f64(
            case.spec.core.timeout.max(0.0) * self.config.timeout_multiplier,
        );
        let start = Instant::now();
        let wait_result = if case.spec.core.timeout > 0.0 {
            self.supervise_with_timeout(&mut child, timeout)
        } else {
            child.wait().map(Some)
        };

        let finished = iso_now_micros();
        let duration = start.elapsed().as_secs_f64();
        {
            let mut tk = case.timekeeper.lock().unwrap();
            tk.finished_on = Some(finished);
            tk.duration = Some(duration);
        }

        match wait_result {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                Ok(self.interpret_outcome(&case.spec, code))
            }
            Ok(None) => Ok(ExecutionOutcome {
                state: StateKind::Timeout,
                code: Some(self.config.timeout_code),
                reason: Some(format!("exceeded timeout of {:.1}s", case.spec.core.timeout)),
            }),
            Err(e) => Err(CanaryError::LaunchFailed(e.to_string())),
        }
    }

    /// Poll the child; once `timeout` elapses, send `SIGINT`, wait a grace period,
    /// then `kill`. Returns `Ok(None)` if the child had to be force-killed.
    fn supervise_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> std::io::Result<Option<std::process::ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        send_signal(child.id(), libc::SIGINT);
        let grace_start = Instant::now();
        while grace_start.elapsed() < CANCEL_GRACE {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        child.kill()?;
        child.wait()?;
        Ok(None)
    }

    /// Map `(xstatus, exit code)` to a terminal outcome per spec.md §4.7 step 4.
    pub fn interpret_outcome(&self, spec: &ResolvedSpec, code: i32) -> ExecutionOutcome {
        match spec.core.xstatus {
            XStatus::DiffCode => {
                if code == self.config.diff_code {
                    ExecutionOutcome::state(StateKind::Diffed, code)
                } else {
                    ExecutionOutcome::reasoned(StateKind::Failed, code, "expected diff")
                }
            }
            XStatus::Exact(expected) => {
                if code == expected {
                    ExecutionOutcome::state(StateKind::Success, code)
                } else {
                    ExecutionOutcome::reasoned(
                        StateKind::Failed,
                        code,
                        &format!("expected exit code {}", expected),
                    )
                }
            }
            XStatus::AnyNonZero => {
                if code != 0 {
                    ExecutionOutcome::state(StateKind::Success, code)
                } else {
                    ExecutionOutcome::reasoned(StateKind::Failed, code, "expected non-zero exit")
                }
            }
            XStatus::Normal => {
                let state = if code == 0 {
                    StateKind::Success
                } else if code == self.config.diff_code {
                    StateKind::Diffed
                } else if code == self.config.skip_code {
                    StateKind::Skipped
                } else if code == self.config.timeout_code {
                    StateKind::Timeout
                } else {
                    StateKind::Failed
                };
                ExecutionOutcome::state(state, code)
            }
        }
    }

    /// Record timing, write the final lockfile atomically, and leave the case in its
    /// terminal status.
    pub fn finish(&self, case: &TestCase, outcome: ExecutionOutcome, lockfile: &Path) -> Result<(), CanaryError> {
        let status = match &outcome.reason {
            Some(r) => Status::with_reason(outcome.state, r.clone()),
            None => {
                let mut s = Status::new(outcome.state);
                s.code = outcome.code;
                s
            }
        };
        case.set_status(status.clone());
        write_lockfile_atomic(lockfile, case, &status)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub state: StateKind,
    pub code: Option<i32>,
    pub reason: Option<String>,
}

impl ExecutionOutcome {
    fn state(state: StateKind, code: i32) -> Self {
        ExecutionOutcome {
            state,
            code: Some(code),
            reason: None,
        }
    }

    fn reasoned(state: StateKind, code: i32, reason: &str) -> Self {
        ExecutionOutcome {
            state,
            code: Some(code),
            reason: Some(reason.to_string()),
        }
    }
}

fn send_signal(pid: u32, sig: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

fn place_file(src: &Path, dst: &Path, copy: bool) -> Result<(), CanaryError> {
    if copy {
        std::fs::copy(src, dst)?;
    } else {
        symlink_best_effort(src, dst)?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_best_effort(src: &Path, dst: &Path) -> Result<(), CanaryError> {
    std::os::unix::fs::symlink(src, dst).or_else(|_| std::fs::copy(src, dst).map(|_| ()))?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink_best_effort(src: &Path, dst: &Path) -> Result<(), CanaryError> {
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Write-to-tmp-then-rename so a crash between the two leaves the previous lockfile
/// intact (spec.md §8 invariant 9).
fn write_lockfile_atomic(path: &Path, case: &TestCase, status: &Status) -> Result<(), CanaryError> {
    let tk = case.timekeeper.lock().unwrap().clone();
    let doc = serde_json::json!({
        "spec": case.spec.core.id,
        "status": status,
        "timekeeper": tk,
        "workspace": case.workspace,
    });
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(serde_json::to_vec_pretty(&doc)?.as_slice())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `category` classification used for session-level exit-code aggregation.
pub fn worst_category(cases: &[std::sync::Arc<TestCase>]) -> Category {
    let mut worst = Category::Pass;
    for case in cases {
        let cat = case.state().category();
        worst = match (worst, cat) {
            (_, Category::Fail) | (Category::Fail, _) => Category::Fail,
            (_, Category::Skip) if !matches!(worst, Category::Fail) => Category::Skip,
            (w, _) => w,
        };
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::generator::GeneratorRegistry;
    use std::sync::Arc;

    fn make_case(dir: &Path, content: &str, session_root: &Path) -> (TestCase, Config) {
        let path = dir.join("t.canary");
        std::fs::write(&path, content).unwrap();
        let registry = GeneratorRegistry::with_defaults();
        let config = Config::default();
        let mut drafts = registry
            .generate(dir, Path::new("t.canary"), &config)
            .unwrap();
        let spec = Arc::new(drafts.remove(0).resolve(Vec::new(), Vec::new()));
        (TestCase::new(spec, session_root, "sess", Vec::new()), config)
    }

    #[test]
    fn test_setup_creates_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        let session_root = dir.path().join("session");
        let (case, config) = make_case(dir.path(), "family: t\n", &session_root);
        let executor = Executor::new(&config);
        executor.setup(&case).unwrap();
        assert!(case.workspace.dir().exists());
    }

    #[test]
    fn test_interpret_outcome_normal_success() {
        let dir = tempfile::tempdir().unwrap();
        let session_root = dir.path().join("session");
        let (case, config) = make_case(dir.path(), "family: t\n", &session_root);
        let executor = Executor::new(&config);
        let outcome = executor.interpret_outcome(&case.spec, 0);
        assert_eq!(outcome.state, StateKind::Success);
    }

    #[test]
    fn test_interpret_outcome_diff_code() {
        let dir = tempfile::tempdir().unwrap();
        let session_root = dir.path().join("session");
        let (case, config) = make_case(dir.path(), "family: t\n", &session_root);
        let executor = Executor::new(&config);
        let outcome = executor.interpret_outcome(&case.spec, config.diff_code);
        assert_eq!(outcome.state, StateKind::Diffed);
    }

    #[test]
    fn test_interpret_outcome_xstatus_exact() {
        let dir = tempfile::tempdir().unwrap();
        let session_root = dir.path().join("session");
        let (case, config) = make_case(dir.path(), "family: t\nxstatus: 7\n", &session_root);
        let executor = Executor::new(&config);
        assert_eq!(executor.interpret_outcome(&case.spec, 7).state, StateKind::Success);
        assert_eq!(executor.interpret_outcome(&case.spec, 0).state, StateKind::Failed);
    }

    #[test]
    fn test_interpret_outcome_xstatus_any_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let session_root = dir.path().join("session");
        let (case, config) = make_case(dir.path(), "family: t\nxstatus: any\n", &session_root);
        let executor = Executor::new(&config);
        assert_eq!(executor.interpret_outcome(&case.spec, 3).state, StateKind::Success);
        assert_eq!(executor.interpret_outcome(&case.spec, 0).state, StateKind::Failed);
    }

    #[test]
    fn test_launch_runs_trivial_command_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let session_root = dir.path().join("session");
        let (case, config) = make_case(dir.path(), "family: t\ntimeout: 5\n", &session_root);
        let executor = Executor::new(&config);
        executor.setup(&case).unwrap();
        let outcome = executor
            .launch_and_supervise(&case, &HashMap::new())
            .unwrap();
        assert_eq!(outcome.state, StateKind::Success);
        assert!(case.workspace.dir().join("canary-out.txt").exists());
    }
}
