//! Workspace façade (C10): the single entry point the CLI drives. Owns the
//! `.canary/` anchor directory, the SQLite index, and the session tree underneath
//! it, and composes the builder/selector/scheduler pipeline for callers that just
//! want "add these files, generate specs, select some, run a session."

use crate::core::builder::Builder;
use crate::core::config::Config;
use crate::core::database;
use crate::core::error::CanaryError;
use crate::core::generator::{Generator, GeneratorRegistry};
use crate::core::pool::{self, WorkspacePool};
use crate::core::resource::ResourcePool;
use crate::core::rules::Rule;
use crate::core::selector::{Selector, SelectorSnapshot};
use crate::core::session::Session;
use crate::core::spec::{Mask, ResolvedSpec};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ANCHOR_DIR: &str = ".canary";
const DB_FILE: &str = "workspace.sqlite3";
const SESSIONS_DIR: &str = "sessions";

pub struct Workspace {
    pub root: PathBuf,
    pub anchor: PathBuf,
    pub db_path: PathBuf,
    pub sessions_root: PathBuf,
    pub config: Config,
    pool: &'static WorkspacePool,
}

impl Workspace {
    /// Create a new `.canary/` anchor under `root`. Errors if one already exists.
    pub fn create(root: &Path) -> Result<Workspace, CanaryError> {
        let anchor = root.join(ANCHOR_DIR);
        if anchor.exists() {
            return Err(CanaryError::AlreadyExists(anchor.display().to_string()));
        }
        std::fs::create_dir_all(&anchor)?;
        Self::open(root, anchor)
    }

    /// Open an existing `.canary/` anchor under `root`.
    pub fn load(root: &Path) -> Result<Workspace, CanaryError> {
        let anchor = root.join(ANCHOR_DIR);
        if !anchor.exists() {
            return Err(CanaryError::NotFound(anchor.display().to_string()));
        }
        Self::open(root, anchor)
    }

    fn open(root: &Path, anchor: PathBuf) -> Result<Workspace, CanaryError> {
        let config = Config::load(root)?;
        let sessions_root = anchor.join(SESSIONS_DIR);
        std::fs::create_dir_all(&sessions_root)?;
        Ok(Workspace {
            root: root.to_path_buf(),
            db_path: anchor.join(DB_FILE),
            anchor,
            sessions_root,
            config,
            pool: pool::global_pool(),
        })
    }

    /// Recursively discover test files under each of `scan_paths` and register a
    /// `Generator` for each recognized one.
    pub fn add(&self, scan_paths: &[PathBuf]) -> Result<Vec<Generator>, CanaryError> {
        let registry = GeneratorRegistry::with_defaults();
        let mut generators = Vec::new();
        for base in scan_paths {
            walk(&self.root, base, &registry, &mut generators)?;
        }
        database::put_generators(self.pool, &self.db_path, &generators)?;
        Ok(generators)
    }

    /// Build (or, if the inputs haven't changed, reload) the resolved spec set for
    /// every known generator. Memoized by a signature over each generator's id and
    /// content hash, so an unchanged test suite skips a full rebuild.
    pub fn generate_specs(&self, generators: &[Generator]) -> Result<Vec<Arc<ResolvedSpec>>, CanaryError> {
        self.generate_specs_with(generators, false)
    }

    /// As [`Workspace::generate_specs`], but `force` bypasses the signature cache —
    /// needed when a per-invocation override (e.g. `--timeout`) must be baked into
    /// freshly resolved specs rather than reloading ones built under a prior config.
    pub fn generate_specs_with(
        &self,
        generators: &[Generator],
        force: bool,
    ) -> Result<Vec<Arc<ResolvedSpec>>, CanaryError> {
        let signature = signature_of(generators);
        if !force && database::get_signature(self.pool, &self.db_path)?.as_deref() == Some(signature.as_str()) {
            let cached = database::get_specs(self.pool, &self.db_path)?;
            if !cached.is_empty() || generators.is_empty() {
                return Ok(cached);
            }
        }
        let registry = GeneratorRegistry::with_defaults();
        let builder = Builder::new(&registry, &self.config);
        let file_paths: Vec<PathBuf> = generators.iter().map(|g| g.file_path.clone()).collect();
        let file_root = generators
            .first()
            .map(|g| g.file_root.clone())
            .unwrap_or_else(|| self.root.clone());
        let specs = builder.run(&file_root, &file_paths, Vec::new())?;
        database::put_specs(self.pool, &self.db_path, &specs, &signature)?;
        Ok(specs)
    }

    /// Apply a rule chain to the full spec set, persist the resulting
    /// [`SelectorSnapshot`] under `tag`, and return the surviving, topologically
    /// ordered specs.
    pub fn select(
        &self,
        specs: Vec<Arc<ResolvedSpec>>,
        pool: &ResourcePool,
        rules: Vec<Box<dyn Rule>>,
        tag: &str,
    ) -> Result<Vec<Arc<ResolvedSpec>>, CanaryError> {
        let selector = Selector::new(pool, rules);
        let snapshot = selector.run(&specs);
        database::put_selection(self.pool, &self.db_path, tag, &snapshot)?;
        selector.finalize(specs, &snapshot.masked)
    }

    /// Reload the previously collected generator set, for regenerating specs without
    /// re-scanning the filesystem.
    pub fn generators(&self) -> Result<Vec<Generator>, CanaryError> {
        database::get_generators(self.pool, &self.db_path)
    }

    pub fn load_selection(&self, tag: &str) -> Result<SelectorSnapshot, CanaryError> {
        database::get_selection(self.pool, &self.db_path, tag)
    }

    pub fn list_selections(&self) -> Result<Vec<String>, CanaryError> {
        database::list_selections(self.pool, &self.db_path)
    }

    pub fn remove_selection(&self, tag: &str) -> Result<(), CanaryError> {
        database::delete_selection(self.pool, &self.db_path, tag)
    }

    pub fn rename_selection(&self, from: &str, to: &str) -> Result<(), CanaryError> {
        database::rename_selection(self.pool, &self.db_path, from, to)
    }

    pub fn new_session(&self, specs: &[Arc<ResolvedSpec>]) -> Result<Session, CanaryError> {
        Session::create(&self.sessions_root, specs)
    }

    pub fn load_session(&self, name: &str, specs: &[Arc<ResolvedSpec>]) -> Result<Session, CanaryError> {
        Session::load(&self.sessions_root, name, specs)
    }

    pub fn add_session_results(&self, session: &Session) -> Result<(), CanaryError> {
        database::put_results(self.pool, &self.db_path, &session.results())
    }

    /// Every spec's most recently recorded status/timing/workspace, keyed by spec id.
    pub fn results(
        &self,
    ) -> Result<std::collections::HashMap<String, (crate::core::testcase::Status, crate::core::testcase::Timekeeper, crate::core::testcase::ExecutionSpace)>, CanaryError> {
        database::get_results(self.pool, &self.db_path)
    }

    /// Resolve a spec-id hex prefix to its full id.
    pub fn resolve_spec_id(&self, prefix: &str) -> Result<String, CanaryError> {
        database::resolve_spec_id(self.pool, &self.db_path, prefix)
    }

    /// Replace `<file_path.parent>/<spec.display_name>` with a symlink into the
    /// newest session that has a result for that spec, so the source tree always
    /// has a "latest run" view alongside each test file.
    pub fn rebuild_view(&self, specs: &[Arc<ResolvedSpec>]) -> Result<(), CanaryError> {
        let results = database::get_results(self.pool, &self.db_path)?;
        for spec in specs {
            let Some((_, _, workspace)) = results.get(&spec.core.id) else {
                continue;
            };
            let view_dir = self
                .root
                .join(spec.core.file_path.parent().unwrap_or_else(|| Path::new("")))
                .join(spec.display_name());
            if view_dir.exists() || view_dir.symlink_metadata().is_ok() {
                let _ = std::fs::remove_file(&view_dir).or_else(|_| std::fs::remove_dir_all(&view_dir));
            }
            link_view(&workspace.dir(), &view_dir);
        }
        Ok(())
    }

    /// Remove every session directory except the most recently created one.
    /// `dry_run` only reports what would be removed.
    pub fn gc(&self, dry_run: bool) -> Result<Vec<String>, CanaryError> {
        let mut entries: Vec<(String, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                let modified = entry.metadata()?.modified()?;
                entries.push((name, modified));
            }
        }
        entries.sort_by_key(|(_, m)| *m);
        let stale: Vec<String> = entries
            .iter()
            .rev()
            .skip(1)
            .map(|(name, _)| name.clone())
            .collect();
        if !dry_run {
            for name in &stale {
                std::fs::remove_dir_all(self.sessions_root.join(name))?;
            }
        }
        Ok(stale)
    }

    /// Compute the spec-id subset to re-run under a named strategy (spec.md §4.10,
    /// testable property S6): seeds matching the strategy, unioned with
    /// `downstream(seeds)` so nothing re-runs against a stale dependency, then every
    /// upstream dependency not already in that set is added back in but masked
    /// `"Skip upstream specs"` so it's present for context without being re-executed.
    pub fn rerun_subset(&self, specs: &[Arc<ResolvedSpec>], strategy: &str) -> Result<HashSet<String>, CanaryError> {
        let results = database::get_results(self.pool, &self.db_path)?;
        let mut seeds: HashSet<String> = HashSet::new();
        for spec in specs {
            let keep = match strategy {
                "all" => true,
                "failed" => results
                    .get(&spec.core.id)
                    .map(|(status, _, _)| {
                        matches!(
                            status.state,
                            crate::core::testcase::StateKind::Failed
                                | crate::core::testcase::StateKind::Diffed
                                | crate::core::testcase::StateKind::Timeout
                        )
                    })
                    .unwrap_or(true),
                "not_run" => !results.contains_key(&spec.core.id),
                "not_pass" => results
                    .get(&spec.core.id)
                    .map(|(status, _, _)| !matches!(status.state, crate::core::testcase::StateKind::Success))
                    .unwrap_or(true),
                "changed" => results
                    .get(&spec.core.id)
                    .and_then(|(_, timekeeper, _)| timekeeper.started_on.as_deref())
                    .map(|started_at| file_changed_since(&spec.core, started_at))
                    .unwrap_or(true),
                _ => return Err(CanaryError::ValidationError(format!("unknown rerun strategy: {}", strategy))),
            };
            if keep {
                seeds.insert(spec.core.id.clone());
            }
        }

        let seed_ids: Vec<String> = seeds.iter().cloned().collect();
        let downstream = database::downstream_spec_ids(self.pool, &self.db_path, &seed_ids)?;
        let mut included: HashSet<String> = seeds.union(&downstream).cloned().collect();

        let by_id: HashMap<&str, &Arc<ResolvedSpec>> =
            specs.iter().map(|s| (s.core.id.as_str(), s)).collect();
        let mut stack: Vec<String> = included.iter().cloned().collect();
        while let Some(id) = stack.pop() {
            let Some(spec) = by_id.get(id.as_str()) else { continue };
            for dep in &spec.dependencies {
                if included.insert(dep.core.id.clone()) {
                    dep.core.set_mask(Mask::masked("Skip upstream specs"));
                    stack.push(dep.core.id.clone());
                }
            }
        }
        Ok(included)
    }
}

/// `changed` strategy: the spec's source file's mtime is newer than the recorded
/// `started_on` of its last run (spec.md §4.10/"S6").
fn file_changed_since(core: &crate::core::spec::SpecCore, started_at: &str) -> bool {
    let abs = core.file_root.join(&core.file_path);
    let Ok(meta) = std::fs::metadata(&abs) else { return true };
    let Ok(modified) = meta.modified() else { return true };
    crate::core::time::format_system_time(modified).as_str() > started_at
}

fn walk(
    workspace_root: &Path,
    dir: &Path,
    registry: &GeneratorRegistry,
    out: &mut Vec<Generator>,
) -> Result<(), CanaryError> {
    let abs = if dir.is_absolute() { dir.to_path_buf() } else { workspace_root.join(dir) };
    if abs.is_file() {
        if let Ok(rel) = abs.strip_prefix(workspace_root) {
            if registry.find_for(rel).is_some() {
                out.push(Generator::new(workspace_root, rel)?);
            }
        }
        return Ok(());
    }
    if !abs.is_dir() {
        return Ok(());
    }
    let mut children: Vec<PathBuf> = std::fs::read_dir(&abs)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    children.sort();
    for child in children {
        let rel = child.strip_prefix(workspace_root).unwrap_or(&child).to_path_buf();
        walk(workspace_root, &rel, registry, out)?;
    }
    Ok(())
}

fn signature_of(generators: &[Generator]) -> String {
    let mut ids: Vec<(&str, &str)> = generators
        .iter()
        .map(|g| (g.id.as_str(), g.content_hash.as_str()))
        .collect();
    ids.sort_unstable();
    let mut hasher = Sha256::new();
    for (id, hash) in ids {
        hasher.update(id.as_bytes());
        hasher.update(hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(unix)]
fn link_view(target: &Path, link: &Path) {
    if let Some(parent) = link.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::os::unix::fs::symlink(target, link);
}

#[cfg(not(unix))]
fn link_view(target: &Path, link: &Path) {
    if let Some(parent) = link.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::create_dir_all(link);
    let _ = target;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        Workspace::create(dir.path()).unwrap();
        let ws = Workspace::load(dir.path()).unwrap();
        assert!(ws.anchor.ends_with(".canary"));
    }

    #[test]
    fn test_create_twice_errors() {
        let dir = tempfile::tempdir().unwrap();
        Workspace::create(dir.path()).unwrap();
        let err = Workspace::create(dir.path()).unwrap_err();
        assert!(matches!(err, CanaryError::AlreadyExists(_)));
    }

    #[test]
    fn test_add_discovers_canary_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.canary"), "family: a\n").unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let generators = ws.add(&[PathBuf::from(".")]).unwrap();
        assert_eq!(generators.len(), 1);
    }

    #[test]
    fn test_generate_specs_memoizes_signature() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.canary"), "family: a\n").unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let generators = ws.add(&[PathBuf::from(".")]).unwrap();
        let specs1 = ws.generate_specs(&generators).unwrap();
        let specs2 = ws.generate_specs(&generators).unwrap();
        assert_eq!(specs1.len(), specs2.len());
        assert_eq!(specs1.len(), 1);
    }

    fn make(dir: &Path, name: &str, content: &str) -> crate::core::spec::UnresolvedSpec {
        use std::io::Write;
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", content).unwrap();
        let registry = GeneratorRegistry::with_defaults();
        let config = Config::default();
        registry.generate(dir, Path::new(name), &config).unwrap().remove(0)
    }

    #[test]
    fn test_rerun_subset_failed_unions_downstream_and_masks_upstream() {
        // chain: c -> b -> a, only b's last run failed
        let dir = tempfile::tempdir().unwrap();
        let a = make(dir.path(), "a.canary", "family: a\n");
        let b_draft = make(dir.path(), "b.canary", "family: b\n");
        let c_draft = make(dir.path(), "c.canary", "family: c\n");
        let a_resolved = Arc::new(a.resolve(Vec::new(), Vec::new()));
        let b_resolved = Arc::new(b_draft.resolve(vec![a_resolved.clone()], vec!["success".to_string()]));
        let c_resolved = Arc::new(c_draft.resolve(vec![b_resolved.clone()], vec!["success".to_string()]));
        let specs = vec![a_resolved.clone(), b_resolved.clone(), c_resolved.clone()];

        let ws = Workspace::create(dir.path()).unwrap();
        database::put_specs(ws.pool, &ws.db_path, &specs, "sig").unwrap();

        let now = crate::core::time::iso_now_micros();
        let tk = crate::core::testcase::Timekeeper {
            started_on: Some(now.clone()),
            finished_on: Some(now.clone()),
            duration: Some(1.0),
        };
        let exec_space = crate::core::testcase::ExecutionSpace {
            root: dir.path().to_path_buf(),
            path: PathBuf::from("x"),
            session: "s".to_string(),
        };
        let ok = crate::core::testcase::Status::new(crate::core::testcase::StateKind::Success);
        let failed = crate::core::testcase::Status::new(crate::core::testcase::StateKind::Failed);
        database::put_results(
            ws.pool,
            &ws.db_path,
            &[
                (a_resolved.core.id.clone(), ok.clone(), tk.clone(), exec_space.clone()),
                (b_resolved.core.id.clone(), failed, tk.clone(), exec_space.clone()),
                (c_resolved.core.id.clone(), ok, tk, exec_space),
            ],
        )
        .unwrap();

        let included = ws.rerun_subset(&specs, "failed").unwrap();
        assert!(included.contains(&b_resolved.core.id), "failed seed must be included");
        assert!(included.contains(&c_resolved.core.id), "downstream of a failed seed must be included");
        assert!(included.contains(&a_resolved.core.id), "upstream dep must be added back for context");
        assert!(a_resolved.mask().is_masked());
        assert_eq!(a_resolved.mask().reason(), Some("Skip upstream specs"));
        assert!(!b_resolved.mask().is_masked());
        assert!(!c_resolved.mask().is_masked());
    }

    #[test]
    fn test_gc_keeps_only_newest_session() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        std::fs::create_dir_all(ws.sessions_root.join("2020-01-01T00-00-00.000000")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::create_dir_all(ws.sessions_root.join("2020-01-02T00-00-00.000000")).unwrap();
        let stale = ws.gc(true).unwrap();
        assert_eq!(stale, vec!["2020-01-01T00-00-00.000000".to_string()]);
    }
}
