//! Spec model (C1): `UnresolvedSpec`, `ResolvedSpec`, `DependencyPatterns`, `Asset`,
//! `Mask` — the immutable-after-resolution data model for a test case, with stable
//! content-addressed IDs.

use crate::core::config::Config;
use crate::core::error::CanaryError;
use crate::core::resource::ResourcePool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Sigil that selects a spec by ID prefix in a pathspec (`/HEXPREFIX`).
pub const SELECT_SIGIL: char = '/';

/// A non-fatal exclusion flag on a spec carrying a human-readable reason.
///
/// Invariant: `value == reason.is_some()`. The only way to construct a `Mask` is
/// through [`Mask::unmasked`] / [`Mask::masked`], which keep that invariant by
/// construction rather than by runtime assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    value: bool,
    reason: Option<String>,
}

impl Mask {
    pub fn unmasked() -> Self {
        Mask {
            value: false,
            reason: None,
        }
    }

    pub fn masked(reason: impl Into<String>) -> Self {
        Mask {
            value: true,
            reason: Some(reason.into()),
        }
    }

    pub fn is_masked(&self) -> bool {
        self.value
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl Default for Mask {
    fn default() -> Self {
        Mask::unmasked()
    }
}

/// Scalar parameter value. Floats are hashed with `%.16e`-equivalent canonical
/// formatting so that `1.0` and `1.00` always hash identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    /// Canonical string form used both for `display_name` and for ID hashing.
    pub fn stringify(&self) -> String {
        match self {
            ParamValue::Str(s) => s.clone(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Float(f) => format!("{:.16e}", f),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stringify())
    }
}

/// Expected exit-code policy for a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XStatus {
    Normal,
    AnyNonZero,
    Exact(i32),
    DiffCode,
}

/// Environment-modification operation applied, in order, before a case is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvOp {
    Set,
    Unset,
    PrependPath,
    AppendPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvModification {
    pub name: String,
    pub op: EnvOp,
    pub value: Option<String>,
    pub sep: String,
}

/// How an asset is materialized into a case's workspace directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetAction {
    Copy,
    Link,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub src: PathBuf,
    pub dst: String,
    pub action: AssetAction,
}

/// Arity a `DependencyPatterns` entry expects its resolved matches to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expects {
    AtLeastOne,
    AtMostOne,
    Exactly(usize),
}

impl Expects {
    pub fn parse(s: &str) -> Expects {
        match s {
            "+" => Expects::AtLeastOne,
            "?" => Expects::AtMostOne,
            n => n.parse::<usize>().map(Expects::Exactly).unwrap_or(Expects::AtLeastOne),
        }
    }

    pub fn satisfied_by(&self, count: usize) -> bool {
        match self {
            Expects::AtLeastOne => count >= 1,
            Expects::AtMostOne => count <= 1,
            Expects::Exactly(n) => count == *n,
        }
    }
}

/// A glob plus arity/outcome specifier that resolves against peer specs during the
/// build phase (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyPatterns {
    pub patterns: Vec<String>,
    pub expects: Expects,
    pub result_match: String,
    pub resolves_to: Vec<String>,
}

impl DependencyPatterns {
    pub fn new(patterns: Vec<String>, expects: Expects, result_match: impl Into<String>) -> Self {
        DependencyPatterns {
            patterns,
            expects,
            result_match: result_match.into(),
            resolves_to: Vec::new(),
        }
    }

    pub fn update(&mut self, ids: impl IntoIterator<Item = String>) {
        self.resolves_to.extend(ids);
    }

    /// Arity check; returns a diagnostic string on failure.
    pub fn verify(&self) -> Result<(), String> {
        if self.expects.satisfied_by(self.resolves_to.len()) {
            Ok(())
        } else {
            Err(format!(
                "dependency pattern {:?} expected {:?} matches, found {}",
                self.patterns,
                self.expects,
                self.resolves_to.len()
            ))
        }
    }
}

/// Fields shared by `UnresolvedSpec` and `ResolvedSpec`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpecCore {
    pub file_root: PathBuf,
    pub file_path: PathBuf,
    pub family: String,
    pub id: String,
    pub name: String,
    pub parameters: BTreeMap<String, ParamValue>,
    pub stdout: String,
    pub stderr: Option<String>,
    pub keywords: Vec<String>,
    pub owners: Vec<String>,
    pub timeout: f64,
    pub xstatus: XStatus,
    pub preload: Vec<String>,
    pub modules: Vec<String>,
    pub rcfiles: Vec<PathBuf>,
    pub artifacts: Vec<String>,
    pub exclusive: bool,
    pub environment: BTreeMap<String, String>,
    pub environment_modifications: Vec<EnvModification>,
    pub assets: Vec<Asset>,
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(skip, default = "default_mask_cell")]
    mask_value: Mutex<Mask>,
}

fn default_mask_cell() -> Mutex<Mask> {
    Mutex::new(Mask::unmasked())
}

/// Input to [`SpecCore::new`]; mirrors the keyword-argument surface of the source
/// dataclass constructor.
pub struct SpecInput {
    pub file_root: PathBuf,
    pub file_path: PathBuf,
    pub family: Option<String>,
    pub parameters: BTreeMap<String, ParamValue>,
    pub keywords: Vec<String>,
    pub owners: Vec<String>,
    pub timeout_override: Option<f64>,
    pub xstatus: XStatus,
    pub preload: Vec<String>,
    pub modules: Vec<String>,
    pub rcfiles: Vec<PathBuf>,
    pub artifacts: Vec<String>,
    pub exclusive: bool,
    pub environment: BTreeMap<String, String>,
    pub environment_modifications: Vec<EnvModification>,
    pub raw_assets: Vec<(PathBuf, Option<String>, AssetAction)>,
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Default for SpecInput {
    fn default() -> Self {
        SpecInput {
            file_root: PathBuf::new(),
            file_path: PathBuf::new(),
            family: None,
            parameters: BTreeMap::new(),
            keywords: Vec::new(),
            owners: Vec::new(),
            timeout_override: None,
            xstatus: XStatus::Normal,
            preload: Vec::new(),
            modules: Vec::new(),
            rcfiles: Vec::new(),
            artifacts: Vec::new(),
            exclusive: false,
            environment: BTreeMap::new(),
            environment_modifications: Vec::new(),
            raw_assets: Vec::new(),
            attributes: HashMap::new(),
        }
    }
}

impl SpecCore {
    pub fn new(input: SpecInput, config: &Config) -> Result<SpecCore, CanaryError> {
        let family = input.family.unwrap_or_else(|| {
            input
                .file_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let name = derive_name(&family, &input.parameters);
        let abs_file = input.file_root.join(&input.file_path);
        let file_bytes = std::fs::read(&abs_file)?;
        let path_component = vcs_anchored_path(&abs_file, &input.file_path, &name);
        let id = generate_default_id(&name, &input.parameters, &file_bytes, &path_component);

        let assets = input
            .raw_assets
            .into_iter()
            .map(|(src, dst, action)| {
                let resolved_src = if src.is_relative() {
                    abs_file
                        .parent()
                        .map(|p| p.join(&src))
                        .unwrap_or(src.clone())
                } else {
                    src.clone()
                };
                let dst = dst.unwrap_or_else(|| {
                    src.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default()
                });
                Asset {
                    src: resolved_src,
                    dst,
                    action,
                }
            })
            .collect();

        let timeout = config
            .timeout
            .resolve(&input.keywords, input.timeout_override);

        Ok(SpecCore {
            file_root: input.file_root,
            file_path: input.file_path,
            family,
            id,
            name,
            parameters: input.parameters,
            stdout: "canary-out.txt".to_string(),
            stderr: None,
            keywords: input.keywords,
            owners: input.owners,
            timeout,
            xstatus: input.xstatus,
            preload: input.preload,
            modules: input.modules,
            rcfiles: input.rcfiles,
            artifacts: input.artifacts,
            exclusive: input.exclusive,
            environment: input.environment,
            environment_modifications: input.environment_modifications,
            assets,
            attributes: input.attributes,
            mask_value: default_mask_cell(),
        })
    }

    pub fn mask(&self) -> Mask {
        self.mask_value.lock().unwrap().clone()
    }

    pub fn set_mask(&self, mask: Mask) {
        *self.mask_value.lock().unwrap() = mask;
    }

    pub fn fullname(&self) -> &str {
        &self.name
    }

    /// `{id, name, family, str(file_path)}` — always implicit, even without explicit
    /// keyword rules.
    pub fn implicit_keywords(&self) -> HashSet<String> {
        let mut set = HashSet::new();
        set.insert(self.id.clone());
        set.insert(self.name.clone());
        set.insert(self.family.clone());
        set.insert(self.file_path.to_string_lossy().to_string());
        set
    }

    /// Derived parameters every spec carries implicitly: `cpus`, `gpus`, `runtime`,
    /// defaulting from the spec's own attributes unless already present.
    pub fn implicit_parameters(&self) -> BTreeMap<String, ParamValue> {
        let mut map = BTreeMap::new();
        map.insert(
            "cpus".to_string(),
            self.parameters
                .get("cpus")
                .cloned()
                .unwrap_or(ParamValue::Int(1)),
        );
        map.insert(
            "gpus".to_string(),
            self.parameters
                .get("gpus")
                .cloned()
                .unwrap_or(ParamValue::Int(0)),
        );
        map.insert(
            "runtime".to_string(),
            self.parameters
                .get("runtime")
                .cloned()
                .unwrap_or(ParamValue::Float(self.timeout)),
        );
        map
    }

    pub fn cpus(&self) -> i64 {
        self.implicit_parameters()
            .get("cpus")
            .and_then(|v| v.as_i64())
            .unwrap_or(1)
    }

    pub fn gpus(&self) -> i64 {
        self.implicit_parameters()
            .get("gpus")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// `required_resources`: a disjunction of one conjunctive group derived from
    /// parameters whose name matches a pool resource type. The `nodes` parameter
    /// expands to per-node `cpu`/`gpu` requirements via `pool.pinfo()` rather than
    /// asking the pool for a `node` type it never registers (spec.md §4.3).
    pub fn required_resources(&self, pool: &ResourcePool) -> Vec<Vec<(String, u32)>> {
        let mut group = Vec::new();
        if let Some(nodes) = self.parameters.get("nodes").and_then(|v| v.as_i64()) {
            if nodes > 0 {
                for (resource, key) in [("cpu", "cpus_per_node"), ("gpu", "gpus_per_node")] {
                    if let Some(per_node) = pool.pinfo(key) {
                        let total = nodes as u32 * per_node;
                        if total > 0 {
                            group.push((resource.to_string(), total));
                        }
                    }
                }
                return vec![group];
            }
        }
        for ty in ["cpus", "gpus"] {
            if let Some(v) = self.parameters.get(ty).and_then(|v| v.as_i64()) {
                if v > 0 {
                    group.push((ty.trim_end_matches('s').to_string(), v as u32));
                }
            }
        }
        if group.is_empty() {
            group.push(("cpu".to_string(), 1));
        }
        vec![group]
    }

    /// Sorted `key=value` parameter parts joined by `sep`.
    pub fn s_params(&self, sep: &str) -> String {
        self.parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.stringify()))
            .collect::<Vec<_>>()
            .join(sep)
    }

    pub fn display_name(&self) -> String {
        let params = self.s_params(".");
        if params.is_empty() {
            self.family.clone()
        } else {
            format!("{}.{}", self.family, params)
        }
    }

    pub(crate) fn match_names(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.family.clone(),
            self.fullname().to_string(),
            self.display_name(),
            self.file_path.to_string_lossy().to_string(),
            self.file_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(self.display_name())
                .to_string_lossy()
                .to_string(),
        ]
    }

    /// Matches `pattern` against the spec's family of identifying names, either
    /// exactly or as a case-sensitive glob. A leading `/` selects by ID prefix.
    pub fn matches(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_prefix(SELECT_SIGIL) {
            return self.id.starts_with(prefix);
        }
        for candidate in self.match_names() {
            if candidate == pattern {
                return true;
            }
            if let Ok(glob) = glob::Pattern::new(pattern) {
                if glob.matches(&candidate) {
                    return true;
                }
            }
        }
        false
    }
}

fn derive_name(family: &str, parameters: &BTreeMap<String, ParamValue>) -> String {
    if parameters.is_empty() {
        return family.to_string();
    }
    let params = parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.stringify()))
        .collect::<Vec<_>>()
        .join(".");
    format!("{}.{}", family, params)
}

/// Walk up from `abs_file` looking for a `.git` or `.repo` ancestor; if found, return
/// the file's path relative to that ancestor, else fall back to
/// `file_path.parent() / name`.
fn vcs_anchored_path(abs_file: &Path, file_path: &Path, name: &str) -> String {
    let mut dir = abs_file.parent();
    while let Some(d) = dir {
        if d.join(".git").exists() || d.join(".repo").exists() {
            if let Ok(rel) = abs_file.strip_prefix(d) {
                return rel.to_string_lossy().to_string();
            }
        }
        dir = d.parent();
    }
    file_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(name)
        .to_string_lossy()
        .to_string()
}

/// SHA-256 over `name`, each sorted `k=v` parameter (canonical float formatting),
/// the raw test-file bytes, and the VCS-anchored relative path. Emitted as the full
/// 64-character lower-hex digest (see `DESIGN.md` for why this departs from
/// `spec.md`'s "20 hex chars" wording for specs specifically).
pub fn generate_default_id(
    name: &str,
    parameters: &BTreeMap<String, ParamValue>,
    file_bytes: &[u8],
    path_component: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for (k, v) in parameters {
        hasher.update(format!("{}={}", k, v.stringify()).as_bytes());
    }
    hasher.update(file_bytes);
    hasher.update(path_component.as_bytes());
    hex::encode(hasher.finalize())
}

/// A test case candidate before dependency links are bound.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnresolvedSpec {
    pub core: SpecCore,
    pub dep_patterns: Vec<DependencyPatterns>,
}

impl UnresolvedSpec {
    pub fn new(
        input: SpecInput,
        dep_patterns: Vec<DependencyPatterns>,
        config: &Config,
    ) -> Result<UnresolvedSpec, CanaryError> {
        let core = SpecCore::new(input, config)?;
        let dep_patterns = substitute_templates(dep_patterns, &core.parameters);
        Ok(UnresolvedSpec { core, dep_patterns })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Consume this draft plus its resolved dependency ids/criteria into a
    /// `ResolvedSpec`, per the builder's topological-finalize step (§4.3 step 5).
    pub fn resolve(
        self,
        dependencies: Vec<Arc<ResolvedSpec>>,
        dep_done_criteria: Vec<String>,
    ) -> ResolvedSpec {
        ResolvedSpec {
            core: self.core,
            dependencies,
            dep_done_criteria,
        }
    }
}

/// Apply `$var` / `${var}` substitution of the spec's own stringified parameters into
/// each dependency pattern string (`_generate_dependency_patterns` in the source).
fn substitute_templates(
    dep_patterns: Vec<DependencyPatterns>,
    parameters: &BTreeMap<String, ParamValue>,
) -> Vec<DependencyPatterns> {
    dep_patterns
        .into_iter()
        .map(|mut dp| {
            dp.patterns = dp
                .patterns
                .iter()
                .map(|p| substitute_one(p, parameters))
                .collect();
            dp
        })
        .collect()
}

fn substitute_one(pattern: &str, parameters: &BTreeMap<String, ParamValue>) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    break;
                }
                name.push(c2);
            }
            match parameters.get(&name) {
                Some(v) => out.push_str(&v.stringify()),
                None => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            let mut name = String::new();
            while let Some(&c2) = chars.peek() {
                if c2.is_alphanumeric() || c2 == '_' {
                    name.push(c2);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
            } else {
                match parameters.get(&name) {
                    Some(v) => out.push_str(&v.stringify()),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
        }
    }
    out
}

/// A resolved test case: dependency patterns have been bound to concrete peer specs.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResolvedSpec {
    pub core: SpecCore,
    pub dependencies: Vec<Arc<ResolvedSpec>>,
    pub dep_done_criteria: Vec<String>,
}

impl ResolvedSpec {
    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn display_name(&self) -> String {
        self.core.display_name()
    }

    pub fn mask(&self) -> Mask {
        self.core.mask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_mask_invariant() {
        let m = Mask::masked("slow");
        assert!(m.is_masked());
        assert_eq!(m.reason(), Some("slow"));
        let u = Mask::unmasked();
        assert!(!u.is_masked());
        assert_eq!(u.reason(), None);
    }

    #[test]
    fn test_id_deterministic() {
        let mut params = BTreeMap::new();
        params.insert("np".to_string(), ParamValue::Int(2));
        let id1 = generate_default_id("foo", &params, b"bytes", "path/foo.test");
        let id2 = generate_default_id("foo", &params, b"bytes", "path/foo.test");
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
    }

    #[test]
    fn test_id_changes_with_parameters() {
        let mut p1 = BTreeMap::new();
        p1.insert("np".to_string(), ParamValue::Int(2));
        let mut p2 = BTreeMap::new();
        p2.insert("np".to_string(), ParamValue::Int(4));
        let id1 = generate_default_id("foo", &p1, b"bytes", "p");
        let id2 = generate_default_id("foo", &p2, b"bytes", "p");
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_required_resources_expands_nodes_via_pinfo() {
        let pool = ResourcePool::new();
        pool.add_type("cpu", 8, 1, 0);
        pool.add_type("gpu", 2, 1, 0);
        let config = Config::default();
        let mut params = BTreeMap::new();
        params.insert("nodes".to_string(), ParamValue::Int(2));
        let input = SpecInput {
            parameters: params,
            ..SpecInput::default()
        };
        let core = SpecCore::new(input, &config).unwrap();
        let required = core.required_resources(&pool);
        assert_eq!(required, vec![vec![("cpu".to_string(), 16), ("gpu".to_string(), 4)]]);
    }

    #[test]
    fn test_float_stringify_scientific() {
        let v = ParamValue::Float(1.5);
        assert!(v.stringify().contains('e'));
    }

    #[test]
    fn test_substitute_template() {
        let mut params = BTreeMap::new();
        params.insert("np".to_string(), ParamValue::Int(4));
        let dp = vec![DependencyPatterns::new(
            vec!["setup.np=$np".to_string()],
            Expects::AtLeastOne,
            "success",
        )];
        let out = substitute_templates(dp, &params);
        assert_eq!(out[0].patterns[0], "setup.np=4");
    }

    #[test]
    fn test_expects_satisfied() {
        assert!(Expects::AtLeastOne.satisfied_by(3));
        assert!(!Expects::AtLeastOne.satisfied_by(0));
        assert!(Expects::AtMostOne.satisfied_by(1));
        assert!(!Expects::AtMostOne.satisfied_by(2));
        assert!(Expects::Exactly(2).satisfied_by(2));
        assert!(!Expects::Exactly(2).satisfied_by(3));
    }

    #[test]
    fn test_display_name_with_params() {
        let mut params = BTreeMap::new();
        params.insert("np".to_string(), ParamValue::Int(2));
        let name = derive_name("foo", &params);
        assert_eq!(name, "foo.np=2");
    }
}
