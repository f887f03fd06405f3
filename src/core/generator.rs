//! Generator interface (C2): discovers test files and turns each into one or more
//! `UnresolvedSpec` drafts.
//!
//! Mirrors `AbstractTestGenerator` in the source (`generator.py`): a generator's own
//! identity is a 20-hex-char SHA-256 prefix of its absolute file path, distinct from
//! the full 64-hex spec ids it produces (see `core::spec`). Concrete generator *kinds*
//! are enumerated in a static registry rather than looked up through a plugin-manager
//! hook, per the redesign away from dynamic dispatch.

use crate::core::config::Config;
use crate::core::error::CanaryError;
use crate::core::spec::{
    AssetAction, DependencyPatterns, EnvModification, Expects, ParamValue, SpecInput,
    UnresolvedSpec, XStatus,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Identity and change-detection record for a single test file.
#[derive(Debug, Clone)]
pub struct Generator {
    /// 20-hex-char SHA-256 prefix of the absolute file path (spec.md §3).
    pub id: String,
    pub file_root: PathBuf,
    pub file_path: PathBuf,
    /// Full SHA-256 digest of the file's bytes, used to detect a stale generated set.
    pub content_hash: String,
}

impl Generator {
    pub fn new(file_root: &Path, file_path: &Path) -> Result<Generator, CanaryError> {
        let abs = file_root.join(file_path);
        let bytes = std::fs::read(&abs)?;
        let path_digest = Sha256::digest(abs.to_string_lossy().as_bytes());
        let id = hex::encode(path_digest)[..20].to_string();
        let content_hash = hex::encode(Sha256::digest(&bytes));
        Ok(Generator {
            id,
            file_root: file_root.to_path_buf(),
            file_path: file_path.to_path_buf(),
            content_hash,
        })
    }
}

/// A pluggable test-file-format recognizer/parser.
pub trait TestGenerator: Send + Sync {
    fn matches(&self, path: &Path) -> bool;

    /// Parse `file_root`/`file_path` into zero or more unresolved spec drafts.
    fn lock(
        &self,
        file_root: &Path,
        file_path: &Path,
        config: &Config,
    ) -> Result<Vec<UnresolvedSpec>, CanaryError>;
}

/// Ordered set of known generator kinds, consulted in registration order; the first
/// whose `matches` returns true owns a given file.
pub struct GeneratorRegistry {
    generators: Vec<Box<dyn TestGenerator>>,
}

impl GeneratorRegistry {
    pub fn with_defaults() -> Self {
        GeneratorRegistry {
            generators: vec![Box::new(CanaryFileGenerator)],
        }
    }

    pub fn register(&mut self, generator: Box<dyn TestGenerator>) {
        self.generators.push(generator);
    }

    pub fn find_for(&self, path: &Path) -> Option<&dyn TestGenerator> {
        self.generators
            .iter()
            .map(|g| g.as_ref())
            .find(|g| g.matches(path))
    }

    pub fn generate(
        &self,
        file_root: &Path,
        file_path: &Path,
        config: &Config,
    ) -> Result<Vec<UnresolvedSpec>, CanaryError> {
        match self.find_for(file_path) {
            Some(g) => g.lock(file_root, file_path, config),
            None => Ok(Vec::new()),
        }
    }
}

/// Line-oriented `.canary` test-file format. One of the minimal connective-tissue
/// formats needed to exercise the pipeline end to end; individual test-format parsing
/// beyond this is explicitly out of scope.
///
/// ```text
/// family: mpi_send
/// keywords: fast, mpi
/// owners: alice
/// timeout: 30
/// exclusive: false
/// xstatus: 0
/// parameters: np=2,4
/// depends: setup.* [+]
/// asset: data/input.txt
/// ```
pub struct CanaryFileGenerator;

impl TestGenerator for CanaryFileGenerator {
    fn matches(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("canary")
    }

    fn lock(
        &self,
        file_root: &Path,
        file_path: &Path,
        config: &Config,
    ) -> Result<Vec<UnresolvedSpec>, CanaryError> {
        let abs = file_root.join(file_path);
        let text = std::fs::read_to_string(&abs)?;

        let mut family: Option<String> = None;
        let mut keywords: Vec<String> = Vec::new();
        let mut owners: Vec<String> = Vec::new();
        let mut timeout_override: Option<f64> = None;
        let mut exclusive = false;
        let mut xstatus = XStatus::Normal;
        let mut dep_patterns: Vec<DependencyPatterns> = Vec::new();
        let mut raw_assets: Vec<(PathBuf, Option<String>, AssetAction)> = Vec::new();
        let mut param_sets: Vec<(String, Vec<ParamValue>)> = Vec::new();
        let environment: BTreeMap<String, String> = BTreeMap::new();
        let environment_modifications: Vec<EnvModification> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "family" => family = Some(value.to_string()),
                "keywords" => keywords.extend(value.split(',').map(|s| s.trim().to_string())),
                "owners" => owners.extend(value.split(',').map(|s| s.trim().to_string())),
                "timeout" => {
                    timeout_override = Some(value.parse::<f64>().map_err(|_| {
                        CanaryError::ValidationError(format!("invalid timeout: {}", value))
                    })?)
                }
                "exclusive" => exclusive = value.eq_ignore_ascii_case("true"),
                "xstatus" => {
                    xstatus = match value {
                        "any" | "any-nonzero" => XStatus::AnyNonZero,
                        "diff" => XStatus::DiffCode,
                        n => XStatus::Exact(n.parse::<i32>().map_err(|_| {
                            CanaryError::ValidationError(format!("invalid xstatus: {}", value))
                        })?),
                    }
                }
                "parameters" => {
                    for clause in value.split(';') {
                        let clause = clause.trim();
                        if clause.is_empty() {
                            continue;
                        }
                        let Some((name, values)) = clause.split_once('=') else {
                            return Err(CanaryError::ValidationError(format!(
                                "malformed parameters clause: {}",
                                clause
                            )));
                        };
                        let values: Vec<ParamValue> = values
                            .split(',')
                            .map(|v| parse_param_value(v.trim()))
                            .collect();
                        param_sets.push((name.trim().to_string(), values));
                    }
                }
                "depends" => {
                    let (pattern_part, expects) = split_expects(value);
                    dep_patterns.push(DependencyPatterns::new(
                        vec![pattern_part.to_string()],
                        expects,
                        "success",
                    ));
                }
                "asset" => {
                    let (src, dst, action) = parse_asset(value);
                    raw_assets.push((src, dst, action));
                }
                _ => {}
            }
        }

        let family = family.unwrap_or_else(|| {
            file_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        let combos = cartesian_product(&param_sets);
        let mut specs = Vec::with_capacity(combos.len().max(1));
        for combo in if combos.is_empty() {
            vec![BTreeMap::new()]
        } else {
            combos
        } {
            let input = SpecInput {
                file_root: file_root.to_path_buf(),
                file_path: file_path.to_path_buf(),
                family: Some(family.clone()),
                parameters: combo,
                keywords: keywords.clone(),
                owners: owners.clone(),
                timeout_override,
                xstatus,
                preload: Vec::new(),
                modules: Vec::new(),
                rcfiles: Vec::new(),
                artifacts: Vec::new(),
                exclusive,
                environment: environment.clone(),
                environment_modifications: environment_modifications.clone(),
                raw_assets: raw_assets.clone(),
                attributes: Default::default(),
            };
            specs.push(UnresolvedSpec::new(input, dep_patterns.clone(), config)?);
        }
        Ok(specs)
    }
}

fn parse_param_value(raw: &str) -> ParamValue {
    if let Ok(i) = raw.parse::<i64>() {
        ParamValue::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        ParamValue::Float(f)
    } else if raw == "true" || raw == "false" {
        ParamValue::Bool(raw == "true")
    } else {
        ParamValue::Str(raw.to_string())
    }
}

fn split_expects(value: &str) -> (&str, Expects) {
    if let Some(start) = value.rfind('[') {
        if let Some(end) = value.rfind(']') {
            if end > start {
                let pattern = value[..start].trim();
                let spec = value[start + 1..end].trim();
                return (pattern, Expects::parse(spec));
            }
        }
    }
    (value.trim(), Expects::AtLeastOne)
}

fn parse_asset(value: &str) -> (PathBuf, Option<String>, AssetAction) {
    let parts: Vec<&str> = value.split(':').collect();
    let src = PathBuf::from(parts.first().copied().unwrap_or(""));
    let dst = parts.get(1).filter(|s| !s.is_empty()).map(|s| s.to_string());
    let action = match parts.get(2).copied() {
        Some("link") => AssetAction::Link,
        Some("none") => AssetAction::None,
        _ => AssetAction::Copy,
    };
    (src, dst, action)
}

fn cartesian_product(param_sets: &[(String, Vec<ParamValue>)]) -> Vec<BTreeMap<String, ParamValue>> {
    let mut acc: Vec<BTreeMap<String, ParamValue>> = vec![BTreeMap::new()];
    for (name, values) in param_sets {
        let mut next = Vec::with_capacity(acc.len() * values.len());
        for base in &acc {
            for v in values {
                let mut m = base.clone();
                m.insert(name.clone(), v.clone());
                next.push(m);
            }
        }
        acc = next;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_generator_id_is_20_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.canary");
        std::fs::write(&path, "family: a\n").unwrap();
        let g = Generator::new(dir.path(), Path::new("a.canary")).unwrap();
        assert_eq!(g.id.len(), 20);
    }

    #[test]
    fn test_parses_basic_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.canary");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "family: smoke").unwrap();
        writeln!(f, "keywords: fast, quick").unwrap();
        writeln!(f, "timeout: 12.5").unwrap();
        drop(f);

        let reg = GeneratorRegistry::with_defaults();
        let cfg = Config::default();
        let specs = reg
            .generate(dir.path(), Path::new("t.canary"), &cfg)
            .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].core.family, "smoke");
        assert!(specs[0].core.keywords.contains(&"fast".to_string()));
        assert_eq!(specs[0].core.timeout, 12.5);
    }

    #[test]
    fn test_parameters_expand_cartesian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.canary");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "family: p").unwrap();
        writeln!(f, "parameters: np=2,4; mode=sync,async").unwrap();
        drop(f);

        let reg = GeneratorRegistry::with_defaults();
        let cfg = Config::default();
        let specs = reg.generate(dir.path(), Path::new("p.canary"), &cfg).unwrap();
        assert_eq!(specs.len(), 4);
    }

    #[test]
    fn test_depends_with_expects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.canary");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "family: d").unwrap();
        writeln!(f, "depends: setup.* [?]").unwrap();
        drop(f);

        let reg = GeneratorRegistry::with_defaults();
        let cfg = Config::default();
        let specs = reg.generate(dir.path(), Path::new("d.canary"), &cfg).unwrap();
        assert_eq!(specs[0].dep_patterns.len(), 1);
        assert_eq!(specs[0].dep_patterns[0].expects, Expects::AtMostOne);
    }

    #[test]
    fn test_unmatched_extension_yields_nothing() {
        let reg = GeneratorRegistry::with_defaults();
        assert!(reg.find_for(Path::new("readme.md")).is_none());
    }
}
