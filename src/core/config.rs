//! Immutable run configuration.
//!
//! Replaces the source implementation's process-wide `config` singleton (spec §9's
//! redesign flag on global mutable state) with a value built once per invocation from
//! CLI flags plus an optional `canary.toml`, then threaded explicitly through the
//! builder, selector, and scheduler.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Per-keyword timeout overrides plus the `timeout:all` / `timeout:default` fallbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub by_keyword: HashMap<String, f64>,
    pub all: Option<f64>,
    pub default: f64,
}

impl TimeoutConfig {
    /// Cascade: CLI per-keyword override -> config per-keyword -> `timeout:all` ->
    /// `timeout:default`.
    pub fn resolve(&self, keywords: &[String], cli_override: Option<f64>) -> f64 {
        if let Some(t) = cli_override {
            return t;
        }
        for kw in keywords {
            if let Some(t) = self.by_keyword.get(kw) {
                return *t;
            }
        }
        if let Some(t) = self.all {
            return t;
        }
        self.default
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            by_keyword: HashMap::new(),
            all: None,
            default: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub timeout: TimeoutConfig,
    /// Sentinel exit code meaning "expected diff" for `xstatus`.
    pub diff_code: i32,
    pub skip_code: i32,
    pub timeout_code: i32,
    /// Multiplier applied to a case's timeout before the executor kills it.
    pub timeout_multiplier: f64,
    /// Force the serial dependency-resolution path in the builder.
    pub serial_spec_resolution: bool,
    /// Use the `$VAR`-style runpy launcher instead of a subprocess launcher.
    pub use_runpy_launcher: bool,
    pub copy_all_resources: bool,
    pub color_when: ColorWhen,
    pub debug: bool,
    /// Stop dispatching new cases once one reaches a failing terminal state.
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorWhen {
    Always,
    Never,
    Auto,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: TimeoutConfig::default(),
            diff_code: 64,
            skip_code: 63,
            timeout_code: 2,
            timeout_multiplier: 1.0,
            serial_spec_resolution: std::env::var("CANARY_SERIAL_SPEC_RESOLUTION").is_ok(),
            use_runpy_launcher: std::env::var("CANARY_USE_RUNPY_LAUNCHER").is_ok(),
            copy_all_resources: false,
            color_when: ColorWhen::Auto,
            debug: false,
            fail_fast: false,
        }
    }
}

impl Config {
    /// Load `canary.toml` from `dir` if present, overlaying it onto defaults.
    pub fn load(dir: &Path) -> Result<Config, crate::core::error::CanaryError> {
        let mut cfg = Config::default();
        let path = dir.join("canary.toml");
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let file: ConfigFile = toml::from_str(&text)
                .map_err(|e| crate::core::error::CanaryError::ValidationError(e.to_string()))?;
            if let Some(t) = file.timeout {
                cfg.timeout = t;
            }
            if let Some(m) = file.timeout_multiplier {
                cfg.timeout_multiplier = m;
            }
        }
        Ok(cfg)
    }

    pub fn snapshot_path(session_root: &Path) -> PathBuf {
        session_root.join("config")
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    timeout: Option<TimeoutConfig>,
    timeout_multiplier: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_cascade_default() {
        let cfg = TimeoutConfig::default();
        assert_eq!(cfg.resolve(&[], None), 60.0);
    }

    #[test]
    fn test_timeout_cascade_cli_override_wins() {
        let cfg = TimeoutConfig::default();
        assert_eq!(cfg.resolve(&["slow".into()], Some(5.0)), 5.0);
    }

    #[test]
    fn test_timeout_cascade_by_keyword() {
        let mut cfg = TimeoutConfig::default();
        cfg.by_keyword.insert("slow".into(), 300.0);
        assert_eq!(cfg.resolve(&["slow".into()], None), 300.0);
    }

    #[test]
    fn test_timeout_cascade_all_before_default() {
        let mut cfg = TimeoutConfig::default();
        cfg.all = Some(120.0);
        assert_eq!(cfg.resolve(&["fast".into()], None), 120.0);
    }
}
