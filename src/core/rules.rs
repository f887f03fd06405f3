//! Rule / Selector rule catalog (C4): the predicate chain applied to every
//! `ResolvedSpec` during a selection pass.

use crate::core::keywordexpr;
use crate::core::resource::ResourcePool;
use crate::core::spec::ResolvedSpec;
use regex::Regex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        RuleOutcome {
            ok: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        RuleOutcome {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// A selection predicate. Evaluation is pure and must never suspend: the pool is
/// consulted for capacity only, never acquired from within a rule.
pub trait Rule: Send + Sync {
    fn evaluate(&self, spec: &ResolvedSpec, pool: &ResourcePool) -> RuleOutcome;

    fn default_reason(&self) -> String;

    fn describe(&self) -> serde_json::Value;
}

const BYPASS_TOKENS: [&str; 2] = ["__all__", ":all:"];

/// All of `exprs` must match `spec.keywords ∪ spec.implicit_keywords`.
pub struct KeywordRule {
    pub exprs: Vec<String>,
}

impl Rule for KeywordRule {
    fn evaluate(&self, spec: &ResolvedSpec, _pool: &ResourcePool) -> RuleOutcome {
        if self.exprs.iter().any(|e| BYPASS_TOKENS.contains(&e.as_str())) {
            return RuleOutcome::pass();
        }
        let mut keywords: HashSet<String> = spec.core.keywords.iter().cloned().collect();
        keywords.extend(spec.core.implicit_keywords());

        for expr in &self.exprs {
            match keywordexpr::parse(expr) {
                Ok(parsed) => {
                    if !parsed.eval(&keywords) {
                        return RuleOutcome::fail(self.default_reason());
                    }
                }
                Err(e) => return RuleOutcome::fail(format!("KeywordRule({})", e)),
            }
        }
        RuleOutcome::pass()
    }

    fn default_reason(&self) -> String {
        "keyword expression".to_string()
    }

    fn describe(&self) -> serde_json::Value {
        json!({"rule": "KeywordRule", "exprs": self.exprs})
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

#[derive(Debug, Clone)]
enum ParamExpr {
    Cmp {
        name: String,
        op: CmpOp,
        value: String,
    },
    Not(Box<ParamExpr>),
    And(Box<ParamExpr>, Box<ParamExpr>),
    Or(Box<ParamExpr>, Box<ParamExpr>),
}

impl ParamExpr {
    fn eval(&self, params: &HashMap<String, String>) -> bool {
        match self {
            ParamExpr::Cmp { name, op, value } => match params.get(name) {
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
            ParamExpr::Not(e) => !e.eval(params),
            ParamExpr::And(l, r) => l.eval(params) && r.eval(params),
            ParamExpr::Or(l, r) => l.eval(params) || r.eval(params),
        }
    }
}

fn compare(actual: &str, op: CmpOp, expected: &str) -> bool {
    if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Ge => a >= b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Lt => a < b,
        };
    }
    match op {
        CmpOp::Eq => actual == expected,
        CmpOp::Ne => actual != expected,
        CmpOp::Ge => actual >= expected,
        CmpOp::Le => actual <= expected,
        CmpOp::Gt => actual > expected,
        CmpOp::Lt => actual < expected,
    }
}

fn parse_param_expr(expr: &str) -> Result<ParamExpr, String> {
    let token_re = Regex::new(
        r#"\(|\)|\band\b|\bor\b|\bnot\b|[A-Za-z_][A-Za-z0-9_]*\s*(?:==|!=|>=|<=|>|<)\s*(?:"[^"]*"|'[^']*'|[^\s()]+)"#,
    )
    .unwrap();
    let cmp_re = Regex::new(r#"^([A-Za-z_][A-Za-z0-9_]*)\s*(==|!=|>=|<=|>|<)\s*(.+)$"#).unwrap();

    #[derive(Debug, Clone)]
    enum Tok {
        And,
        Or,
        Not,
        LParen,
        RParen,
        Cmp(String, CmpOp, String),
    }

    let mut tokens = Vec::new();
    for m in token_re.find_iter(expr) {
        let text = m.as_str();
        let tok = match text {
            "and" => Tok::And,
            "or" => Tok::Or,
            "not" => Tok::Not,
            "(" => Tok::LParen,
            ")" => Tok::RParen,
            _ => {
                let caps = cmp_re
                    .captures(text.trim())
                    .ok_or_else(|| format!("malformed comparison: {}", text))?;
                let op = match &caps[2] {
                    "==" => CmpOp::Eq,
                    "!=" => CmpOp::Ne,
                    ">=" => CmpOp::Ge,
                    "<=" => CmpOp::Le,
                    ">" => CmpOp::Gt,
                    "<" => CmpOp::Lt,
                    _ => unreachable!(),
                };
                let value = caps[3].trim().trim_matches('"').trim_matches('\'').to_string();
                Tok::Cmp(caps[1].to_string(), op, value)
            }
        };
        tokens.push(tok);
    }
    if tokens.is_empty() {
        return Err("empty parameter expression".to_string());
    }

    struct P {
        tokens: Vec<Tok>,
        pos: usize,
    }
    impl P {
        fn peek(&self) -> Option<&Tok> {
            self.tokens.get(self.pos)
        }
        fn next(&mut self) -> Option<Tok> {
            let t = self.tokens.get(self.pos).cloned();
            self.pos += 1;
            t
        }
        fn expr(&mut self) -> Result<ParamExpr, String> {
            let mut lhs = self.term()?;
            while matches!(self.peek(), Some(Tok::Or)) {
                self.next();
                let rhs = self.term()?;
                lhs = ParamExpr::Or(Box::new(lhs), Box::new(rhs));
            }
            Ok(lhs)
        }
        fn term(&mut self) -> Result<ParamExpr, String> {
            let mut lhs = self.factor()?;
            while matches!(self.peek(), Some(Tok::And)) {
                self.next();
                let rhs = self.factor()?;
                lhs = ParamExpr::And(Box::new(lhs), Box::new(rhs));
            }
            Ok(lhs)
        }
        fn factor(&mut self) -> Result<ParamExpr, String> {
            match self.next() {
                Some(Tok::Not) => Ok(ParamExpr::Not(Box::new(self.factor()?))),
                Some(Tok::LParen) => {
                    let inner = self.expr()?;
                    match self.next() {
                        Some(Tok::RParen) => Ok(inner),
                        _ => Err("unbalanced parentheses".to_string()),
                    }
                }
                Some(Tok::Cmp(name, op, value)) => Ok(ParamExpr::Cmp { name, op, value }),
                other => Err(format!("unexpected token: {:?}", other)),
            }
        }
    }

    impl Clone for Tok {
        fn clone(&self) -> Self {
            match self {
                Tok::And => Tok::And,
                Tok::Or => Tok::Or,
                Tok::Not => Tok::Not,
                Tok::LParen => Tok::LParen,
                Tok::RParen => Tok::RParen,
                Tok::Cmp(n, o, v) => Tok::Cmp(n.clone(), *o, v.clone()),
            }
        }
    }

    let mut parser = P { tokens, pos: 0 };
    parser.expr()
}

pub struct ParameterRule {
    pub expr: String,
}

impl Rule for ParameterRule {
    fn evaluate(&self, spec: &ResolvedSpec, _pool: &ResourcePool) -> RuleOutcome {
        let mut params: HashMap<String, String> = spec
            .core
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.stringify()))
            .collect();
        for (k, v) in spec.core.implicit_parameters() {
            params.entry(k).or_insert_with(|| v.stringify());
        }
        match parse_param_expr(&self.expr) {
            Ok(parsed) => {
                if parsed.eval(&params) {
                    RuleOutcome::pass()
                } else {
                    RuleOutcome::fail(self.default_reason())
                }
            }
            Err(e) => RuleOutcome::fail(format!("ParameterRule({})", e)),
        }
    }

    fn default_reason(&self) -> String {
        "parameter expression".to_string()
    }

    fn describe(&self) -> serde_json::Value {
        json!({"rule": "ParameterRule", "expr": self.expr})
    }
}

pub struct OwnersRule {
    pub owners: HashSet<String>,
}

impl Rule for OwnersRule {
    fn evaluate(&self, spec: &ResolvedSpec, _pool: &ResourcePool) -> RuleOutcome {
        if spec.core.owners.iter().any(|o| self.owners.contains(o)) {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(self.default_reason())
        }
    }

    fn default_reason(&self) -> String {
        "owners".to_string()
    }

    fn describe(&self) -> serde_json::Value {
        json!({"rule": "OwnersRule", "owners": self.owners.iter().collect::<Vec<_>>()})
    }
}

pub struct RegexRule {
    pub pattern: Regex,
}

impl Rule for RegexRule {
    fn evaluate(&self, spec: &ResolvedSpec, _pool: &ResourcePool) -> RuleOutcome {
        let abs = spec.core.file_root.join(&spec.core.file_path);
        if let Ok(text) = std::fs::read_to_string(&abs) {
            if self.pattern.is_match(&text) {
                return RuleOutcome::pass();
            }
        }
        for asset in &spec.core.assets {
            if let Ok(text) = std::fs::read_to_string(&asset.src) {
                if self.pattern.is_match(&text) {
                    return RuleOutcome::pass();
                }
            }
        }
        RuleOutcome::fail(self.default_reason())
    }

    fn default_reason(&self) -> String {
        "regex".to_string()
    }

    fn describe(&self) -> serde_json::Value {
        json!({"rule": "RegexRule", "pattern": self.pattern.as_str()})
    }
}

pub struct PrefixRule {
    pub prefixes: Vec<String>,
}

impl Rule for PrefixRule {
    fn evaluate(&self, spec: &ResolvedSpec, _pool: &ResourcePool) -> RuleOutcome {
        let file = spec.core.file_path.to_string_lossy();
        if self.prefixes.iter().all(|p| file.starts_with(p.as_str())) {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(self.default_reason())
        }
    }

    fn default_reason(&self) -> String {
        "file prefix".to_string()
    }

    fn describe(&self) -> serde_json::Value {
        json!({"rule": "PrefixRule", "prefixes": self.prefixes})
    }
}

pub struct IDsRule {
    pub ids: Vec<String>,
}

impl Rule for IDsRule {
    fn evaluate(&self, spec: &ResolvedSpec, _pool: &ResourcePool) -> RuleOutcome {
        if self.ids.iter().any(|id| spec.core.id.starts_with(id.as_str())) {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(self.default_reason())
        }
    }

    fn default_reason(&self) -> String {
        "id selection".to_string()
    }

    fn describe(&self) -> serde_json::Value {
        json!({"rule": "IDsRule", "ids": self.ids})
    }
}

/// Always prepended to the rule chain. Caches outcomes by canonicalized resource
/// shape so repeated identical `required_resources()` vectors across many specs are
/// evaluated once.
pub struct ResourceCapacityRule {
    cache: Mutex<HashMap<String, RuleOutcome>>,
}

impl ResourceCapacityRule {
    pub fn new() -> Self {
        ResourceCapacityRule {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn canonical_key(required: &[Vec<(String, u32)>]) -> String {
        let mut groups: Vec<Vec<(String, u32)>> = required.to_vec();
        for g in groups.iter_mut() {
            g.sort();
        }
        groups.sort();
        format!("{:?}", groups)
    }
}

impl Default for ResourceCapacityRule {
    fn default() -> Self {
        Self::new()
    }
}

impl Rule for ResourceCapacityRule {
    fn evaluate(&self, spec: &ResolvedSpec, pool: &ResourcePool) -> RuleOutcome {
        let required = spec.core.required_resources(pool);
        let key = Self::canonical_key(&required);
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return cached.clone();
        }
        let outcome = if pool.satisfies(&required) {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(self.default_reason())
        };
        self.cache.lock().unwrap().insert(key, outcome.clone());
        outcome
    }

    fn default_reason(&self) -> String {
        "insufficient resource capacity".to_string()
    }

    fn describe(&self) -> serde_json::Value {
        json!({"rule": "ResourceCapacityRule"})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::generator::GeneratorRegistry;
    use std::io::Write;

    fn make_spec(dir: &std::path::Path, content: &str) -> ResolvedSpec {
        let path = dir.join("t.canary");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", content).unwrap();
        let registry = GeneratorRegistry::with_defaults();
        let config = Config::default();
        let mut drafts = registry
            .generate(dir, std::path::Path::new("t.canary"), &config)
            .unwrap();
        let draft = drafts.remove(0);
        draft.resolve(Vec::new(), Vec::new())
    }

    #[test]
    fn test_keyword_rule() {
        let dir = tempfile::tempdir().unwrap();
        let spec = make_spec(dir.path(), "family: a\nkeywords: fast, smoke\n");
        let pool = ResourcePool::new();
        let rule = KeywordRule {
            exprs: vec!["fast and not slow".to_string()],
        };
        assert!(rule.evaluate(&spec, &pool).ok);

        let rule2 = KeywordRule {
            exprs: vec!["slow".to_string()],
        };
        assert!(!rule2.evaluate(&spec, &pool).ok);
    }

    #[test]
    fn test_parameter_rule() {
        let dir = tempfile::tempdir().unwrap();
        let spec = make_spec(dir.path(), "family: a\nparameters: np=4\n");
        let pool = ResourcePool::new();
        let rule = ParameterRule {
            expr: "np>=2".to_string(),
        };
        assert!(rule.evaluate(&spec, &pool).ok);
        let rule2 = ParameterRule {
            expr: "np<2".to_string(),
        };
        assert!(!rule2.evaluate(&spec, &pool).ok);
    }

    #[test]
    fn test_owners_rule() {
        let dir = tempfile::tempdir().unwrap();
        let spec = make_spec(dir.path(), "family: a\nowners: alice, bob\n");
        let pool = ResourcePool::new();
        let rule = OwnersRule {
            owners: ["bob".to_string()].into_iter().collect(),
        };
        assert!(rule.evaluate(&spec, &pool).ok);
        let rule2 = OwnersRule {
            owners: ["carol".to_string()].into_iter().collect(),
        };
        assert!(!rule2.evaluate(&spec, &pool).ok);
    }

    #[test]
    fn test_resource_capacity_rule_caches() {
        let dir = tempfile::tempdir().unwrap();
        let spec = make_spec(dir.path(), "family: a\nparameters: cpus=2\n");
        let pool = ResourcePool::new();
        pool.add_type("cpu", 4, 1, 0);
        let rule = ResourceCapacityRule::new();
        assert!(rule.evaluate(&spec, &pool).ok);
        assert_eq!(rule.cache.lock().unwrap().len(), 1);
        assert!(rule.evaluate(&spec, &pool).ok);
        assert_eq!(rule.cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ids_rule_prefix_match() {
        let dir = tempfile::tempdir().unwrap();
        let spec = make_spec(dir.path(), "family: a\n");
        let pool = ResourcePool::new();
        let prefix = spec.core.id[..6].to_string();
        let rule = IDsRule { ids: vec![prefix] };
        assert!(rule.evaluate(&spec, &pool).ok);
    }
}
