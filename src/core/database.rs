//! Workspace SQLite index (C9): the on-disk record of generators, specs,
//! dependency edges, selections, and results.
//!
//! Schema (spec.md §4.9):
//! ```text
//! generators(id PK, data TEXT)
//! specs(id PK, signature TEXT, data JSON)
//! dependencies(id PK, data JSON)
//! selections(tag PK, data JSON)
//! results(id PK, status JSON, timekeeper JSON, workspace JSON)
//! ```
//! All access goes through [`crate::core::pool::WorkspacePool`] so writes are
//! serialized per database file and reads ride WAL concurrency, exactly like the
//! rest of this workspace's persistence.

use crate::core::error::CanaryError;
use crate::core::graph::topo_sort;
use crate::core::generator::Generator;
use crate::core::pool::WorkspacePool;
use crate::core::selector::SelectorSnapshot;
use crate::core::spec::{ResolvedSpec, SpecCore};
use crate::core::testcase::{ExecutionSpace, Status, Timekeeper};
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub fn init_schema(conn: &Connection) -> Result<(), CanaryError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS generators (id TEXT PRIMARY KEY, data TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS specs (id TEXT PRIMARY KEY, signature TEXT NOT NULL, data TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS dependencies (id TEXT PRIMARY KEY REFERENCES specs(id), data TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS selections (tag TEXT PRIMARY KEY, data TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS results (id TEXT PRIMARY KEY, status TEXT NOT NULL, timekeeper TEXT NOT NULL, workspace TEXT NOT NULL);",
    )?;
    Ok(())
}

pub fn put_generators(pool: &WorkspacePool, db_path: &Path, generators: &[Generator]) -> Result<(), CanaryError> {
    pool.with_write(db_path, |conn| {
        init_schema(conn)?;
        for g in generators {
            let data = serde_json::to_string(&(g.file_root.clone(), g.file_path.clone(), g.content_hash.clone()))?;
            conn.execute(
                "INSERT INTO generators (id, data) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                params![g.id, data],
            )?;
        }
        Ok(())
    })
}

/// Load every previously collected generator, so `generate` can rebuild the spec set
/// without re-scanning the filesystem.
pub fn get_generators(pool: &WorkspacePool, db_path: &Path) -> Result<Vec<Generator>, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let mut stmt = conn.prepare("SELECT id, data FROM generators")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            let (file_root, file_path, content_hash): (std::path::PathBuf, std::path::PathBuf, String) =
                serde_json::from_str(&data)?;
            out.push(Generator {
                id,
                file_root,
                file_path,
                content_hash,
            });
        }
        Ok(out)
    })
}

#[derive(serde::Serialize, serde::Deserialize)]
struct DepRow {
    deps: Vec<String>,
    criteria: Vec<String>,
}

/// Persist `specs` under a shared `signature` (a hash of the generation inputs that
/// produced them), used by `Workspace::generate_specs` to memoize regeneration.
pub fn put_specs(
    pool: &WorkspacePool,
    db_path: &Path,
    specs: &[Arc<ResolvedSpec>],
    signature: &str,
) -> Result<(), CanaryError> {
    pool.with_write(db_path, |conn| {
        init_schema(conn)?;
        let tx = conn.unchecked_transaction()?;
        for spec in specs {
            let data = serde_json::to_string(&spec.core)?;
            tx.execute(
                "INSERT INTO specs (id, signature, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET signature = excluded.signature, data = excluded.data",
                params![spec.core.id, signature, data],
            )?;
            let dep_row = DepRow {
                deps: spec.dependencies.iter().map(|d| d.core.id.clone()).collect(),
                criteria: spec.dep_done_criteria.clone(),
            };
            let dep_data = serde_json::to_string(&dep_row)?;
            tx.execute(
                "INSERT INTO dependencies (id, data) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                params![spec.core.id, dep_data],
            )?;
        }
        tx.commit()?;
        Ok(())
    })
}

/// Load every spec, reconstructing dependency `Arc` links in dependency-first order.
pub fn get_specs(pool: &WorkspacePool, db_path: &Path) -> Result<Vec<Arc<ResolvedSpec>>, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let mut core_stmt = conn.prepare("SELECT id, data FROM specs")?;
        let cores: HashMap<String, SpecCore> = core_stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let data: String = row.get(1)?;
                Ok((id, data))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, data)| -> Result<(String, SpecCore), CanaryError> {
                Ok((id, serde_json::from_str(&data)?))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect();

        let mut dep_stmt = conn.prepare("SELECT id, data FROM dependencies")?;
        let dep_rows: HashMap<String, DepRow> = dep_stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let data: String = row.get(1)?;
                Ok((id, data))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, data)| -> Result<(String, DepRow), CanaryError> {
                Ok((id, serde_json::from_str(&data)?))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .collect();

        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        for (id, row) in &dep_rows {
            graph.insert(id.clone(), row.deps.clone());
        }
        let order = topo_sort(&graph)?;

        let mut resolved: HashMap<String, Arc<ResolvedSpec>> = HashMap::new();
        let mut out = Vec::with_capacity(order.len());
        for id in order {
            let Some(core) = cores.get(&id) else { continue };
            let dep_row = dep_rows.get(&id);
            let dependencies: Vec<Arc<ResolvedSpec>> = dep_row
                .map(|r| r.deps.iter().filter_map(|d| resolved.get(d).cloned()).collect())
                .unwrap_or_default();
            let dep_done_criteria = dep_row.map(|r| r.criteria.clone()).unwrap_or_default();
            let spec = Arc::new(ResolvedSpec {
                core: clone_core(core),
                dependencies,
                dep_done_criteria,
            });
            resolved.insert(id, spec.clone());
            out.push(spec);
        }
        Ok(out)
    })
}

/// `SpecCore` carries a `Mutex<Mask>` that isn't `Clone`; deserialize-a-fresh-copy via
/// its `Serialize`/`Deserialize` round trip rather than hand-rolling field-by-field
/// copying.
fn clone_core(core: &SpecCore) -> SpecCore {
    let json = serde_json::to_string(core).expect("SpecCore always serializes");
    serde_json::from_str(&json).expect("round-tripped SpecCore always deserializes")
}

pub fn get_signature(pool: &WorkspacePool, db_path: &Path) -> Result<Option<String>, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let mut stmt = conn.prepare("SELECT signature FROM specs LIMIT 1")?;
        let mut rows = stmt.query([])?;
        Ok(match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        })
    })
}

/// Lexicographic successor of a hex prefix used as the exclusive upper bound of a
/// prefix range scan. `None` means "no upper bound" (prefix is all `f`s).
fn increment_hex_prefix(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    for i in (0..chars.len()).rev() {
        let digit = chars[i].to_digit(16).unwrap_or(0);
        if digit < 15 {
            chars[i] = std::char::from_digit(digit + 1, 16).unwrap();
            return Some(chars.into_iter().collect());
        }
        chars[i] = '0';
    }
    None
}

/// Resolve a spec-id prefix to its full id. Errors with [`CanaryError::NotFound`] on
/// zero matches, [`CanaryError::AmbiguousId`] on more than one.
pub fn resolve_spec_id(pool: &WorkspacePool, db_path: &Path, prefix: &str) -> Result<String, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let matches: Vec<String> = match increment_hex_prefix(prefix) {
            Some(hi) => {
                let mut stmt = conn.prepare("SELECT id FROM specs WHERE id >= ?1 AND id < ?2 ORDER BY id")?;
                stmt.query_map(params![prefix, hi], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT id FROM specs WHERE id >= ?1 ORDER BY id")?;
                stmt.query_map(params![prefix], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        let matches: Vec<String> = matches.into_iter().filter(|id| id.starts_with(prefix)).collect();
        match matches.len() {
            0 => Err(CanaryError::NotFound(format!("no spec matches prefix {}", prefix))),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(CanaryError::AmbiguousId(prefix.to_string())),
        }
    })
}

/// Upstream closure: `roots` plus every dependency reachable by following
/// `dependencies` edges forward (a spec's own `deps` list), inclusive of `roots`.
/// In-memory graph-reachability equivalent of `database.py`'s `get_upstream_ids`
/// (a `WITH RECURSIVE` query there; the deps table here is small enough per
/// workspace to load wholesale and walk with `core::graph::reachable_nodes`).
pub fn reachable_spec_ids(pool: &WorkspacePool, db_path: &Path, roots: &[String]) -> Result<HashSet<String>, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let graph = load_dep_graph(conn)?;
        Ok(crate::core::graph::reachable_nodes(&graph, roots))
    })
}

/// Downstream closure: every spec that transitively depends on one of `roots`,
/// excluding the roots themselves unless a dependency cycle makes one its own
/// dependent (rejected elsewhere, so that can't happen in practice). Walks the
/// reverse of the `dependencies` edge table — the in-memory equivalent of
/// `database.py`'s `get_downstream_ids` recursive CTE.
pub fn downstream_spec_ids(pool: &WorkspacePool, db_path: &Path, roots: &[String]) -> Result<HashSet<String>, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let graph = load_dep_graph(conn)?;
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        for (id, deps) in &graph {
            for dep in deps {
                reverse.entry(dep.clone()).or_default().push(id.clone());
            }
        }
        let mut downstream = crate::core::graph::reachable_nodes(&reverse, roots);
        for root in roots {
            downstream.remove(root);
        }
        Ok(downstream)
    })
}

fn load_dep_graph(conn: &Connection) -> Result<HashMap<String, Vec<String>>, CanaryError> {
    let mut stmt = conn.prepare("SELECT id, data FROM dependencies")?;
    stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let data: String = row.get(1)?;
        Ok((id, data))
    })?
    .collect::<Result<Vec<_>, _>>()?
    .into_iter()
    .map(|(id, data)| -> Result<(String, Vec<String>), CanaryError> {
        let row: DepRow = serde_json::from_str(&data)?;
        Ok((id, row.deps))
    })
    .collect()
}

pub fn put_selection(pool: &WorkspacePool, db_path: &Path, tag: &str, snapshot: &SelectorSnapshot) -> Result<(), CanaryError> {
    pool.with_write(db_path, |conn| {
        init_schema(conn)?;
        let data = serde_json::to_string(snapshot)?;
        conn.execute(
            "INSERT INTO selections (tag, data) VALUES (?1, ?2)
             ON CONFLICT(tag) DO UPDATE SET data = excluded.data",
            params![tag, data],
        )?;
        Ok(())
    })
}

pub fn get_selection(pool: &WorkspacePool, db_path: &Path, tag: &str) -> Result<SelectorSnapshot, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let data: String = conn.query_row("SELECT data FROM selections WHERE tag = ?1", params![tag], |row| row.get(0))
            .map_err(|_| CanaryError::NotFound(format!("selection {}", tag)))?;
        Ok(serde_json::from_str(&data)?)
    })
}

pub fn list_selections(pool: &WorkspacePool, db_path: &Path) -> Result<Vec<String>, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let mut stmt = conn.prepare("SELECT tag FROM selections ORDER BY tag")?;
        Ok(stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?)
    })
}

pub fn delete_selection(pool: &WorkspacePool, db_path: &Path, tag: &str) -> Result<(), CanaryError> {
    pool.with_write(db_path, |conn| {
        init_schema(conn)?;
        conn.execute("DELETE FROM selections WHERE tag = ?1", params![tag])?;
        Ok(())
    })
}

pub fn rename_selection(pool: &WorkspacePool, db_path: &Path, from: &str, to: &str) -> Result<(), CanaryError> {
    pool.with_write(db_path, |conn| {
        init_schema(conn)?;
        conn.execute("UPDATE selections SET tag = ?2 WHERE tag = ?1", params![from, to])?;
        Ok(())
    })
}

pub fn put_results(
    pool: &WorkspacePool,
    db_path: &Path,
    results: &[(String, Status, Timekeeper, ExecutionSpace)],
) -> Result<(), CanaryError> {
    pool.with_write(db_path, |conn| {
        init_schema(conn)?;
        let tx = conn.unchecked_transaction()?;
        for (id, status, timekeeper, workspace) in results {
            tx.execute(
                "INSERT INTO results (id, status, timekeeper, workspace) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, timekeeper = excluded.timekeeper, workspace = excluded.workspace",
                params![
                    id,
                    serde_json::to_string(status)?,
                    serde_json::to_string(timekeeper)?,
                    serde_json::to_string(workspace)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    })
}

pub fn get_results(
    pool: &WorkspacePool,
    db_path: &Path,
) -> Result<HashMap<String, (Status, Timekeeper, ExecutionSpace)>, CanaryError> {
    pool.with_read(db_path, |conn| {
        init_schema(conn)?;
        let mut stmt = conn.prepare("SELECT id, status, timekeeper, workspace FROM results")?;
        let rows: Vec<(String, String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = HashMap::new();
        for (id, status, timekeeper, workspace) in rows {
            out.insert(
                id,
                (
                    serde_json::from_str(&status)?,
                    serde_json::from_str(&timekeeper)?,
                    serde_json::from_str(&workspace)?,
                ),
            );
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get_generators_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("workspace.sqlite3");
        let pool = WorkspacePool::new();
        std::fs::write(dir.path().join("a.canary"), "family: a\n").unwrap();
        let g = Generator::new(dir.path(), Path::new("a.canary")).unwrap();
        put_generators(&pool, &db_path, &[g.clone()]).unwrap();
        let loaded = get_generators(&pool, &db_path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, g.id);
    }

    #[test]
    fn test_upstream_and_downstream_spec_ids() {
        // chain: c depends on b, b depends on a
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("workspace.sqlite3");
        let pool = WorkspacePool::new();
        pool.with_write(&db_path, |conn| {
            init_schema(conn)?;
            conn.execute(
                "INSERT INTO dependencies (id, data) VALUES ('a', '{\"deps\":[],\"criteria\":[]}')",
                [],
            )?;
            conn.execute(
                "INSERT INTO dependencies (id, data) VALUES ('b', '{\"deps\":[\"a\"],\"criteria\":[\"success\"]}')",
                [],
            )?;
            conn.execute(
                "INSERT INTO dependencies (id, data) VALUES ('c', '{\"deps\":[\"b\"],\"criteria\":[\"success\"]}')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let upstream = reachable_spec_ids(&pool, &db_path, &["c".to_string()]).unwrap();
        assert_eq!(upstream, HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()]));

        let downstream = downstream_spec_ids(&pool, &db_path, &["a".to_string()]).unwrap();
        assert_eq!(downstream, HashSet::from(["b".to_string(), "c".to_string()]));
    }

    #[test]
    fn test_increment_hex_prefix() {
        assert_eq!(increment_hex_prefix("9f"), Some("a0".to_string()));
        assert_eq!(increment_hex_prefix("ff"), None);
        assert_eq!(increment_hex_prefix("a0"), Some("a1".to_string()));
    }

    #[test]
    fn test_put_and_get_selection_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("workspace.sqlite3");
        let pool = WorkspacePool::new();
        let snapshot = SelectorSnapshot {
            spec_set_id: "abc".to_string(),
            masked: HashMap::new(),
            rules: Vec::new(),
            created_on: 1.0,
        };
        put_selection(&pool, &db_path, "nightly", &snapshot).unwrap();
        let loaded = get_selection(&pool, &db_path, "nightly").unwrap();
        assert_eq!(loaded.spec_set_id, "abc");
    }

    #[test]
    fn test_resolve_spec_id_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("workspace.sqlite3");
        let pool = WorkspacePool::new();
        pool.with_write(&db_path, |conn| {
            init_schema(conn)?;
            conn.execute("INSERT INTO specs (id, signature, data) VALUES ('aaaa1111', 's', '{}')", [])?;
            conn.execute("INSERT INTO specs (id, signature, data) VALUES ('aaaa2222', 's', '{}')", [])?;
            Ok(())
        })
        .unwrap();
        let err = resolve_spec_id(&pool, &db_path, "aaaa").unwrap_err();
        assert!(matches!(err, CanaryError::AmbiguousId(_)));
    }

    #[test]
    fn test_resolve_spec_id_unique() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("workspace.sqlite3");
        let pool = WorkspacePool::new();
        pool.with_write(&db_path, |conn| {
            init_schema(conn)?;
            conn.execute("INSERT INTO specs (id, signature, data) VALUES ('deadbeef', 's', '{}')", [])?;
            Ok(())
        })
        .unwrap();
        let id = resolve_spec_id(&pool, &db_path, "dead").unwrap();
        assert_eq!(id, "deadbeef");
    }
}
