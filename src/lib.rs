//! Canary: a test-execution engine.
//!
//! Discovers test files (`core::generator`), resolves them into a dependency-linked
//! spec graph (`core::builder`), selects a subset with a rule chain
//! (`core::rules`/`core::selector`), schedules and runs the survivors against a typed
//! resource pool (`core::scheduler`/`core::executor`), and records history in a
//! per-workspace SQLite index (`core::database`) behind the `core::workspace` façade.
//!
//! `cli` defines the command surface; [`run`] is the dispatcher the binary calls.

pub mod cli;
pub mod core;

use crate::cli::{Cli, Command, SelectArgs, SelectionAction, ViewAction};
use crate::core::error::CanaryError;
use crate::core::output;
use crate::core::resource::ResourcePool;
use crate::core::rules::{IDsRule, KeywordRule, OwnersRule, ParameterRule, PrefixRule, Rule};
use crate::core::spec::ResolvedSpec;
use crate::core::testcase::Category;
use crate::core::workspace::Workspace;
use std::sync::Arc;

/// Dispatch a parsed [`Cli`] invocation and return the process exit code.
pub fn run(cli: Cli) -> Result<i32, CanaryError> {
    match cli.command {
        Command::Init => {
            Workspace::create(&cli.root)?;
            output::info("initialized .canary/ workspace");
            Ok(0)
        }
        Command::Collect { paths } => {
            let ws = open_workspace(&cli.root)?;
            let scan_paths = if paths.is_empty() { vec![".".into()] } else { paths };
            let generators = ws.add(&scan_paths)?;
            output::emphasis("collected", &format!("{} test file(s)", generators.len()));
            Ok(0)
        }
        Command::Generate => {
            let ws = open_workspace(&cli.root)?;
            let generators = ws.generators()?;
            let specs = ws.generate_specs(&generators)?;
            output::emphasis("generated", &format!("{} spec(s)", specs.len()));
            Ok(0)
        }
        Command::Run {
            patterns,
            select,
            only,
            batch,
            copy_all_resources,
            timeout,
            fail_fast,
            tag,
            cpus,
            gpus,
            trailing_args,
        } => cmd_run(RunArgs {
            root: &cli.root,
            patterns,
            select,
            only,
            batch,
            copy_all_resources,
            timeout,
            fail_fast,
            tag,
            cpus,
            gpus,
            trailing_args,
        }),
        Command::Rerun {
            strategy,
            cpus,
            gpus,
        } => cmd_rerun(&cli.root, &strategy, cpus, gpus),
        Command::Selection { action } => cmd_selection(&cli.root, action),
        Command::Log { id } => cmd_log(&cli.root, &id),
        Command::History { prefix } => cmd_history(&cli.root, prefix.as_deref()),
        Command::View {
            action: ViewAction::Refresh,
        } => {
            let ws = open_workspace(&cli.root)?;
            let generators = ws.generators()?;
            let specs = ws.generate_specs(&generators)?;
            ws.rebuild_view(&specs)?;
            output::info("view refreshed");
            Ok(0)
        }
        Command::Report => cmd_report(&cli.root),
    }
}

fn open_workspace(root: &std::path::Path) -> Result<Workspace, CanaryError> {
    match Workspace::load(root) {
        Ok(ws) => Ok(ws),
        Err(CanaryError::NotFound(_)) => Workspace::create(root),
        Err(e) => Err(e),
    }
}

fn build_pool(cpus: u32, gpus: u32) -> ResourcePool {
    let pool = ResourcePool::new();
    pool.add_type("cpu", cpus, 1, 0);
    if gpus > 0 {
        pool.add_type("gpu", gpus, 1, 0);
    }
    pool
}

/// Builds the rule chain for a selection pass. Positional pathspec patterns fold into
/// `file_prefixes` alongside any explicit `--file-prefix` flags.
fn build_rules(mut select: SelectArgs, patterns: Vec<String>) -> Vec<Box<dyn Rule>> {
    select.file_prefixes.extend(patterns);
    let mut rules: Vec<Box<dyn Rule>> = Vec::new();
    if !select.keywords.is_empty() {
        rules.push(Box::new(KeywordRule {
            exprs: select.keywords,
        }));
    }
    for expr in select.params {
        rules.push(Box::new(ParameterRule { expr }));
    }
    if !select.owners.is_empty() {
        rules.push(Box::new(OwnersRule {
            owners: select.owners.into_iter().collect(),
        }));
    }
    if !select.file_prefixes.is_empty() {
        rules.push(Box::new(PrefixRule {
            prefixes: select.file_prefixes,
        }));
    }
    if !select.ids.is_empty() {
        rules.push(Box::new(IDsRule { ids: select.ids }));
    }
    rules
}

struct RunArgs<'a> {
    root: &'a std::path::Path,
    patterns: Vec<String>,
    select: SelectArgs,
    only: Option<String>,
    batch: Option<String>,
    copy_all_resources: bool,
    timeout: Option<f64>,
    fail_fast: bool,
    tag: Option<String>,
    cpus: u32,
    gpus: u32,
    trailing_args: Vec<String>,
}

fn cmd_run(args: RunArgs) -> Result<i32, CanaryError> {
    let RunArgs {
        root,
        patterns,
        select,
        only,
        batch,
        copy_all_resources,
        timeout,
        fail_fast,
        tag,
        cpus,
        gpus,
        trailing_args,
    } = args;

    let mut ws = open_workspace(root)?;
    if let Some(scheme) = batch.as_deref() {
        output::warn(&format!(
            "--batch {} accepted but not yet wired into dispatch; run without it to schedule normally",
            scheme
        ));
    }
    ws.config.copy_all_resources = copy_all_resources;
    ws.config.fail_fast = fail_fast;
    if let Some(t) = timeout {
        ws.config.timeout.all = Some(t);
    }

    let generators = ws.generators()?;
    let mut specs = ws.generate_specs_with(&generators, timeout.is_some())?;
    if let Some(strategy) = only.as_deref() {
        let included = ws.rerun_subset(&specs, strategy)?;
        specs.retain(|s| included.contains(&s.core.id));
    }
    let pool = build_pool(cpus, gpus);
    let rules = build_rules(select, patterns);
    let selected = ws.select(specs, &pool, rules, tag.as_deref().unwrap_or("adhoc"))?;
    if selected.is_empty() {
        output::warn("no specs matched the selection");
        return Ok(0);
    }
    if !trailing_args.is_empty() {
        std::env::set_var("CANARY_ARGS", trailing_args.join(" "));
    }
    let session = ws.new_session(&selected)?;
    let code = session.run(&ws.config, &pool);
    ws.add_session_results(&session)?;
    ws.rebuild_view(&selected)?;
    print_summary(&session.results());
    Ok(code)
}

fn cmd_rerun(root: &std::path::Path, strategy: &str, cpus: u32, gpus: u32) -> Result<i32, CanaryError> {
    let ws = open_workspace(root)?;
    let generators = ws.generators()?;
    let specs = ws.generate_specs(&generators)?;
    let included = ws.rerun_subset(&specs, strategy)?;
    let selected: Vec<Arc<ResolvedSpec>> = specs
        .into_iter()
        .filter(|s| included.contains(&s.core.id))
        .collect();
    if selected.is_empty() {
        output::warn("nothing to re-run under this strategy");
        return Ok(0);
    }
    let pool = build_pool(cpus, gpus);
    let session = ws.new_session(&selected)?;
    let code = session.run(&ws.config, &pool);
    ws.add_session_results(&session)?;
    ws.rebuild_view(&selected)?;
    print_summary(&session.results());
    Ok(code)
}

fn cmd_selection(root: &std::path::Path, action: SelectionAction) -> Result<i32, CanaryError> {
    let ws = open_workspace(root)?;
    match action {
        SelectionAction::Create { tag, select } => {
            let generators = ws.generators()?;
            let specs = ws.generate_specs(&generators)?;
            let pool = ResourcePool::new();
            let rules = build_rules(select, Vec::new());
            let selected = ws.select(specs, &pool, rules, &tag)?;
            output::emphasis("saved", &format!("selection '{}' ({} spec(s))", tag, selected.len()));
            Ok(0)
        }
        SelectionAction::Rm { tag } => {
            ws.remove_selection(&tag)?;
            output::emphasis("removed", &format!("selection '{}'", tag));
            Ok(0)
        }
        SelectionAction::Rename { from, to } => {
            ws.rename_selection(&from, &to)?;
            output::emphasis("renamed", &format!("selection '{}' -> '{}'", from, to));
            Ok(0)
        }
        SelectionAction::List => {
            for tag in ws.list_selections()? {
                output::bullet(&tag);
            }
            Ok(0)
        }
    }
}

fn cmd_log(root: &std::path::Path, id_prefix: &str) -> Result<i32, CanaryError> {
    let ws = open_workspace(root)?;
    let id = ws.resolve_spec_id(id_prefix)?;
    let results = ws.results()?;
    let Some((status, _, workspace)) = results.get(&id) else {
        return Err(CanaryError::NotFound(format!("no result recorded for {}", id)));
    };
    output::emphasis("status", &format!("{:?}", status.state));
    let dir = workspace.dir();
    let mut entries: Vec<std::path::PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    entries.sort();
    for path in entries {
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        output::emphasis(&format!("--- {} ---", name), "");
        if let Ok(text) = std::fs::read_to_string(&path) {
            println!("{}", text);
        }
    }
    Ok(0)
}

fn cmd_history(root: &std::path::Path, prefix: Option<&str>) -> Result<i32, CanaryError> {
    let ws = open_workspace(root)?;
    let results = ws.results()?;
    let mut ids: Vec<&String> = results.keys().collect();
    ids.sort();
    for id in ids {
        if let Some(p) = prefix {
            if !id.starts_with(p) {
                continue;
            }
        }
        let (status, timekeeper, _) = &results[id];
        let duration = timekeeper.duration.unwrap_or(0.0);
        output::bullet(&format!("{}  {:?}  {:.2}s", &id[..12.min(id.len())], status.state, duration));
    }
    Ok(0)
}

fn cmd_report(root: &std::path::Path) -> Result<i32, CanaryError> {
    let ws = open_workspace(root)?;
    let results = ws.results()?;
    let mut pass = 0usize;
    let mut fail = 0usize;
    let mut skip = 0usize;
    for (status, _, _) in results.values() {
        match status.state.category() {
            Category::Pass => pass += 1,
            Category::Fail => fail += 1,
            Category::Skip => skip += 1,
            Category::None => {}
        }
    }
    output::info(&format!("pass: {}  fail: {}  skip: {}  total: {}", pass, fail, skip, results.len()));
    Ok(if fail > 0 { 1 } else { 0 })
}

fn print_summary(
    results: &[(
        String,
        crate::core::testcase::Status,
        crate::core::testcase::Timekeeper,
        crate::core::testcase::ExecutionSpace,
    )],
) {
    let mut pass = 0usize;
    let mut fail = 0usize;
    let mut skip = 0usize;
    for (_, status, _, _) in results {
        match status.state.category() {
            Category::Pass => pass += 1,
            Category::Fail => fail += 1,
            Category::Skip => skip += 1,
            Category::None => {}
        }
    }
    output::info(&format!("pass: {}  fail: {}  skip: {}", pass, fail, skip));
}
