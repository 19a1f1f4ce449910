mod clean;
mod info;
mod update;

pub use clean::cmd_clean;
pub use info::cmd_info;
pub use update::cmd_update;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use girder_lib::action::{Action, OperationId, PERFORM};
use girder_lib::execute::{match_and_execute, ExecuteConfig, ExecuteResult};
use girder_lib::load;
use girder_lib::name::Name;
use girder_lib::rule::enter_target;
use girder_lib::scope::ScopeId;
use girder_lib::target::TargetId;
use girder_lib::variable::{OverrideKind, Value};
use girder_lib::Engine;

/// A loaded project plus the targets the command line asked for.
pub(crate) struct Invocation {
  pub eng: Arc<Engine>,
  pub targets: Vec<TargetId>,
}

/// Discover and load the project around the current directory, apply
/// command-line variable overrides, source the local buildfile, and
/// resolve the requested targets.
pub(crate) fn setup(args: &[String]) -> Result<Invocation> {
  let cwd = std::env::current_dir().context("unable to determine current directory")?;

  let src_root = load::discover_src_root(&cwd)
    .ok_or_else(|| anyhow!("no project found in {} or above", cwd.display()))?;

  let mut eng = Engine::new();
  eng.work = cwd.clone();

  // Split the arguments into config.var=value overrides and target names.
  let mut target_names: Vec<Name> = Vec::new();
  for a in args {
    match a.split_once('=') {
      Some((name, value)) => {
        let var = eng
          .vars
          .insert(name.trim(), None, None)
          .with_context(|| format!("invalid variable '{}'", name))?;
        let names = value
          .split_whitespace()
          .map(Name::parse)
          .collect::<Result<Vec<_>, _>>()
          .with_context(|| format!("invalid value for '{}'", name))?;
        eng
          .vars
          .add_override(var, OverrideKind::Assign, Value::Untyped(names), None);
      }
      None => {
        target_names.push(Name::parse(a).with_context(|| format!("invalid target '{}'", a))?);
      }
    }
  }

  let root = load::load_project(&mut eng, &src_root, Some(&src_root), &cwd)
    .with_context(|| format!("unable to load project at {}", src_root.display()))?;
  tracing::debug!(
    out_root = %eng.scopes.get(root).out_path.display(),
    "project loaded"
  );

  // Source the buildfile of the directory being built.
  let base = eng.scopes.insert(&cwd, false);
  let mut declared = Vec::new();
  let bf = cwd.join("buildfile");
  if bf.is_file() {
    if let Some(outcome) = load::source_once(&mut eng, &bf, root, base, root)? {
      declared = outcome.declared;
    }
  }

  // Requested targets, or everything the buildfile declares.
  let targets = if target_names.is_empty() {
    declared
  } else {
    let mut r = Vec::new();
    for n in &target_names {
      r.push(enter_target(&eng, &cwd, n).map_err(|e| anyhow!("{}", e))?);
    }
    r
  };

  if targets.is_empty() {
    return Err(anyhow!("no targets to build in {}", cwd.display()));
  }

  Ok(Invocation {
    eng: Arc::new(eng),
    targets,
  })
}

/// Match and execute the invocation's targets for an operation.
pub(crate) fn perform(inv: &Invocation, op: OperationId) -> Result<ExecuteResult> {
  let a = Action::new(PERFORM, op);
  let cfg = ExecuteConfig::default();

  let rt = tokio::runtime::Runtime::new().context("unable to create async runtime")?;
  let result = rt.block_on(match_and_execute(&inv.eng, a, &inv.targets, &cfg))?;

  if !result.is_success() {
    for (id, e) in &result.failed {
      let t = inv.eng.targets.get(*id);
      crate::output::print_error(&format!("failed to build {}: {}", inv.eng.display(&t), e));
    }
    for (id, dep) in &result.skipped {
      let t = inv.eng.targets.get(*id);
      let d = inv.eng.targets.get(*dep);
      crate::output::print_warning(&format!(
        "skipped {}: dependency {} failed",
        inv.eng.display(&t),
        inv.eng.display(&d)
      ));
    }
    return Err(anyhow!(
      "{} target(s) failed, {} skipped",
      result.failed.len(),
      result.skipped.len()
    ));
  }

  Ok(result)
}

pub(crate) fn project_display(eng: &Engine, root: ScopeId) -> (String, String) {
  let s = eng.scopes.get(root);
  let out = s.out_path.display().to_string();
  let src = s
    .src_path()
    .map(|p| p.display().to_string())
    .unwrap_or_else(|| out.clone());
  (out, src)
}
