//! The dependency executor.
//!
//! Executes the recipes of a matched target graph for an action. The
//! executor builds a DAG over the matched targets (edges reversed for
//! operations with execution mode `last`, such as clean), computes
//! parallel execution waves, and runs each wave's recipes on a bounded
//! task set. Failures skip the dependent subtree while unrelated subgraphs
//! continue; targets that report `postponed` get a bounded retry pass at
//! the end.
//!
//! Each (action, target) pair executes at most once per operation: a
//! second visit observes the memoized terminal state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::action::{Action, ExecutionMode};
use crate::rule::{match_target, MatchError};
use crate::target::{ExecuteStart, Recipe, RecipeError, TargetId, TargetState};
use crate::Engine;

#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("dependency cycle detected in the target graph")]
  CycleDetected,

  #[error("target {0} postponed again after retry")]
  PostponedAgain(String),

  #[error("execution cancelled")]
  Cancelled,

  #[error(transparent)]
  Match(#[from] MatchError),

  #[error("executor internal error: {0}")]
  Internal(String),
}

/// Cooperative cancellation flag, polled at wave boundaries and before
/// each recipe.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Clone)]
pub struct ExecuteConfig {
  /// Maximum number of recipes to run in parallel.
  pub parallelism: usize,

  /// Abort everything on the first failure instead of finishing
  /// unrelated subgraphs.
  pub fail_fast: bool,

  /// How many retry passes a postponed target gets. Still postponed after
  /// that is fatal.
  pub postponed_retries: u32,

  pub cancel: CancelFlag,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4),
      fail_fast: false,
      postponed_retries: 1,
      cancel: CancelFlag::new(),
    }
  }
}

/// Result of executing the target graph.
#[derive(Default, Debug)]
pub struct ExecuteResult {
  /// Terminal state of every executed target.
  pub states: HashMap<TargetId, TargetState>,

  /// Targets whose recipe failed, with the surfaced error.
  pub failed: Vec<(TargetId, RecipeError)>,

  /// Targets skipped because a dependency failed, mapped to that
  /// dependency.
  pub skipped: HashMap<TargetId, TargetId>,
}

impl ExecuteResult {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  pub fn changed(&self) -> usize {
    self
      .states
      .values()
      .filter(|s| **s == TargetState::Changed)
      .count()
  }

  pub fn unchanged(&self) -> usize {
    self
      .states
      .values()
      .filter(|s| **s == TargetState::Unchanged)
      .count()
  }

  pub fn state_of(&self, id: TargetId) -> Option<TargetState> {
    self.states.get(&id).copied()
  }
}

/// Match the root targets and execute the resulting graph.
pub async fn match_and_execute(
  eng: &Arc<Engine>,
  a: Action,
  roots: &[TargetId],
  cfg: &ExecuteConfig,
) -> Result<ExecuteResult, ExecuteError> {
  for &id in roots {
    match_target(eng, a, id, "")?;
  }
  execute(eng, a, roots, cfg).await
}

/// Execute the recipes of an already-matched target graph.
pub async fn execute(
  eng: &Arc<Engine>,
  a: Action,
  roots: &[TargetId],
  cfg: &ExecuteConfig,
) -> Result<ExecuteResult, ExecuteError> {
  let mode = execution_mode(eng, a, roots);
  let (graph, node_of) = build_graph(eng, roots, mode);

  toposort(&graph, None).map_err(|_| ExecuteError::CycleDetected)?;
  let waves = waves(&graph);

  info!(
    targets = graph.node_count(),
    waves = waves.len(),
    mode = ?mode,
    "executing target graph"
  );

  let mut result = ExecuteResult::default();
  let mut postponed: Vec<TargetId> = Vec::new();
  let mut blocked: HashSet<TargetId> = HashSet::new();

  let semaphore = Arc::new(Semaphore::new(cfg.parallelism.max(1)));

  'waves: for (wave_idx, wave) in waves.iter().enumerate() {
    if cfg.cancel.is_cancelled() {
      return Err(ExecuteError::Cancelled);
    }

    debug!(wave = wave_idx, targets = wave.len(), "executing wave");

    // Partition the wave into ready targets and ones blocked by a failed
    // dependency.
    let mut ready = Vec::new();
    for &tid in wave {
      let failed_dep = graph
        .neighbors_directed(node_of[&tid], Direction::Incoming)
        .map(|n| graph[n])
        .find(|dep| blocked.contains(dep));

      match failed_dep {
        Some(dep) => {
          warn!(
            target = %eng.display(&eng.targets.get(tid)),
            "skipped: dependency failed"
          );
          blocked.insert(tid);
          result.skipped.insert(tid, dep);
        }
        None => ready.push(tid),
      }
    }

    let mut join_set: JoinSet<Result<(TargetId, Result<TargetState, RecipeError>), String>> =
      JoinSet::new();

    for tid in ready {
      let eng = eng.clone();
      let semaphore = semaphore.clone();
      let cancel = cfg.cancel.clone();

      join_set.spawn(async move {
        let _permit = semaphore
          .acquire()
          .await
          .map_err(|e| format!("semaphore closed: {e}"))?;

        if cancel.is_cancelled() {
          return Ok((tid, Err(RecipeError::Fail("cancelled".to_string()))));
        }

        let r = run_recipe(&eng, a, tid);
        Ok((tid, r))
      });
    }

    while let Some(joined) = join_set.join_next().await {
      let (tid, r) = match joined {
        Ok(Ok(pair)) => pair,
        Ok(Err(msg)) => return Err(ExecuteError::Internal(msg)),
        Err(e) => return Err(ExecuteError::Internal(format!("recipe task panicked: {e}"))),
      };

      match r {
        Ok(st) => {
          result.states.insert(tid, st);
          if st == TargetState::Postponed {
            postponed.push(tid);
          }
        }
        Err(e) => {
          error!(
            target = %eng.display(&eng.targets.get(tid)),
            error = %e,
            "recipe failed"
          );
          blocked.insert(tid);
          result.states.insert(tid, TargetState::Failed);
          result.failed.push((tid, e));
          if cfg.fail_fast {
            cfg.cancel.cancel();
            break 'waves;
          }
        }
      }
    }
  }

  // Retry pass(es) for postponed targets, in arbitrary order.
  for _ in 0..cfg.postponed_retries {
    if postponed.is_empty() {
      break;
    }
    let mut still = Vec::new();
    for tid in postponed.drain(..) {
      let t = eng.targets.get(tid);
      let recipe = match t.retry_postponed() {
        Some(r) => r,
        None => continue,
      };

      match invoke(eng, a, tid, recipe) {
        Ok(st) => {
          t.finish_execute(st);
          result.states.insert(tid, st);
          if st == TargetState::Postponed {
            still.push(tid);
          }
        }
        Err(e) => {
          t.finish_execute(TargetState::Failed);
          result.states.insert(tid, TargetState::Failed);
          result.failed.push((tid, e));
        }
      }
    }
    postponed = still;
  }

  // Repeated postponed on the same (action, target) pair is fatal.
  if let Some(&tid) = postponed.first() {
    return Err(ExecuteError::PostponedAgain(
      eng.display(&eng.targets.get(tid)),
    ));
  }

  Ok(result)
}

/// Execution mode of the action's operation, per the root scope's
/// operation table.
fn execution_mode(eng: &Engine, a: Action, roots: &[TargetId]) -> ExecutionMode {
  for &id in roots {
    let t = eng.targets.get(id);
    let base = eng.base_scope(&t);
    if let Some(rs) = eng.scopes.root_scope(base) {
      if let Some(info) = eng.scopes.get(rs).operations.get(a.operation().0) {
        return info.mode;
      }
    }
  }
  ExecutionMode::First
}

/// Collect the matched subgraph reachable from the roots. Edge direction
/// encodes execution order: an edge u -> v means u runs before v.
fn build_graph(
  eng: &Engine,
  roots: &[TargetId],
  mode: ExecutionMode,
) -> (DiGraph<TargetId, ()>, HashMap<TargetId, NodeIndex>) {
  let mut graph = DiGraph::new();
  let mut node_of: HashMap<TargetId, NodeIndex> = HashMap::new();
  let mut stack: Vec<TargetId> = roots.to_vec();
  let mut seen: HashSet<TargetId> = roots.iter().copied().collect();

  while let Some(tid) = stack.pop() {
    let node = *node_of
      .entry(tid)
      .or_insert_with(|| graph.add_node(tid));

    for pid in eng.targets.get(tid).prerequisite_targets() {
      let pnode = *node_of
        .entry(pid)
        .or_insert_with(|| graph.add_node(pid));

      match mode {
        ExecutionMode::First => graph.add_edge(pnode, node, ()),
        ExecutionMode::Last => graph.add_edge(node, pnode, ()),
      };

      if seen.insert(pid) {
        stack.push(pid);
      }
    }
  }

  (graph, node_of)
}

/// Compute parallel execution waves (Kahn levels): each wave's targets
/// have all their predecessors in earlier waves.
fn waves(graph: &DiGraph<TargetId, ()>) -> Vec<Vec<TargetId>> {
  let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
  for idx in graph.node_indices() {
    in_degree.insert(
      idx,
      graph.neighbors_directed(idx, Direction::Incoming).count(),
    );
  }

  let mut remaining: HashSet<NodeIndex> = graph.node_indices().collect();
  let mut result = Vec::new();

  while !remaining.is_empty() {
    let ready: Vec<NodeIndex> = remaining
      .iter()
      .filter(|&&idx| in_degree[&idx] == 0)
      .copied()
      .collect();

    if ready.is_empty() {
      break; // Cycle; caught by the caller's toposort.
    }

    for &idx in &ready {
      remaining.remove(&idx);
      for n in graph.neighbors_directed(idx, Direction::Outgoing) {
        if let Some(d) = in_degree.get_mut(&n) {
          *d = d.saturating_sub(1);
        }
      }
    }

    result.push(ready.into_iter().map(|idx| graph[idx]).collect());
  }

  result
}

/// Execute a single target's recipe, memoizing the terminal state.
fn run_recipe(eng: &Engine, a: Action, tid: TargetId) -> Result<TargetState, RecipeError> {
  let t = eng.targets.get(tid);

  let recipe = match t.begin_execute() {
    ExecuteStart::Done(st) => return Ok(st),
    ExecuteStart::Run(r) => r,
  };

  let r = invoke(eng, a, tid, recipe);
  match &r {
    Ok(st) => t.finish_execute(*st),
    Err(_) => t.finish_execute(TargetState::Failed),
  }

  for pid in t.prerequisite_targets() {
    eng.targets.get(pid).dec_dependents();
  }

  r
}

fn invoke(eng: &Engine, a: Action, tid: TargetId, recipe: Recipe) -> Result<TargetState, RecipeError> {
  let t = eng.targets.get(tid);
  match recipe {
    Recipe::Noop => Ok(TargetState::Unchanged),
    Recipe::Default => Ok(combine_prerequisite_state(eng, tid)),
    Recipe::Group => Ok(
      t.group()
        .map(|g| eng.targets.get(g).state())
        .unwrap_or(TargetState::Unchanged),
    ),
    Recipe::Perform(f) => f(eng, a, tid),
  }
}

/// Forward-to-prerequisites state: changed if any prerequisite changed.
pub fn combine_prerequisite_state(eng: &Engine, tid: TargetId) -> TargetState {
  let t = eng.targets.get(tid);
  let mut st = TargetState::Unchanged;
  for pid in t.prerequisite_targets() {
    match eng.targets.get(pid).state() {
      TargetState::Failed => return TargetState::Failed,
      TargetState::Changed | TargetState::Group => st = TargetState::Changed,
      _ => {}
    }
  }
  st
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::{
    Action, CLEAN, CLEAN_OP, DEFAULT_OP, PERFORM, PERFORM_META, UPDATE, UPDATE_OP,
  };
  use crate::rule::builtin::register_builtin_rules;
  use crate::rule::{MatchData, Rule, RuleError};
  use crate::scope::ScopeId;
  use crate::target::types::{FILE, FSDIR};
  use crate::target::Target;
  use std::path::Path;
  use std::sync::Mutex;
  use tempfile::TempDir;

  fn engine_at(root: &Path) -> (Arc<Engine>, ScopeId) {
    let mut eng = Engine::new();
    let rs = eng.scopes.insert(root, true);
    {
      let s = eng.scopes.get_mut(rs);
      s.meta_operations.insert(PERFORM_META);
      s.operations.insert(DEFAULT_OP);
      s.operations.insert(UPDATE_OP);
      s.operations.insert(CLEAN_OP);
      register_builtin_rules(&mut s.rules);
    }
    (Arc::new(eng), rs)
  }

  /// A rule whose recipe appends the target id to a shared log.
  struct LogRule {
    log: Arc<Mutex<Vec<TargetId>>>,
  }

  impl Rule for LogRule {
    fn name(&self) -> &str {
      "test.log"
    }

    fn matches(
      &self,
      _eng: &Engine,
      _a: Action,
      _t: &Target,
      _hint: &str,
    ) -> Result<Option<MatchData>, RuleError> {
      Ok(Some(MatchData::claim()))
    }

    fn apply(
      &self,
      eng: &Engine,
      a: Action,
      t: &Target,
      _data: MatchData,
    ) -> Result<Recipe, RuleError> {
      crate::rule::search_and_match(eng, a, t, None)?;
      let log = self.log.clone();
      Ok(Recipe::Perform(Arc::new(move |_eng, _a, tid| {
        log.lock().unwrap().push(tid);
        Ok(TargetState::Changed)
      })))
    }
  }

  fn log_engine(root: &Path) -> (Arc<Engine>, Arc<Mutex<Vec<TargetId>>>) {
    let mut eng = Engine::new();
    let rs = eng.scopes.insert(root, true);
    let log = Arc::new(Mutex::new(Vec::new()));
    {
      let s = eng.scopes.get_mut(rs);
      s.meta_operations.insert(PERFORM_META);
      s.operations.insert(DEFAULT_OP);
      s.operations.insert(UPDATE_OP);
      s.operations.insert(CLEAN_OP);
      for op in [UPDATE, CLEAN] {
        s.rules
          .insert(op, crate::target::types::TARGET, "", Arc::new(LogRule { log: log.clone() }));
      }
    }
    (Arc::new(eng), log)
  }

  fn file_with_prereq(eng: &Engine, dir: &Path) -> (TargetId, TargetId) {
    let (t, _) = eng
      .targets
      .insert(&eng.exts, FILE, dir, Path::new(""), "t", Some(""));
    let (p, _) = eng
      .targets
      .insert(&eng.exts, FILE, dir, Path::new(""), "p", Some(""));
    eng
      .targets
      .get(t)
      .add_prerequisite(crate::name::Name::parse("file{p.}").unwrap());
    (t, p)
  }

  #[tokio::test]
  async fn fsdir_chain_updates_and_cleans() {
    let tmp = TempDir::new().unwrap();
    let (eng, _) = engine_at(tmp.path());

    let deep = tmp.path().join("a/b/c");
    let (c, _) = eng
      .targets
      .insert(&eng.exts, FSDIR, &deep, Path::new(""), "", None);

    // First update: all three directories created.
    let update = Action::new(PERFORM, UPDATE);
    let r = match_and_execute(&eng, update, &[c], &ExecuteConfig::default())
      .await
      .unwrap();
    assert!(r.is_success());
    assert_eq!(r.changed(), 3);
    assert!(deep.is_dir());

    // Second update: everything is unchanged.
    eng.targets.reset();
    let r = match_and_execute(&eng, update, &[c], &ExecuteConfig::default())
      .await
      .unwrap();
    assert_eq!(r.unchanged(), 3);
    assert_eq!(r.changed(), 0);

    // Clean removes them in reverse.
    eng.targets.reset();
    let clean = Action::new(PERFORM, CLEAN);
    let r = match_and_execute(&eng, clean, &[c], &ExecuteConfig::default())
      .await
      .unwrap();
    assert!(r.is_success());
    assert_eq!(r.changed(), 3);
    assert!(!tmp.path().join("a").exists());
  }

  #[tokio::test]
  async fn prerequisite_completes_before_dependent() {
    let tmp = TempDir::new().unwrap();
    let (eng, log) = log_engine(tmp.path());
    let (t, p) = file_with_prereq(&eng, tmp.path());

    let a = Action::new(PERFORM, UPDATE);
    match_and_execute(&eng, a, &[t], &ExecuteConfig::default())
      .await
      .unwrap();

    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec![p, t]);
  }

  #[tokio::test]
  async fn clean_inverts_execution_order() {
    let tmp = TempDir::new().unwrap();
    let (eng, log) = log_engine(tmp.path());
    let (t, p) = file_with_prereq(&eng, tmp.path());

    let a = Action::new(PERFORM, CLEAN);
    match_and_execute(&eng, a, &[t], &ExecuteConfig::default())
      .await
      .unwrap();

    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec![t, p]);
  }

  #[tokio::test]
  async fn recipe_runs_at_most_once() {
    let tmp = TempDir::new().unwrap();
    let (eng, log) = log_engine(tmp.path());
    let (t, _) = file_with_prereq(&eng, tmp.path());

    let a = Action::new(PERFORM, UPDATE);
    let cfg = ExecuteConfig::default();
    match_and_execute(&eng, a, &[t], &cfg).await.unwrap();
    let first = log.lock().unwrap().len();

    // A second execution without a reset observes memoized states.
    let r = execute(&eng, a, &[t], &cfg).await.unwrap();
    assert_eq!(log.lock().unwrap().len(), first);
    assert_eq!(r.state_of(t), Some(TargetState::Changed));
  }

  #[tokio::test]
  async fn failure_skips_dependents() {
    struct FailRule;
    impl Rule for FailRule {
      fn name(&self) -> &str {
        "test.fail"
      }
      fn matches(
        &self,
        _eng: &Engine,
        _a: Action,
        _t: &Target,
        _hint: &str,
      ) -> Result<Option<MatchData>, RuleError> {
        Ok(Some(MatchData::claim()))
      }
      fn apply(
        &self,
        eng: &Engine,
        a: Action,
        t: &Target,
        _data: MatchData,
      ) -> Result<Recipe, RuleError> {
        crate::rule::search_and_match(eng, a, t, None)?;
        if t.name == "p" {
          Ok(Recipe::Perform(Arc::new(|_, _, _| {
            Err(RecipeError::Fail("boom".to_string()))
          })))
        } else {
          Ok(Recipe::Default)
        }
      }
    }

    let tmp = TempDir::new().unwrap();
    let mut eng = Engine::new();
    let rs = eng.scopes.insert(tmp.path(), true);
    {
      let s = eng.scopes.get_mut(rs);
      s.meta_operations.insert(PERFORM_META);
      s.operations.insert(DEFAULT_OP);
      s.operations.insert(UPDATE_OP);
      s.operations.insert(CLEAN_OP);
      s.rules
        .insert(UPDATE, crate::target::types::TARGET, "", Arc::new(FailRule));
    }
    let eng = Arc::new(eng);
    let (t, p) = file_with_prereq(&eng, tmp.path());

    let a = Action::new(PERFORM, UPDATE);
    let r = match_and_execute(&eng, a, &[t], &ExecuteConfig::default())
      .await
      .unwrap();

    assert!(!r.is_success());
    assert_eq!(r.failed.len(), 1);
    assert_eq!(r.failed[0].0, p);
    assert_eq!(r.skipped.get(&t), Some(&p));
  }

  #[tokio::test]
  async fn postponed_is_retried_once() {
    use std::sync::atomic::AtomicUsize;

    struct PostponeOnce {
      tries: Arc<AtomicUsize>,
    }
    impl Rule for PostponeOnce {
      fn name(&self) -> &str {
        "test.postpone"
      }
      fn matches(
        &self,
        _eng: &Engine,
        _a: Action,
        _t: &Target,
        _hint: &str,
      ) -> Result<Option<MatchData>, RuleError> {
        Ok(Some(MatchData::claim()))
      }
      fn apply(
        &self,
        _eng: &Engine,
        _a: Action,
        _t: &Target,
        _data: MatchData,
      ) -> Result<Recipe, RuleError> {
        let tries = self.tries.clone();
        Ok(Recipe::Perform(Arc::new(move |_, _, _| {
          if tries.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(TargetState::Postponed)
          } else {
            Ok(TargetState::Changed)
          }
        })))
      }
    }

    let tmp = TempDir::new().unwrap();
    let mut eng = Engine::new();
    let rs = eng.scopes.insert(tmp.path(), true);
    let tries = Arc::new(AtomicUsize::new(0));
    {
      let s = eng.scopes.get_mut(rs);
      s.meta_operations.insert(PERFORM_META);
      s.operations.insert(DEFAULT_OP);
      s.operations.insert(UPDATE_OP);
      s.operations.insert(CLEAN_OP);
      s.rules.insert(
        UPDATE,
        crate::target::types::TARGET,
        "",
        Arc::new(PostponeOnce { tries: tries.clone() }),
      );
    }
    let eng = Arc::new(eng);

    let (t, _) = eng
      .targets
      .insert(&eng.exts, FILE, tmp.path(), Path::new(""), "x", Some(""));

    let a = Action::new(PERFORM, UPDATE);
    let r = match_and_execute(&eng, a, &[t], &ExecuteConfig::default())
      .await
      .unwrap();

    assert_eq!(tries.load(Ordering::SeqCst), 2);
    assert_eq!(r.state_of(t), Some(TargetState::Changed));
  }

  #[tokio::test]
  async fn cancellation_stops_execution() {
    let tmp = TempDir::new().unwrap();
    let (eng, log) = log_engine(tmp.path());
    let (t, _) = file_with_prereq(&eng, tmp.path());

    let cfg = ExecuteConfig::default();
    cfg.cancel.cancel();

    let a = Action::new(PERFORM, UPDATE);
    let err = match_and_execute(&eng, a, &[t], &cfg).await.unwrap_err();
    assert!(matches!(err, ExecuteError::Cancelled));
    assert!(log.lock().unwrap().is_empty());
  }
}
