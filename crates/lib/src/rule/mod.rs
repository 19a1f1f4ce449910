//! Rule registry and the two-phase match/apply protocol.
//!
//! A rule is identified within a scope by (operation, target type, name)
//! and registered with a hint string. Matching for an action enumerates
//! scopes from the target's base scope upward; at each scope the rules
//! registered for the operation and the target's type (or an ancestor
//! type) are tried in insertion order. A rule claims a target by returning
//! match data; the claim is then turned into a recipe by `apply`, which
//! typically resolves and matches the prerequisites, driving the match of
//! the downstream subgraph.
//!
//! Two claims without an explicit hint are an error unless one of the
//! rules is a declared fallback.

pub mod builtin;

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::action::{Action, OperationId};
use crate::name::Name;
use crate::target::types::{self, SearchKind, TargetTypeId};
use crate::target::{Recipe, Target, TargetError, TargetId};
use crate::Engine;

#[derive(Debug, Error)]
pub enum RuleError {
  #[error("rule {rule} does not support this operation")]
  UnsupportedOperation { rule: String },

  #[error("{0}")]
  Fail(String),

  #[error(transparent)]
  Target(#[from] TargetError),

  #[error(transparent)]
  Match(Box<MatchError>),
}

impl From<MatchError> for RuleError {
  fn from(e: MatchError) -> Self {
    RuleError::Match(Box::new(e))
  }
}

#[derive(Debug, Error)]
pub enum MatchError {
  /// The `no-rule` failure.
  #[error("no rule to perform {action} for target {target}")]
  NoRule { action: Action, target: String },

  /// The `ambiguous-match` failure, naming both claimants.
  #[error("multiple rules matching target {target}: {rule1} and {rule2}")]
  Ambiguous {
    target: String,
    rule1: String,
    rule2: String,
  },

  #[error("no explicit target for prerequisite {name}")]
  NoExplicitTarget { name: String },

  #[error("unknown target type '{0}'")]
  UnknownTargetType(String),

  #[error(transparent)]
  Target(#[from] TargetError),

  #[error(transparent)]
  Rule(Box<RuleError>),
}

impl From<RuleError> for MatchError {
  fn from(e: RuleError) -> Self {
    MatchError::Rule(Box::new(e))
  }
}

/// Opaque token returned by a rule's match, signalling a claim and
/// carrying per-target per-action state through to apply.
pub struct MatchData(Option<Arc<dyn Any + Send + Sync>>);

impl MatchData {
  pub fn claim() -> Self {
    MatchData(None)
  }

  pub fn with<T: Any + Send + Sync>(v: T) -> Self {
    MatchData(Some(Arc::new(v)))
  }

  pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
    self.0.as_deref().and_then(|v| v.downcast_ref())
  }
}

/// A rule: the match/apply capability pair.
pub trait Rule: Send + Sync {
  fn name(&self) -> &str;

  /// Declared fallback rules never cause ambiguity and are consulted only
  /// when no ordinary rule claims the target.
  fn fallback(&self) -> bool {
    false
  }

  fn matches(
    &self,
    eng: &Engine,
    a: Action,
    t: &Target,
    hint: &str,
  ) -> Result<Option<MatchData>, RuleError>;

  fn apply(&self, eng: &Engine, a: Action, t: &Target, data: MatchData)
    -> Result<Recipe, RuleError>;
}

pub struct RuleEntry {
  pub hint: String,
  pub rule: Arc<dyn Rule>,
}

/// Per-scope rule registrations: (operation, target type) to an ordered
/// rule list.
#[derive(Default)]
pub struct RuleMap {
  map: HashMap<(OperationId, TargetTypeId), Vec<RuleEntry>>,
}

impl RuleMap {
  pub fn insert(
    &mut self,
    op: OperationId,
    ty: TargetTypeId,
    hint: impl Into<String>,
    rule: Arc<dyn Rule>,
  ) {
    self.map.entry((op, ty)).or_default().push(RuleEntry {
      hint: hint.into(),
      rule,
    });
  }

  pub fn rules_for(&self, op: OperationId, ty: TargetTypeId) -> &[RuleEntry] {
    self.map.get(&(op, ty)).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }
}

/// Match a target for an action, installing the chosen rule's recipe.
///
/// Matching a target that is itself in the middle of being matched is a
/// dependency cycle.
pub fn match_target(eng: &Engine, a: Action, id: TargetId, hint: &str) -> Result<(), MatchError> {
  let t = eng.targets.get(id);
  if !t.start_match(a)? {
    trace!(target = %eng.display(&t), "already matched");
    return Ok(());
  }

  let r = match_impl(eng, a, &t, hint);
  if r.is_err() {
    t.abandon_match();
  }
  r
}

fn match_impl(eng: &Engine, a: Action, t: &Target, hint: &str) -> Result<(), MatchError> {
  let op = a.operation();
  let chain = eng.types.chain(t.ty);

  let mut scope = Some(eng.base_scope(t));
  while let Some(sid) = scope {
    let s = eng.scopes.get(sid);

    let mut claims: Vec<(&RuleEntry, MatchData)> = Vec::new();
    let mut fallback: Option<(&RuleEntry, MatchData)> = None;

    for ty in &chain {
      for e in s.rules.rules_for(op, *ty) {
        if !hint.is_empty() && !e.hint.starts_with(hint) {
          continue;
        }
        if let Some(data) = e.rule.matches(eng, a, t, hint)? {
          if e.rule.fallback() {
            if fallback.is_none() {
              fallback = Some((e, data));
            }
          } else {
            claims.push((e, data));
          }
        }
      }
    }

    if claims.len() > 1 && hint.is_empty() {
      return Err(MatchError::Ambiguous {
        target: eng.display(t),
        rule1: claims[0].0.rule.name().to_string(),
        rule2: claims[1].0.rule.name().to_string(),
      });
    }

    if let Some((e, data)) = claims.into_iter().next().or(fallback) {
      debug!(target = %eng.display(t), rule = e.rule.name(), "matched");
      let recipe = e.rule.apply(eng, a, t, data)?;
      t.install_recipe(a, recipe)?;
      return Ok(());
    }

    scope = eng.scopes.parent_scope(sid);
  }

  Err(MatchError::NoRule {
    action: a,
    target: eng.display(t),
  })
}

/// Resolve a prerequisite name's target type: the explicit tag if present,
/// otherwise `dir` for directory names and `file` for the rest.
pub fn resolve_type(eng: &Engine, n: &Name) -> Result<TargetTypeId, MatchError> {
  match &n.ty {
    Some(t) => eng
      .types
      .find(t)
      .ok_or_else(|| MatchError::UnknownTargetType(t.clone())),
    None => Ok(if n.is_directory() {
      types::DIR
    } else {
      types::FILE
    }),
  }
}

/// Intern the target a name denotes, relative to a base directory. Used
/// both for declarations and (via [`search`]) prerequisite resolution.
pub fn enter_target(eng: &Engine, base_dir: &Path, n: &Name) -> Result<TargetId, MatchError> {
  let ty = resolve_type(eng, n)?;
  let dir = n.resolve_dir(base_dir);
  let (name, ext) = if eng.types.is_a(ty, types::FILE) {
    n.split_extension()
  } else {
    (n.value.as_str(), None)
  };
  let (id, _) = eng
    .targets
    .insert(&eng.exts, ty, &dir, Path::new(""), name, ext);
  Ok(id)
}

/// Resolve a prerequisite to a target, per the target type's search
/// behavior.
pub fn search(eng: &Engine, dependent: &Target, n: &Name) -> Result<TargetId, MatchError> {
  let ty = resolve_type(eng, n)?;
  let info = eng.types.get(ty);
  let dir = n.resolve_dir(&dependent.dir);

  match info.search {
    // An alias with no explicit target would silently do nothing, which
    // is most likely not what was intended.
    SearchKind::Alias => {
      let id = eng
        .targets
        .find(&eng.exts, ty, &dir, Path::new(""), &n.value, None);
      id.ok_or_else(|| MatchError::NoExplicitTarget {
        name: n.to_string(),
      })
    }
    SearchKind::File | SearchKind::Target => enter_target(eng, &dependent.dir, n),
  }
}

/// Resolve and match all of a target's declared prerequisites,
/// incrementing each prerequisite's dependents count.
///
/// With a directory filter, prerequisites outside the directory are
/// skipped (used by clean).
pub fn search_and_match(
  eng: &Engine,
  a: Action,
  t: &Target,
  filter_dir: Option<&Path>,
) -> Result<(), MatchError> {
  for n in t.prerequisites() {
    if let Some(d) = filter_dir {
      let pdir = n.resolve_dir(&t.dir);
      if !pdir.starts_with(d) {
        continue;
      }
    }

    let pid = search(eng, t, &n)?;
    eng.targets.get(pid).inc_dependents();
    t.push_prerequisite_target(pid);
    match_target(eng, a, pid, "")?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::{Action, PERFORM, UPDATE};
  use crate::target::types::FILE;
  use crate::target::TargetState;

  /// A rule that always claims and installs a noop recipe.
  struct ClaimAll {
    name: &'static str,
  }

  impl Rule for ClaimAll {
    fn name(&self) -> &str {
      self.name
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
      Ok(Recipe::Noop)
    }
  }

  fn engine_with_root() -> (Engine, crate::scope::ScopeId) {
    let mut eng = Engine::new();
    let root = eng.scopes.insert(Path::new("/prj"), true);
    (eng, root)
  }

  fn file_target(eng: &Engine) -> TargetId {
    let (id, _) = eng.targets.insert(
      &eng.exts,
      FILE,
      Path::new("/prj"),
      Path::new(""),
      "hello",
      Some(""),
    );
    id
  }

  #[test]
  fn single_rule_matches() {
    let (mut eng, root) = engine_with_root();
    eng.scopes.get_mut(root).rules.insert(
      UPDATE,
      FILE,
      "",
      Arc::new(ClaimAll { name: "test.claim" }),
    );

    let id = file_target(&eng);
    match_target(&eng, Action::new(PERFORM, UPDATE), id, "").unwrap();

    let t = eng.targets.get(id);
    assert_eq!(t.state(), TargetState::Unchanged); // Noop recipe.
  }

  #[test]
  fn ambiguous_match_names_both_rules() {
    let (mut eng, root) = engine_with_root();
    {
      let rules = &mut eng.scopes.get_mut(root).rules;
      rules.insert(UPDATE, FILE, "", Arc::new(ClaimAll { name: "a.one" }));
      rules.insert(UPDATE, FILE, "", Arc::new(ClaimAll { name: "b.two" }));
    }

    let id = file_target(&eng);
    let err = match_target(&eng, Action::new(PERFORM, UPDATE), id, "").unwrap_err();
    match err {
      MatchError::Ambiguous { rule1, rule2, .. } => {
        assert_eq!(rule1, "a.one");
        assert_eq!(rule2, "b.two");
      }
      other => panic!("expected ambiguous match, got {other}"),
    }
  }

  #[test]
  fn hint_disambiguates() {
    let (mut eng, root) = engine_with_root();
    {
      let rules = &mut eng.scopes.get_mut(root).rules;
      rules.insert(UPDATE, FILE, "one", Arc::new(ClaimAll { name: "a.one" }));
      rules.insert(UPDATE, FILE, "two", Arc::new(ClaimAll { name: "b.two" }));
    }

    let id = file_target(&eng);
    match_target(&eng, Action::new(PERFORM, UPDATE), id, "tw").unwrap();
  }

  #[test]
  fn no_rule_fails() {
    let (eng, _) = engine_with_root();
    let id = file_target(&eng);
    let err = match_target(&eng, Action::new(PERFORM, UPDATE), id, "").unwrap_err();
    assert!(matches!(err, MatchError::NoRule { .. }));
  }

  #[test]
  fn rules_on_base_types_apply() {
    let (mut eng, root) = engine_with_root();
    // Register on path_target; a file target should still match via the
    // inheritance chain.
    eng.scopes.get_mut(root).rules.insert(
      UPDATE,
      types::PATH_TARGET,
      "",
      Arc::new(ClaimAll { name: "base.rule" }),
    );

    let id = file_target(&eng);
    match_target(&eng, Action::new(PERFORM, UPDATE), id, "").unwrap();
  }

  #[test]
  fn outer_scope_rules_found() {
    let (mut eng, root) = engine_with_root();
    eng.scopes.insert(Path::new("/prj/sub"), false);
    eng.scopes.get_mut(root).rules.insert(
      UPDATE,
      FILE,
      "",
      Arc::new(ClaimAll { name: "outer.rule" }),
    );

    let (id, _) = eng.targets.insert(
      &eng.exts,
      FILE,
      Path::new("/prj/sub"),
      Path::new(""),
      "x",
      Some(""),
    );
    match_target(&eng, Action::new(PERFORM, UPDATE), id, "").unwrap();
  }

  #[test]
  fn match_determinism() {
    // With a fixed registration order the same rule wins every time.
    for _ in 0..3 {
      let (mut eng, root) = engine_with_root();
      eng.scopes.get_mut(root).rules.insert(
        UPDATE,
        FILE,
        "one",
        Arc::new(ClaimAll { name: "a.one" }),
      );

      let id = file_target(&eng);
      match_target(&eng, Action::new(PERFORM, UPDATE), id, "one").unwrap();
      let t = eng.targets.get(id);
      assert_eq!(t.state(), TargetState::Unchanged);
    }
  }

  #[test]
  fn search_creates_file_target() {
    let (eng, _) = engine_with_root();
    let dep = eng.targets.get(file_target(&eng));

    let n = Name::parse("file{world.txt}").unwrap();
    let id = search(&eng, &dep, &n).unwrap();
    let t = eng.targets.get(id);
    assert_eq!(t.name, "world");
    assert_eq!(t.ext(), Some(eng.exts.intern("txt")));
    assert_eq!(t.dir, Path::new("/prj"));
  }

  #[test]
  fn search_alias_requires_explicit_target() {
    let (eng, _) = engine_with_root();
    let dep = eng.targets.get(file_target(&eng));

    let n = Name::parse("alias{all}").unwrap();
    let err = search(&eng, &dep, &n).unwrap_err();
    assert!(matches!(err, MatchError::NoExplicitTarget { .. }));
  }

  #[test]
  fn search_unknown_type_fails() {
    let (eng, _) = engine_with_root();
    let dep = eng.targets.get(file_target(&eng));

    let n = Name::parse("exe{tool}").unwrap();
    assert!(matches!(
      search(&eng, &dep, &n),
      Err(MatchError::UnknownTargetType(_))
    ));
  }
}
