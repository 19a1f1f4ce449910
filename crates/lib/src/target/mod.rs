//! Targets and the interned target set.
//!
//! A target is anything addressable by a path: a file, an alias, a
//! filesystem directory. Targets are owned by the process-wide
//! [`TargetSet`], keyed by (type, dir, out, name, extension); references
//! elsewhere are stable [`TargetId`] handles. Once a target is interned the
//! only mutable aspects are its variables, prerequisites, resolved
//! prerequisite targets, recipe/action, execution state, and (monotonically)
//! its extension.

pub mod types;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use thiserror::Error;

use crate::action::Action;
use crate::intern::{Sym, SymPool};
use crate::name::Name;
use crate::util::normalize;
use crate::variable::VarMap;

use types::{TargetTypeId, TypeRegistry};

#[derive(Debug, Error)]
pub enum TargetError {
  #[error("target {target}: extension already {existing}, refusing {new}")]
  ExtensionConflict {
    target: String,
    existing: String,
    new: String,
  },

  #[error("path mismatch for target {target}: assigned '{assigned}', derived '{derived}'")]
  PathMismatch {
    target: String,
    assigned: PathBuf,
    derived: PathBuf,
  },

  #[error("no default extension for target {target}")]
  NoDefaultExtension { target: String },

  #[error("recipe override for target {target}: only a stronger action may supersede")]
  RecipeOverride { target: String },

  #[error("dependency cycle detected at target {target}")]
  DependencyCycle { target: String },
}

/// Execution outcome of a target's recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
  Unknown,
  Unchanged,
  Postponed,
  Changed,
  Failed,
  Group,
}

impl fmt::Display for TargetState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TargetState::Unknown => "unknown",
      TargetState::Unchanged => "unchanged",
      TargetState::Postponed => "postponed",
      TargetState::Changed => "changed",
      TargetState::Failed => "failed",
      TargetState::Group => "group",
    };
    f.write_str(s)
  }
}

/// Per-target match/execute phase. Transitions are monotonic within one
/// operation: unknown, touched (match in progress), matched (recipe
/// installed), executing, done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Unknown,
  Touched,
  Matched,
  Executing,
  Done,
}

/// An error surfaced by a recipe.
#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("{0}")]
  Fail(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// The callable a rule installs on a target for an action.
pub type RecipeFn =
  Arc<dyn Fn(&crate::Engine, Action, TargetId) -> Result<TargetState, RecipeError> + Send + Sync>;

#[derive(Clone)]
pub enum Recipe {
  /// Nothing to do.
  Noop,
  /// Forward to prerequisites: changed if any prerequisite changed.
  Default,
  /// Delegate to the group's recipe.
  Group,
  Perform(RecipeFn),
}

impl fmt::Debug for Recipe {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Recipe::Noop => "noop",
      Recipe::Default => "default",
      Recipe::Group => "group",
      Recipe::Perform(_) => "perform",
    };
    f.write_str(s)
  }
}

struct ExecState {
  phase: Phase,
  action: Option<Action>,
  recipe: Option<Recipe>,
  state: TargetState,
}

impl ExecState {
  fn new() -> Self {
    Self {
      phase: Phase::Unknown,
      action: None,
      recipe: None,
      state: TargetState::Unknown,
    }
  }
}

/// Outcome of [`Target::begin_execute`].
pub enum ExecuteStart {
  /// Run this recipe.
  Run(Recipe),
  /// Already executed for this action; here is the terminal state.
  Done(TargetState),
}

/// A stable reference into the target set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u32);

impl TargetId {
  fn index(self) -> usize {
    self.0 as usize
  }
}

pub struct Target {
  pub id: TargetId,
  pub ty: TargetTypeId,

  /// Out directory of the target.
  pub dir: PathBuf,

  /// Out directory when the target is sourced from the src tree;
  /// empty otherwise.
  pub out: PathBuf,

  pub name: String,

  ext: RwLock<Option<Sym>>,

  pub vars: RwLock<VarMap>,

  prerequisites: RwLock<Vec<Name>>,
  prerequisite_targets: RwLock<Vec<TargetId>>,

  group: RwLock<Option<TargetId>>,

  exec: Mutex<ExecState>,
  dependents: AtomicUsize,

  path: RwLock<Option<PathBuf>>,
}

impl Target {
  fn new(
    id: TargetId,
    ty: TargetTypeId,
    dir: PathBuf,
    out: PathBuf,
    name: String,
    ext: Option<Sym>,
  ) -> Self {
    Self {
      id,
      ty,
      dir,
      out,
      name,
      ext: RwLock::new(ext),
      vars: RwLock::new(VarMap::new()),
      prerequisites: RwLock::new(Vec::new()),
      prerequisite_targets: RwLock::new(Vec::new()),
      group: RwLock::new(None),
      exec: Mutex::new(ExecState::new()),
      dependents: AtomicUsize::new(0),
      path: RwLock::new(None),
    }
  }

  pub fn ext(&self) -> Option<Sym> {
    *self.ext.read().unwrap()
  }

  /// Upgrade the extension. Unspecified-to-specified is allowed (and
  /// idempotent for the same value); anything else is an error.
  pub fn update_ext(&self, pool: &SymPool, ext: &str) -> Result<(), TargetError> {
    let sym = pool.intern(ext);
    let mut cur = self.ext.write().unwrap();
    match *cur {
      None => {
        *cur = Some(sym);
        Ok(())
      }
      Some(existing) if existing == sym => Ok(()),
      Some(existing) => Err(TargetError::ExtensionConflict {
        target: self.name.clone(),
        existing: pool.resolve(existing),
        new: ext.to_string(),
      }),
    }
  }

  pub fn add_prerequisite(&self, n: Name) {
    self.prerequisites.write().unwrap().push(n);
  }

  pub fn prerequisites(&self) -> Vec<Name> {
    self.prerequisites.read().unwrap().clone()
  }

  pub fn has_prerequisites(&self) -> bool {
    !self.prerequisites.read().unwrap().is_empty()
  }

  pub fn push_prerequisite_target(&self, id: TargetId) {
    self.prerequisite_targets.write().unwrap().push(id);
  }

  pub fn prerequisite_targets(&self) -> Vec<TargetId> {
    self.prerequisite_targets.read().unwrap().clone()
  }

  pub fn group(&self) -> Option<TargetId> {
    *self.group.read().unwrap()
  }

  pub fn set_group(&self, g: Option<TargetId>) {
    *self.group.write().unwrap() = g;
  }

  pub fn path(&self) -> Option<PathBuf> {
    self.path.read().unwrap().clone()
  }

  /// Assign the derived path; assigning a different path than an existing
  /// one is an error.
  pub fn set_path(&self, p: PathBuf) -> Result<(), TargetError> {
    let mut cur = self.path.write().unwrap();
    match &*cur {
      Some(existing) if *existing != p => Err(TargetError::PathMismatch {
        target: self.name.clone(),
        assigned: existing.clone(),
        derived: p,
      }),
      _ => {
        *cur = Some(p);
        Ok(())
      }
    }
  }

  /// The file modification time, as observed from the filesystem.
  pub fn mtime(&self) -> Option<SystemTime> {
    let p = self.path()?;
    std::fs::metadata(&p).and_then(|m| m.modified()).ok()
  }

  pub fn dependents(&self) -> usize {
    self.dependents.load(Ordering::SeqCst)
  }

  pub fn inc_dependents(&self) {
    self.dependents.fetch_add(1, Ordering::SeqCst);
  }

  pub fn dec_dependents(&self) {
    let _ = self
      .dependents
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
  }

  /// Begin matching for an action.
  ///
  /// Returns `Ok(true)` to proceed, `Ok(false)` when a recipe for this
  /// action is already installed, and a dependency-cycle error when the
  /// target is currently being matched.
  pub fn start_match(&self, a: Action) -> Result<bool, TargetError> {
    let mut es = self.exec.lock().unwrap();
    match es.phase {
      Phase::Touched => Err(TargetError::DependencyCycle {
        target: self.name.clone(),
      }),
      Phase::Matched | Phase::Executing | Phase::Done if es.action == Some(a) => Ok(false),
      _ => {
        es.phase = Phase::Touched;
        Ok(true)
      }
    }
  }

  /// Roll back an in-progress match after a failure so the target does
  /// not read as a dependency cycle to later diagnostics.
  pub fn abandon_match(&self) {
    let mut es = self.exec.lock().unwrap();
    if es.phase == Phase::Touched {
      es.phase = Phase::Unknown;
    }
  }

  /// Install a recipe for an action.
  ///
  /// An installed recipe may only be replaced when re-matching for the
  /// same action (and then only a noop recipe may be overridden) or when
  /// the new action strictly supersedes the old one.
  pub fn install_recipe(&self, a: Action, r: Recipe) -> Result<(), TargetError> {
    let mut es = self.exec.lock().unwrap();

    let mut overriding = false;
    if let Some(cur) = es.action {
      if cur == a {
        if es.recipe.is_some() && !matches!(es.recipe, Some(Recipe::Noop)) {
          return Err(TargetError::RecipeOverride {
            target: self.name.clone(),
          });
        }
        overriding = es.recipe.is_some();
      } else if !a.supersedes(cur) {
        return Err(TargetError::RecipeOverride {
          target: self.name.clone(),
        });
      } else {
        overriding = true;
      }
    }

    es.action = Some(a);
    es.state = if matches!(r, Recipe::Noop) {
      // Mark unchanged up front so no time is wasted executing it.
      TargetState::Unchanged
    } else {
      TargetState::Unknown
    };
    es.recipe = Some(r);
    es.phase = Phase::Matched;

    if !overriding {
      self.dependents.store(0, Ordering::SeqCst);
    }
    Ok(())
  }

  /// Begin executing; at most one execution happens per (action, target).
  pub fn begin_execute(&self) -> ExecuteStart {
    let mut es = self.exec.lock().unwrap();
    if es.phase == Phase::Done {
      return ExecuteStart::Done(es.state);
    }
    es.phase = Phase::Executing;
    match es.recipe.clone() {
      Some(r) => ExecuteStart::Run(r),
      None => ExecuteStart::Run(Recipe::Noop),
    }
  }

  /// Record the terminal state.
  pub fn finish_execute(&self, st: TargetState) {
    let mut es = self.exec.lock().unwrap();
    es.phase = Phase::Done;
    es.state = st;
  }

  /// Re-arm a postponed target for the retry pass.
  pub fn retry_postponed(&self) -> Option<Recipe> {
    let mut es = self.exec.lock().unwrap();
    if es.phase == Phase::Done && es.state == TargetState::Postponed {
      es.phase = Phase::Executing;
      es.recipe.clone()
    } else {
      None
    }
  }

  pub fn phase(&self) -> Phase {
    self.exec.lock().unwrap().phase
  }

  pub fn state(&self) -> TargetState {
    self.exec.lock().unwrap().state
  }

  pub fn action(&self) -> Option<Action> {
    self.exec.lock().unwrap().action
  }

  pub fn matched_recipe(&self) -> Option<Recipe> {
    self.exec.lock().unwrap().recipe.clone()
  }

  /// Clear per-operation state, keeping the interned identity.
  pub fn reset(&self) {
    *self.exec.lock().unwrap() = ExecState::new();
    self.prerequisite_targets.write().unwrap().clear();
    self.dependents.store(0, Ordering::SeqCst);
  }

  /// Derive and assign the target's filesystem path from dir, name, and
  /// extension (deriving the extension first if unspecified).
  pub fn derive_path(&self, eng: &crate::Engine) -> Result<PathBuf, TargetError> {
    if let Some(p) = self.path() {
      return Ok(p);
    }

    if self.ext().is_none() {
      let scope = eng.base_scope(self);
      let derived = eng
        .types
        .get(self.ty)
        .derive_ext
        .and_then(|f| f(eng, scope, &self.name));
      match derived {
        Some(e) => self.update_ext(&eng.exts, &e)?,
        None => {
          return Err(TargetError::NoDefaultExtension {
            target: self.name.clone(),
          });
        }
      }
    }

    let mut n = self.name.clone();
    if let Some(sym) = self.ext() {
      let e = eng.exts.resolve(sym);
      if !e.is_empty() {
        n.push('.');
        n.push_str(&e);
      }
    }

    let p = self.dir.join(n);
    self.set_path(p.clone())?;
    Ok(p)
  }

  /// Render the target the way diagnostics print it: `dir/type{name.ext}`.
  pub fn display_name(&self, types: &TypeRegistry, pool: &SymPool) -> String {
    let tn = &types.get(self.ty).name;
    let mut s = String::new();
    if self.name.is_empty() {
      s.push_str(&format!("{}{{{}/}}", tn, self.dir.display()));
    } else {
      s.push_str(&format!("{}/{}{{{}", self.dir.display(), tn, self.name));
      if let Some(sym) = self.ext() {
        let e = pool.resolve(sym);
        if !e.is_empty() {
          s.push('.');
          s.push_str(&e);
        }
      }
      s.push('}');
    }
    s
  }
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct TargetKey {
  ty: TargetTypeId,
  dir: PathBuf,
  out: PathBuf,
  name: String,
}

#[derive(Default)]
struct SetInner {
  arena: Vec<Arc<Target>>,
  // Targets differing only in extension share a bucket; an unspecified
  // extension matches any entry.
  by_key: std::collections::HashMap<TargetKey, Vec<TargetId>>,
}

/// The global interned target set.
#[derive(Default)]
pub struct TargetSet {
  inner: RwLock<SetInner>,
}

impl TargetSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Intern a target, returning its id and whether it was inserted.
  pub fn insert(
    &self,
    pool: &SymPool,
    ty: TargetTypeId,
    dir: &Path,
    out: &Path,
    name: &str,
    ext: Option<&str>,
  ) -> (TargetId, bool) {
    let key = TargetKey {
      ty,
      dir: normalize(dir),
      out: if out.as_os_str().is_empty() {
        PathBuf::new()
      } else {
        normalize(out)
      },
      name: name.to_string(),
    };

    let mut inner = self.inner.write().unwrap();

    if let Some(bucket) = inner.by_key.get(&key) {
      match ext {
        // An unspecified extension is assumed to refer to the same target.
        None => return (bucket[0], false),
        Some(e) => {
          let sym = pool.intern(e);
          for &id in bucket {
            if inner.arena[id.index()].ext() == Some(sym) {
              return (id, false);
            }
          }
          for &id in bucket {
            let t = &inner.arena[id.index()];
            if t.ext().is_none() {
              // Monotonic upgrade: unspecified becomes specified.
              *t.ext.write().unwrap() = Some(sym);
              return (id, false);
            }
          }
        }
      }
    }

    let id = TargetId(inner.arena.len() as u32);
    let ext_sym = ext.map(|e| pool.intern(e));
    let t = Target::new(
      id,
      ty,
      key.dir.clone(),
      key.out.clone(),
      key.name.clone(),
      ext_sym,
    );
    inner.arena.push(Arc::new(t));
    inner.by_key.entry(key).or_default().push(id);
    (id, true)
  }

  /// Look up a target without interning.
  pub fn find(
    &self,
    pool: &SymPool,
    ty: TargetTypeId,
    dir: &Path,
    out: &Path,
    name: &str,
    ext: Option<&str>,
  ) -> Option<TargetId> {
    let key = TargetKey {
      ty,
      dir: normalize(dir),
      out: if out.as_os_str().is_empty() {
        PathBuf::new()
      } else {
        normalize(out)
      },
      name: name.to_string(),
    };

    let inner = self.inner.read().unwrap();
    let bucket = inner.by_key.get(&key)?;
    match ext {
      None => bucket.first().copied(),
      Some(e) => {
        let sym = pool.find(e)?;
        bucket
          .iter()
          .copied()
          .find(|&id| inner.arena[id.index()].ext() == Some(sym))
      }
    }
  }

  pub fn get(&self, id: TargetId) -> Arc<Target> {
    self.inner.read().unwrap().arena[id.index()].clone()
  }

  pub fn len(&self) -> usize {
    self.inner.read().unwrap().arena.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn ids(&self) -> Vec<TargetId> {
    (0..self.len() as u32).map(TargetId).collect()
  }

  /// Clear all per-operation state, e.g. between a meta-operation's
  /// operations. Interned targets and their declared prerequisites stay.
  pub fn reset(&self) {
    let inner = self.inner.read().unwrap();
    for t in &inner.arena {
      t.reset();
    }
  }
}
