//! The hierarchical scope tree.
//!
//! Scopes form a tree rooted at the global scope. Each scope is keyed by
//! its absolute out path; `find` returns the deepest scope containing a
//! path. A *root* scope is one carrying both `out_root` and `src_root`
//! (set up by the loader); root scopes additionally own the meta-operation
//! and operation tables and the per-scope rule map.
//!
//! Scope maps are mutated only during the (serial) load phase; execution
//! reads them lock-free.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::action::{MetaOperationInfo, OperationInfo, OperationTable};
use crate::rule::RuleMap;
use crate::util::normalize;
use crate::variable::{apply_overrides, Value, ValueError, VarId, VarMap, VarPool, Visibility};

#[derive(Debug, Error)]
pub enum ScopeError {
  #[error("scope src path already set to {existing}, refusing {new}")]
  SrcPathMismatch { existing: PathBuf, new: PathBuf },
}

/// A stable reference into the scope tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u32);

impl ScopeId {
  pub const GLOBAL: ScopeId = ScopeId(0);

  fn index(self) -> usize {
    self.0 as usize
  }
}

pub struct Scope {
  pub id: ScopeId,
  pub out_path: PathBuf,
  src_path: Option<PathBuf>,
  pub parent: Option<ScopeId>,
  pub root: bool,
  detached: bool,

  pub vars: VarMap,
  pub rules: RuleMap,

  /// Buildfiles already sourced into this scope (once semantics).
  pub buildfiles: HashSet<PathBuf>,

  pub meta_operations: OperationTable<MetaOperationInfo>,
  pub operations: OperationTable<OperationInfo>,

  /// Modules loaded into this scope.
  pub modules: HashSet<String>,
}

impl Scope {
  fn new(id: ScopeId, out_path: PathBuf, parent: Option<ScopeId>) -> Self {
    Self {
      id,
      out_path,
      src_path: None,
      parent,
      root: false,
      detached: false,
      vars: VarMap::new(),
      rules: RuleMap::default(),
      buildfiles: HashSet::new(),
      meta_operations: OperationTable::default(),
      operations: OperationTable::default(),
      modules: HashSet::new(),
    }
  }

  pub fn src_path(&self) -> Option<&PathBuf> {
    self.src_path.as_ref()
  }

  /// The source directory corresponding to this scope, falling back to the
  /// out path for in-source builds.
  pub fn src_or_out(&self) -> &PathBuf {
    self.src_path.as_ref().unwrap_or(&self.out_path)
  }

  /// Set the src path. Once set it is immutable; re-setting to the same
  /// value is allowed.
  pub fn set_src_path(&mut self, p: PathBuf) -> Result<(), ScopeError> {
    match &self.src_path {
      Some(existing) if *existing != p => Err(ScopeError::SrcPathMismatch {
        existing: existing.clone(),
        new: p,
      }),
      _ => {
        self.src_path = Some(p);
        Ok(())
      }
    }
  }

  pub fn is_root(&self) -> bool {
    self.root
  }
}

/// The scope tree. Scopes are owned by an arena for the life of the
/// process; references are by [`ScopeId`].
pub struct ScopeTree {
  scopes: Vec<Scope>,
  by_path: BTreeMap<PathBuf, ScopeId>,
}

impl Default for ScopeTree {
  fn default() -> Self {
    Self::new()
  }
}

impl ScopeTree {
  pub fn new() -> Self {
    let global = Scope::new(ScopeId::GLOBAL, PathBuf::new(), None);
    Self {
      scopes: vec![global],
      by_path: BTreeMap::new(),
    }
  }

  pub fn global(&self) -> &Scope {
    &self.scopes[0]
  }

  pub fn global_mut(&mut self) -> &mut Scope {
    &mut self.scopes[0]
  }

  pub fn get(&self, id: ScopeId) -> &Scope {
    &self.scopes[id.index()]
  }

  pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
    &mut self.scopes[id.index()]
  }

  /// Insert a scope for an out directory, or find the existing one.
  pub fn insert(&mut self, out_dir: &Path, root: bool) -> ScopeId {
    let out = normalize(out_dir);

    if let Some(&id) = self.by_path.get(&out) {
      if root {
        self.scopes[id.index()].root = true;
      }
      return id;
    }

    let parent = self.find(&out);
    let id = ScopeId(self.scopes.len() as u32);
    let mut scope = Scope::new(id, out.clone(), Some(parent));
    scope.root = root;
    self.scopes.push(scope);

    // Existing children of the parent that now fall under the new scope
    // get re-parented.
    for s in &mut self.scopes {
      if s.id != id
        && s.id != ScopeId::GLOBAL
        && !s.detached
        && s.parent == Some(parent)
        && s.out_path.starts_with(&out)
      {
        s.parent = Some(id);
      }
    }

    self.by_path.insert(out, id);
    id
  }

  /// Create a temporary scope that is not registered in the path index.
  ///
  /// Used by import to evaluate export stubs without leaking variables
  /// into the importing scope.
  pub fn create_detached(&mut self, parent: ScopeId) -> ScopeId {
    let out = self.get(parent).out_path.clone();
    let id = ScopeId(self.scopes.len() as u32);
    let mut scope = Scope::new(id, out, Some(parent));
    scope.detached = true;
    self.scopes.push(scope);
    id
  }

  /// Find the deepest scope containing a path (the global scope if none).
  pub fn find(&self, path: &Path) -> ScopeId {
    let mut p = normalize(path);
    loop {
      if let Some(&id) = self.by_path.get(&p) {
        return id;
      }
      if !p.pop() {
        return ScopeId::GLOBAL;
      }
    }
  }

  pub fn parent_scope(&self, id: ScopeId) -> Option<ScopeId> {
    self.get(id).parent
  }

  /// The nearest enclosing root scope, including the scope itself. None
  /// only when the chain reaches the global scope without finding one.
  pub fn root_scope(&self, id: ScopeId) -> Option<ScopeId> {
    let mut cur = Some(id);
    while let Some(s) = cur {
      if self.get(s).root {
        return Some(s);
      }
      cur = self.get(s).parent;
    }
    None
  }

  /// Find a variable's original value (no overrides applied) along the
  /// scope chain, together with the depth it was found at (1 for the
  /// starting scope).
  ///
  /// Visibility limits the walk: `scope` stops after the starting scope,
  /// `project` stops at the enclosing root scope boundary.
  pub fn find_original(
    &self,
    pool: &VarPool,
    scope: ScopeId,
    var: VarId,
  ) -> (Option<Value>, usize) {
    let visibility = pool.get(var).visibility;

    let mut depth = 0;
    let mut cur = Some(scope);
    while let Some(id) = cur {
      depth += 1;
      let s = self.get(id);
      if let Some(v) = s.vars.get(var) {
        return (Some(v.clone()), depth);
      }

      match visibility {
        Visibility::Scope | Visibility::Target | Visibility::Prerequisite => return (None, depth),
        Visibility::Project if s.root => return (None, depth),
        _ => {}
      }

      cur = s.parent;
    }

    (None, depth)
  }

  /// Look up a variable at a scope, combining the original value with the
  /// applicable override chain.
  pub fn find_var(
    &self,
    pool: &VarPool,
    scope: ScopeId,
    var: VarId,
  ) -> Result<Option<Value>, ValueError> {
    let (original, _) = self.find_original(pool, scope, var);
    apply_overrides(pool, var, original, &self.get(scope).out_path)
  }

  pub fn len(&self) -> usize {
    self.scopes.len()
  }

  pub fn is_empty(&self) -> bool {
    false // The global scope always exists.
  }
}
