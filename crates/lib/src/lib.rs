//! girder-lib: the core of the girder build engine.
//!
//! The engine compiles a declarative project description into a graph of
//! typed targets bound to recipes and executes that graph to bring the
//! targets up to date for a chosen operation:
//! - `scope`: the hierarchical namespace of variables and rules
//! - `target`: the target type system and the interned target set
//! - `rule`: the two-phase match/apply protocol
//! - `execute`: the parallel dependency executor
//! - `load`: project bootstrap, cross-project import, buildfile reading
//! - `script`: the test-script runner
//!
//! The buildfile lexer/parser proper and per-language rule modules live
//! outside this crate; they talk to the engine through [`Engine`] and the
//! per-module entry points re-exported here.

pub mod action;
pub mod diag;
pub mod execute;
pub mod function;
pub mod intern;
pub mod load;
pub mod manifest;
pub mod name;
pub mod rule;
pub mod scope;
pub mod script;
pub mod target;
pub mod util;
pub mod variable;

use std::path::PathBuf;

use function::FunctionMap;
use intern::SymPool;
use scope::{ScopeId, ScopeTree};
use target::types::TypeRegistry;
use target::{Target, TargetSet};
use variable::{apply_overrides, Value, ValueError, VarId, VarPool, Visibility};

/// The engine: the process-wide pools and arenas everything else hangs
/// off. Write-heavy during the (serial) load phase, read-only during
/// execution except for per-target execution state.
pub struct Engine {
  /// The working directory the invocation started in.
  pub work: PathBuf,

  /// Extension and project-name pool.
  pub exts: SymPool,

  pub vars: VarPool,
  pub scopes: ScopeTree,
  pub types: TypeRegistry,
  pub targets: TargetSet,
  pub functions: FunctionMap,
}

impl Engine {
  pub fn new() -> Self {
    let mut vars = VarPool::new();

    // The engine's own variables, typed up front so buildfile
    // assignments are typified on the way in.
    let _ = vars.insert("out_root", Some(variable::ValueType::DirPath), None);
    let _ = vars.insert("src_root", Some(variable::ValueType::DirPath), None);
    let _ = vars.insert("amalgamation", Some(variable::ValueType::DirPath), None);
    let _ = vars.insert("subprojects", Some(variable::ValueType::Names), None);
    let _ = vars.insert("extension", Some(variable::ValueType::String), None);
    let _ = vars.insert("project", Some(variable::ValueType::ProjectName), None);

    // Persistent configuration flags share a wildcard type.
    vars.insert_pattern(
      "config.*.configured",
      Some(variable::ValueType::Bool),
      Visibility::Project,
    );

    Self {
      work: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
      exts: SymPool::new(),
      vars,
      scopes: ScopeTree::new(),
      types: TypeRegistry::with_builtins(),
      targets: TargetSet::new(),
      functions: FunctionMap::with_builtins(),
    }
  }

  /// The scope a target belongs to. A target sourced from the src tree
  /// is looked up via its out directory.
  pub fn base_scope(&self, t: &Target) -> ScopeId {
    let d = if t.out.as_os_str().is_empty() {
      &t.dir
    } else {
      &t.out
    };
    self.scopes.find(d)
  }

  /// The nearest enclosing root scope of a target.
  pub fn root_scope_of(&self, t: &Target) -> Option<ScopeId> {
    self.scopes.root_scope(self.base_scope(t))
  }

  /// Render a target for diagnostics.
  pub fn display(&self, t: &Target) -> String {
    t.display_name(&self.types, &self.exts)
  }

  /// Find a variable's original value for a target: target locals, then
  /// group locals, then the base scope chain. Returns the value and the
  /// depth it was found at.
  pub fn target_find_original(&self, t: &Target, var: VarId) -> (Option<Value>, usize) {
    if let Some(v) = t.vars.read().unwrap().get(var) {
      return (Some(v.clone()), 1);
    }

    if let Some(g) = t.group() {
      let gt = self.targets.get(g);
      let gv = gt.vars.read().unwrap().get(var).cloned();
      if let Some(v) = gv {
        return (Some(v), 2);
      }
    }

    let (v, d) = self
      .scopes
      .find_original(&self.vars, self.base_scope(t), var);
    let depth = if v.is_some() { 2 + d } else { d };
    (v, depth)
  }

  /// Look up a variable for a target, overrides applied.
  pub fn target_find(&self, t: &Target, var: VarId) -> Result<Option<Value>, ValueError> {
    let (orig, _) = self.target_find_original(t, var);
    let scope = self.base_scope(t);
    apply_overrides(&self.vars, var, orig, &self.scopes.get(scope).out_path)
  }
}

impl Default for Engine {
  fn default() -> Self {
    Self::new()
  }
}
