//! Project bootstrap and loading.
//!
//! A project is discovered by its filesystem conventions: a source root
//! has `build/bootstrap.build` (or `build/root.build`); an out root has
//! `build/bootstrap/src-root.build`. Bootstrap proceeds out-first then
//! src, recursing into an enclosing amalgamation and nested subprojects,
//! after which `root.build` is loaded once per root (outermost first).
//! Buildfiles are sourced at most once per scope.
//!
//! `import` bootstraps a foreign project found via its `config.<project>`
//! variable and evaluates its `build/export.build` stub in a temporary
//! scope, so nothing leaks into the importing scope except the returned
//! value.

pub mod buildfile;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace};

use crate::action::{CLEAN_OP, DEFAULT_OP, PERFORM_META, UPDATE_OP};
use crate::diag::Location;
use crate::name::Name;
use crate::rule::builtin::register_builtin_rules;
use crate::scope::{ScopeError, ScopeId};
use crate::util::normalize;
use crate::variable::{Value, ValueError, ValueType, VariableError};
use crate::Engine;

pub use buildfile::{BuildfileError, SourceOutcome};

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("unable to open {path}: {source}")]
  OpenFailed {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("unable to determine src_root for {0}")]
  NoSrcRoot(PathBuf),

  #[error("new {what} {new} does not match existing {existing}")]
  RootMismatch {
    what: &'static str,
    new: PathBuf,
    existing: PathBuf,
  },

  #[error("bootstrapped src_root {bootstrapped} does not match {what} {expected}")]
  BootstrapMismatch {
    what: &'static str,
    bootstrapped: PathBuf,
    expected: PathBuf,
  },

  #[error(
    "unable to find out_root for imported {project}; consider configuring it via the {var} variable"
  )]
  UnknownImportProject { project: String, var: String },

  #[error("invalid {var} value for imported {project}")]
  InvalidImportPath { project: String, var: String },

  #[error("project name expected before imported target {0}")]
  ImportProjectExpected(String),

  #[error("expected directory in subprojects variable instead of {0}")]
  InvalidSubproject(String),

  #[error(transparent)]
  Buildfile(Box<BuildfileError>),

  #[error(transparent)]
  Scope(#[from] ScopeError),

  #[error(transparent)]
  Variable(#[from] VariableError),

  #[error(transparent)]
  Value(#[from] ValueError),
}

impl From<BuildfileError> for LoadError {
  fn from(e: BuildfileError) -> Self {
    LoadError::Buildfile(Box::new(e))
  }
}

/// Is this directory a source root?
pub fn is_src_root(d: &Path) -> bool {
  d.join("build/bootstrap.build").is_file() || d.join("build/root.build").is_file()
}

/// Is this directory an out root?
pub fn is_out_root(d: &Path) -> bool {
  d.join("build/bootstrap/src-root.build").is_file()
}

/// Walk upward from a directory to the nearest source root.
pub fn discover_src_root(start: &Path) -> Option<PathBuf> {
  let mut d = normalize(start);
  loop {
    if is_src_root(&d) {
      return Some(d);
    }
    if !d.pop() {
      return None;
    }
  }
}

/// Source a buildfile into root/base scopes.
pub fn source(
  eng: &mut Engine,
  bf: &Path,
  root: ScopeId,
  base: ScopeId,
) -> Result<SourceOutcome, LoadError> {
  trace!(buildfile = %bf.display(), "sourcing");

  let content = std::fs::read_to_string(bf).map_err(|e| LoadError::OpenFailed {
    path: bf.to_path_buf(),
    source: e,
  })?;

  Ok(buildfile::evaluate(eng, &content, bf, root, base)?)
}

/// Source a buildfile unless the `once` scope has already sourced it.
/// Returns `None` when it was skipped.
pub fn source_once(
  eng: &mut Engine,
  bf: &Path,
  root: ScopeId,
  base: ScopeId,
  once: ScopeId,
) -> Result<Option<SourceOutcome>, LoadError> {
  if !eng.scopes.get_mut(once).buildfiles.insert(bf.to_path_buf()) {
    trace!(buildfile = %bf.display(), "skipping already sourced");
    return Ok(None);
  }
  source(eng, bf, root, base).map(Some)
}

/// Allocate (or find) a root scope, seed the canonical operation tables,
/// and assign `out_root`/`src_root`, verifying consistency.
pub fn create_root(
  eng: &mut Engine,
  out_root: &Path,
  src_root: &Path,
) -> Result<ScopeId, LoadError> {
  let out_root = normalize(out_root);
  let id = eng.scopes.insert(&out_root, true);

  // Enter the built-in meta-operation and operation names. Registration
  // order must match the id constants. Module loading (via the src
  // bootstrap) can add more.
  if eng.scopes.get(id).meta_operations.is_empty() {
    let s = eng.scopes.get_mut(id);
    let m = s.meta_operations.insert(PERFORM_META);
    debug_assert_eq!(m, crate::action::PERFORM.0);

    let d = s.operations.insert(DEFAULT_OP);
    let u = s.operations.insert(UPDATE_OP);
    let c = s.operations.insert(CLEAN_OP);
    debug_assert_eq!(d, crate::action::DEFAULT.0);
    debug_assert_eq!(u, crate::action::UPDATE.0);
    debug_assert_eq!(c, crate::action::CLEAN.0);

    register_builtin_rules(&mut s.rules);
  }

  assign_root_var(eng, id, "out_root", &out_root)?;
  if !src_root.as_os_str().is_empty() {
    assign_root_var(eng, id, "src_root", &normalize(src_root))?;
  }

  Ok(id)
}

fn assign_root_var(
  eng: &mut Engine,
  scope: ScopeId,
  name: &'static str,
  dir: &Path,
) -> Result<(), LoadError> {
  let var = eng.vars.insert(name, Some(ValueType::DirPath), None)?;
  let vars = &mut eng.scopes.get_mut(scope).vars;

  match vars.get(var).cloned() {
    None | Some(Value::Null) => {
      *vars.assign(var) = Value::DirPath(dir.to_path_buf());
      Ok(())
    }
    Some(Value::DirPath(p)) if p == dir => Ok(()),
    Some(Value::DirPath(p)) => Err(LoadError::RootMismatch {
      what: name,
      new: dir.to_path_buf(),
      existing: p,
    }),
    Some(other) => Err(LoadError::Value(ValueError::TypeMismatch {
      expected: "dir_path",
      found: other
        .type_of()
        .map(|t| t.name().to_string())
        .unwrap_or_else(|| "untyped".to_string()),
    })),
  }
}

/// Read a scope variable as a directory, typifying untyped values.
fn dir_var(eng: &Engine, scope: ScopeId, name: &str) -> Result<Option<PathBuf>, LoadError> {
  let var = match eng.vars.find(name) {
    Some(v) => v,
    None => return Ok(None),
  };
  match eng.scopes.get(scope).vars.get(var) {
    None | Some(Value::Null) => Ok(None),
    Some(v) => {
      let v = v.clone().typify(ValueType::DirPath)?;
      Ok(v.as_dir().cloned())
    }
  }
}

/// Source `<out_root>/build/bootstrap/src-root.build` once, if present,
/// followed by the persistent configuration (`build/config.build`).
pub fn bootstrap_out(eng: &mut Engine, root: ScopeId) -> Result<(), LoadError> {
  let out = eng.scopes.get(root).out_path.clone();

  let bf = out.join("build/bootstrap/src-root.build");
  if bf.is_file() {
    source_once(eng, &bf, root, root, root)?;
  }

  let cf = out.join("build/config.build");
  if cf.is_file() {
    source_once(eng, &cf, root, root, root)?;
  }

  Ok(())
}

/// Source `<src_root>/build/bootstrap.build` once. Returns false if the
/// project has no bootstrap.
pub fn bootstrap_src(eng: &mut Engine, root: ScopeId) -> Result<bool, LoadError> {
  let src = eng.scopes.get(root).src_or_out().clone();
  let bf = src.join("build/bootstrap.build");
  if !bf.is_file() {
    return Ok(false);
  }
  source_once(eng, &bf, root, root, root)?;
  Ok(true)
}

/// If the root names an amalgamation, bootstrap the enclosing project the
/// same way, recursively.
pub fn create_bootstrap_outer(eng: &mut Engine, root: ScopeId) -> Result<(), LoadError> {
  let d = match dir_var(eng, root, "amalgamation")? {
    Some(d) => d,
    None => return Ok(()),
  };

  let out_root = normalize(&eng.scopes.get(root).out_path.join(&d));
  let src_root = normalize(&eng.scopes.get(root).src_or_out().join(&d));

  debug!(out_root = %out_root.display(), "bootstrapping amalgamation");

  let rs = create_root(eng, &out_root, &src_root)?;
  bootstrap_out(eng, rs)?;

  // Check whether the bootstrap process changed src_root.
  let p = dir_var(eng, rs, "src_root")?.ok_or_else(|| LoadError::NoSrcRoot(out_root.clone()))?;
  if p != src_root {
    return Err(LoadError::BootstrapMismatch {
      what: "amalgamated",
      bootstrapped: p,
      expected: src_root,
    });
  }
  eng.scopes.get_mut(rs).set_src_path(p)?;

  bootstrap_src(eng, rs)?;
  create_bootstrap_outer(eng, rs)
}

/// If the root lists subprojects and `out_base` lies within one, descend
/// and bootstrap it, repeating for deeper nestings. Returns the deepest
/// bootstrapped root.
pub fn create_bootstrap_inner(
  eng: &mut Engine,
  root: ScopeId,
  out_base: &Path,
) -> Result<ScopeId, LoadError> {
  let subs_var = match eng.vars.find("subprojects") {
    Some(v) => v,
    None => return Ok(root),
  };
  let subs = match eng.scopes.get(root).vars.get(subs_var) {
    Some(v) => v.to_names(),
    None => return Ok(root),
  };

  for n in subs {
    // Should be a list of directories.
    if n.ty.is_some() || !n.value.is_empty() || n.dir.as_os_str().is_empty() {
      return Err(LoadError::InvalidSubproject(n.to_string()));
    }

    let out_root = normalize(&eng.scopes.get(root).out_path.join(&n.dir));
    if !out_base.starts_with(&out_root) {
      continue;
    }

    let src_root = normalize(&eng.scopes.get(root).src_or_out().join(&n.dir));
    let rs = create_root(eng, &out_root, &src_root)?;

    bootstrap_out(eng, rs)?;

    let p = dir_var(eng, rs, "src_root")?.ok_or_else(|| LoadError::NoSrcRoot(out_root.clone()))?;
    if p != src_root {
      return Err(LoadError::BootstrapMismatch {
        what: "subproject",
        bootstrapped: p,
        expected: src_root,
      });
    }
    eng.scopes.get_mut(rs).set_src_path(p)?;

    bootstrap_src(eng, rs)?;

    // See if there are more inner roots.
    return create_bootstrap_inner(eng, rs, out_base);
  }

  Ok(root)
}

/// Load `root.build` for this root, loading outer roots first.
pub fn load_root_pre(eng: &mut Engine, root: ScopeId) -> Result<(), LoadError> {
  if let Some(parent) = eng.scopes.parent_scope(root) {
    if let Some(rs) = eng.scopes.root_scope(parent) {
      load_root_pre(eng, rs)?;
    }
  }

  let bf = eng.scopes.get(root).src_or_out().join("build/root.build");
  if bf.is_file() {
    source_once(eng, &bf, root, root, root)?;
  }
  Ok(())
}

/// Bootstrap and load a project for building `out_base`: the whole
/// create/bootstrap/amalgamation/subproject/root.build sequence. Returns
/// the root scope `out_base` belongs to.
pub fn load_project(
  eng: &mut Engine,
  out_root: &Path,
  src_root: Option<&Path>,
  out_base: &Path,
) -> Result<ScopeId, LoadError> {
  let src = src_root.map(normalize).unwrap_or_default();
  let root = create_root(eng, out_root, &src)?;

  bootstrap_out(eng, root)?;

  // src_root comes from the caller, from bootstrap_out, or for in-source
  // builds defaults to the out root.
  let src = match dir_var(eng, root, "src_root")? {
    Some(p) => p,
    None => {
      let p = eng.scopes.get(root).out_path.clone();
      assign_root_var(eng, root, "src_root", &p)?;
      p
    }
  };
  eng.scopes.get_mut(root).set_src_path(src)?;

  bootstrap_src(eng, root)?;
  create_bootstrap_outer(eng, root)?;
  let root = create_bootstrap_inner(eng, root, out_base)?;
  load_root_pre(eng, root)?;

  Ok(root)
}

/// Persist configuration variables to `<out_root>/build/config.build`.
///
/// The file is sourced again by [`bootstrap_out`] on the next invocation.
pub fn save_config(
  eng: &Engine,
  root: ScopeId,
  vars: &[(String, Value)],
) -> Result<(), LoadError> {
  let out = eng.scopes.get(root).out_path.clone();
  let cf = out.join("build/config.build");

  let mut content = String::from("# Created automatically; safe to edit.\n");
  for (name, value) in vars {
    let names: Vec<String> = value.to_names().iter().map(|n| n.to_string()).collect();
    content.push_str(&format!("{} = {}\n", name, names.join(" ")));
  }

  if let Some(parent) = cf.parent() {
    std::fs::create_dir_all(parent).map_err(|e| LoadError::OpenFailed {
      path: cf.clone(),
      source: e,
    })?;
  }
  std::fs::write(&cf, content).map_err(|e| LoadError::OpenFailed {
    path: cf,
    source: e,
  })
}

/// Import a target (or project) from another project.
///
/// The project's out root comes from `config.<project>` in the importing
/// root; the imported root is bootstrapped exactly like a main project
/// (without guessing src_root), its outer roots are bootstrapped, its
/// `root.build` loaded, and finally `build/export.build` is evaluated in
/// a temporary scope with `out_root`, `src_root`, and `target`
/// pre-assigned. Only the exported value is returned; no variables leak
/// into the importing scope.
pub fn import(
  eng: &mut Engine,
  ibase: ScopeId,
  n: &Name,
  _loc: &Location,
) -> Result<Value, LoadError> {
  // Split the name into the project and target.
  let (project, target): (String, Option<Name>) = if let Some(p) = &n.proj {
    let mut t = n.clone();
    t.proj = None;
    (p.clone(), Some(t))
  } else if n.is_simple() {
    (n.value.clone(), None)
  } else {
    return Err(LoadError::ImportProjectExpected(n.to_string()));
  };

  let iroot = eng
    .scopes
    .root_scope(ibase)
    .unwrap_or(crate::scope::ScopeId::GLOBAL);

  // Figure out the project's out_root.
  let var_name = format!("config.{}", project);
  let var = eng
    .vars
    .insert(&var_name, None, None)?;
  let v = eng
    .scopes
    .find_var(&eng.vars, iroot, var)?
    .ok_or_else(|| LoadError::UnknownImportProject {
      project: project.clone(),
      var: var_name.clone(),
    })?;

  let mut out_root = v
    .clone()
    .typify(ValueType::DirPath)
    .map_err(|_| LoadError::InvalidImportPath {
      project: project.clone(),
      var: var_name.clone(),
    })?
    .as_dir()
    .cloned()
    .ok_or_else(|| LoadError::InvalidImportPath {
      project: project.clone(),
      var: var_name.clone(),
    })?;

  if out_root.is_relative() {
    out_root = eng.work.join(out_root);
  }
  out_root = normalize(&out_root);

  debug!(project = %project, out_root = %out_root.display(), "importing");

  // Bootstrap the imported root scope, without guessing src_root: it is
  // either discovered (in-source) or must be set by bootstrap_out.
  let src_root = if is_src_root(&out_root) {
    out_root.clone()
  } else {
    PathBuf::new()
  };

  let root = create_root(eng, &out_root, &src_root)?;
  bootstrap_out(eng, root)?;

  let p = dir_var(eng, root, "src_root")?.ok_or_else(|| LoadError::NoSrcRoot(out_root.clone()))?;
  if !src_root.as_os_str().is_empty() && p != src_root {
    return Err(LoadError::BootstrapMismatch {
      what: "discovered",
      bootstrapped: p,
      expected: src_root,
    });
  }
  let src_root = p;
  eng.scopes.get_mut(root).set_src_path(src_root.clone())?;

  bootstrap_src(eng, root)?;
  create_bootstrap_outer(eng, root)?;
  load_root_pre(eng, root)?;

  // A temporary scope so the export stub cannot mess up our variables.
  let ts = eng.scopes.create_detached(ibase);

  let out_var = eng.vars.insert("out_root", Some(ValueType::DirPath), None)?;
  let src_var = eng.vars.insert("src_root", Some(ValueType::DirPath), None)?;
  let target_var = eng.vars.insert("target", None, None)?;
  {
    let vars = &mut eng.scopes.get_mut(ts).vars;
    *vars.assign(out_var) = Value::DirPath(out_root);
    *vars.assign(src_var) = Value::DirPath(src_root.clone());
    *vars.assign(target_var) = match target {
      Some(t) => Value::Untyped(vec![t]),
      None => Value::Null,
    };
  }

  // The export stub is loaded in the context of the importing project.
  let es = src_root.join("build/export.build");
  let outcome = source(eng, &es, iroot, ts)?;

  Ok(outcome.export.unwrap_or(Value::Null))
}
