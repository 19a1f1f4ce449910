//! Variable pool: typed, overridable variables with pattern typing.
//!
//! All variables are interned in a single pool; a [`VarId`] stays valid for
//! the life of the process. A variable carries its dotted name, an optional
//! declared type, and a visibility. Wildcard patterns give families of
//! variables (e.g. all `config.*.configured`) a type and visibility without
//! declaring each member; overrides form an ordered chain applied on top of
//! the original value at lookup time.

pub mod value;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub use value::{Value, ValueError, ValueType};

#[derive(Debug, Error)]
pub enum VariableError {
  /// The `variable-redeclared` failure.
  #[error("variable {name} redeclared as {new}, previously {existing}")]
  Redeclared {
    name: String,
    new: &'static str,
    existing: &'static str,
  },

  #[error(transparent)]
  Value(#[from] ValueError),
}

/// Variable visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
  Target,
  Scope,
  Project,
  #[default]
  Global,
  Prerequisite,
}

impl fmt::Display for Visibility {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Visibility::Target => "target",
      Visibility::Scope => "scope",
      Visibility::Project => "project",
      Visibility::Global => "global",
      Visibility::Prerequisite => "prerequisite",
    };
    f.write_str(s)
  }
}

/// A stable reference into the variable pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(u32);

#[derive(Debug)]
pub struct Variable {
  pub name: String,
  pub ty: Option<ValueType>,
  pub visibility: Visibility,
}

/// A registered wildcard pattern, e.g. `config.*.configured`.
#[derive(Debug)]
pub struct Pattern {
  pub pattern: String,
  pub ty: Option<ValueType>,
  pub visibility: Visibility,
}

impl Pattern {
  /// Match a variable name against the pattern. A single `*` matches any
  /// non-empty run of characters.
  fn matches(&self, name: &str) -> bool {
    match self.pattern.split_once('*') {
      Some((prefix, suffix)) => {
        name.len() > prefix.len() + suffix.len()
          && name.starts_with(prefix)
          && name.ends_with(suffix)
      }
      None => self.pattern == name,
    }
  }
}

/// How an override combines with the original value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
  Assign,
  Append,
  Prepend,
}

/// One entry in a variable's override chain.
///
/// `dir` restricts the override to scopes whose out path it encloses;
/// `None` applies everywhere (a command-line override).
#[derive(Debug)]
pub struct VarOverride {
  pub var: VarId,
  pub kind: OverrideKind,
  pub value: Value,
  pub dir: Option<PathBuf>,
}

/// The process-wide variable pool.
#[derive(Default)]
pub struct VarPool {
  vars: Vec<Variable>,
  by_name: HashMap<String, VarId>,
  patterns: Vec<Pattern>,
  overrides: Vec<VarOverride>,
}

impl VarPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Enter a variable, or find the existing one.
  ///
  /// Re-inserting with a different declared type fails with
  /// `variable-redeclared`; re-inserting without a type, or with the same
  /// one, is idempotent. A new variable whose name matches a registered
  /// pattern inherits the pattern's type and visibility unless explicitly
  /// declared.
  pub fn insert(
    &mut self,
    name: &str,
    ty: Option<ValueType>,
    visibility: Option<Visibility>,
  ) -> Result<VarId, VariableError> {
    if let Some(&id) = self.by_name.get(name) {
      let var = &mut self.vars[id.0 as usize];
      match (var.ty, ty) {
        (Some(existing), Some(new)) if existing != new => {
          return Err(VariableError::Redeclared {
            name: name.to_string(),
            new: new.name(),
            existing: existing.name(),
          });
        }
        (None, Some(new)) => var.ty = Some(new),
        _ => {}
      }
      if let Some(v) = visibility {
        var.visibility = v;
      }
      return Ok(id);
    }

    let (mut ty, mut vis) = (ty, visibility);
    if ty.is_none() || vis.is_none() {
      if let Some(p) = self.pattern_match(name) {
        if ty.is_none() {
          ty = p.ty;
        }
        if vis.is_none() {
          vis = Some(p.visibility);
        }
      }
    }

    let id = VarId(self.vars.len() as u32);
    self.vars.push(Variable {
      name: name.to_string(),
      ty,
      visibility: vis.unwrap_or_default(),
    });
    self.by_name.insert(name.to_string(), id);
    Ok(id)
  }

  pub fn find(&self, name: &str) -> Option<VarId> {
    self.by_name.get(name).copied()
  }

  pub fn get(&self, id: VarId) -> &Variable {
    &self.vars[id.0 as usize]
  }

  /// Register a wildcard pattern.
  pub fn insert_pattern(
    &mut self,
    pattern: &str,
    ty: Option<ValueType>,
    visibility: Visibility,
  ) {
    self.patterns.push(Pattern {
      pattern: pattern.to_string(),
      ty,
      visibility,
    });
  }

  /// Find the first registered pattern matching a variable name.
  pub fn pattern_match(&self, name: &str) -> Option<&Pattern> {
    self.patterns.iter().find(|p| p.matches(name))
  }

  /// Add an override to the chain.
  pub fn add_override(
    &mut self,
    var: VarId,
    kind: OverrideKind,
    value: Value,
    dir: Option<PathBuf>,
  ) {
    self.overrides.push(VarOverride {
      var,
      kind,
      value,
      dir,
    });
  }

  /// Overrides applicable to a variable at a lookup site, in registration
  /// order.
  pub fn overrides_for<'a>(
    &'a self,
    var: VarId,
    lookup_dir: &'a std::path::Path,
  ) -> impl Iterator<Item = &'a VarOverride> + 'a {
    self.overrides.iter().filter(move |o| {
      o.var == var
        && match &o.dir {
          None => true,
          Some(d) => lookup_dir.starts_with(d),
        }
    })
  }

  pub fn has_overrides(&self, var: VarId) -> bool {
    self.overrides.iter().any(|o| o.var == var)
  }
}

/// A name-to-value map, as carried by scopes and targets.
#[derive(Debug, Default)]
pub struct VarMap {
  map: HashMap<VarId, Value>,
}

impl VarMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, var: VarId) -> Option<&Value> {
    self.map.get(&var)
  }

  /// Plain assignment. Returns a mutable reference to the slot.
  pub fn assign(&mut self, var: VarId) -> &mut Value {
    self.map.entry(var).or_insert(Value::Null)
  }

  /// Default assignment (`?=`): only sets if currently unset.
  pub fn assign_default(&mut self, var: VarId, value: Value) {
    self.map.entry(var).or_insert(value);
  }

  pub fn append(&mut self, var: VarId, value: Value) -> Result<(), ValueError> {
    self.assign(var).append(value)
  }

  pub fn prepend(&mut self, var: VarId, value: Value) -> Result<(), ValueError> {
    self.assign(var).prepend(value)
  }

  pub fn contains(&self, var: VarId) -> bool {
    self.map.contains_key(&var)
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&VarId, &Value)> {
    self.map.iter()
  }
}

/// Apply a variable's override chain to its original value.
pub fn apply_overrides(
  pool: &VarPool,
  var: VarId,
  original: Option<Value>,
  lookup_dir: &std::path::Path,
) -> Result<Option<Value>, ValueError> {
  let mut r = original;
  for o in pool.overrides_for(var, lookup_dir) {
    match o.kind {
      OverrideKind::Assign => r = Some(o.value.clone()),
      OverrideKind::Append => {
        let mut base = r.take().unwrap_or(Value::Null);
        base.append(o.value.clone())?;
        r = Some(base);
      }
      OverrideKind::Prepend => {
        let mut base = r.take().unwrap_or(Value::Null);
        base.prepend(o.value.clone())?;
        r = Some(base);
      }
    }
  }
  Ok(r)
}
