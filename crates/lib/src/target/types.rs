//! Target type descriptors.
//!
//! A target type is a value describing its metadata: textual name, base
//! type (single inheritance), default-extension derivation, prerequisite
//! search behavior, and the see-through flag (groups and aliases vs
//! ordinary targets). `is_a` is a walk of base pointers.

use std::collections::HashMap;

use crate::scope::ScopeId;

/// A stable reference into the type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetTypeId(pub(crate) u32);

/// How prerequisites of this type are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
  /// Look for an existing target, creating one if absent.
  Target,
  /// Look for an existing target, then for a file on disk.
  File,
  /// Require an explicitly declared target.
  Alias,
}

/// Default-extension derivation callback.
pub type ExtDeriveFn = fn(&crate::Engine, ScopeId, &str) -> Option<String>;

pub struct TargetTypeInfo {
  pub name: String,
  pub base: Option<TargetTypeId>,
  pub derive_ext: Option<ExtDeriveFn>,
  pub search: SearchKind,
  pub see_through: bool,
}

// Built-in type ids, in registration order.
pub const TARGET: TargetTypeId = TargetTypeId(0);
pub const MTIME_TARGET: TargetTypeId = TargetTypeId(1);
pub const PATH_TARGET: TargetTypeId = TargetTypeId(2);
pub const FILE: TargetTypeId = TargetTypeId(3);
pub const ALIAS: TargetTypeId = TargetTypeId(4);
pub const DIR: TargetTypeId = TargetTypeId(5);
pub const FSDIR: TargetTypeId = TargetTypeId(6);
pub const BUILDFILE: TargetTypeId = TargetTypeId(7);

/// The `extension` variable overrides a file target's default extension;
/// without it a file is treated as extension-less (`file{foo}` is
/// `file{foo.}`).
fn file_extension(eng: &crate::Engine, scope: ScopeId, _name: &str) -> Option<String> {
  if let Some(var) = eng.vars.find("extension") {
    if let Ok(Some(v)) = eng.scopes.find_var(&eng.vars, scope, var) {
      if let Some(s) = v.as_str() {
        return Some(s.to_string());
      }
    }
  }
  Some(String::new())
}

/// The special name `buildfile` has no extension; everything else uses
/// `.build`.
fn buildfile_extension(_eng: &crate::Engine, _scope: ScopeId, name: &str) -> Option<String> {
  Some(if name == "buildfile" {
    String::new()
  } else {
    "build".to_string()
  })
}

/// The registry of target types. Built-ins are always present; modules may
/// register more.
pub struct TypeRegistry {
  types: Vec<TargetTypeInfo>,
  by_name: HashMap<String, TargetTypeId>,
}

impl TypeRegistry {
  pub fn with_builtins() -> Self {
    let mut r = Self {
      types: Vec::new(),
      by_name: HashMap::new(),
    };

    r.insert(TargetTypeInfo {
      name: "target".to_string(),
      base: None,
      derive_ext: None,
      search: SearchKind::Target,
      see_through: false,
    });
    r.insert(TargetTypeInfo {
      name: "mtime_target".to_string(),
      base: Some(TARGET),
      derive_ext: None,
      search: SearchKind::Target,
      see_through: false,
    });
    r.insert(TargetTypeInfo {
      name: "path_target".to_string(),
      base: Some(MTIME_TARGET),
      derive_ext: None,
      search: SearchKind::Target,
      see_through: false,
    });
    r.insert(TargetTypeInfo {
      name: "file".to_string(),
      base: Some(PATH_TARGET),
      derive_ext: Some(file_extension),
      search: SearchKind::File,
      see_through: false,
    });
    r.insert(TargetTypeInfo {
      name: "alias".to_string(),
      base: Some(TARGET),
      derive_ext: None,
      search: SearchKind::Alias,
      see_through: true,
    });
    r.insert(TargetTypeInfo {
      name: "dir".to_string(),
      base: Some(ALIAS),
      derive_ext: None,
      search: SearchKind::Alias,
      see_through: true,
    });
    r.insert(TargetTypeInfo {
      name: "fsdir".to_string(),
      base: Some(TARGET),
      derive_ext: None,
      search: SearchKind::Target,
      see_through: false,
    });
    r.insert(TargetTypeInfo {
      name: "buildfile".to_string(),
      base: Some(FILE),
      derive_ext: Some(buildfile_extension),
      search: SearchKind::File,
      see_through: false,
    });

    r
  }

  pub fn insert(&mut self, info: TargetTypeInfo) -> TargetTypeId {
    let id = TargetTypeId(self.types.len() as u32);
    self.by_name.insert(info.name.clone(), id);
    self.types.push(info);
    id
  }

  pub fn find(&self, name: &str) -> Option<TargetTypeId> {
    self.by_name.get(name).copied()
  }

  pub fn get(&self, id: TargetTypeId) -> &TargetTypeInfo {
    &self.types[id.0 as usize]
  }

  /// Walk the base chain: is `ty` the same as, or derived from, `base`?
  pub fn is_a(&self, ty: TargetTypeId, base: TargetTypeId) -> bool {
    let mut cur = Some(ty);
    while let Some(t) = cur {
      if t == base {
        return true;
      }
      cur = self.get(t).base;
    }
    false
  }

  /// The inheritance chain of a type, most derived first.
  pub fn chain(&self, ty: TargetTypeId) -> Vec<TargetTypeId> {
    let mut r = Vec::new();
    let mut cur = Some(ty);
    while let Some(t) = cur {
      r.push(t);
      cur = self.get(t).base;
    }
    r
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builtin_ids_match_registration_order() {
    let r = TypeRegistry::with_builtins();
    assert_eq!(r.find("target"), Some(TARGET));
    assert_eq!(r.find("file"), Some(FILE));
    assert_eq!(r.find("fsdir"), Some(FSDIR));
    assert_eq!(r.find("buildfile"), Some(BUILDFILE));
  }

  #[test]
  fn is_a_walks_base_chain() {
    let r = TypeRegistry::with_builtins();
    assert!(r.is_a(FILE, PATH_TARGET));
    assert!(r.is_a(FILE, MTIME_TARGET));
    assert!(r.is_a(FILE, TARGET));
    assert!(r.is_a(DIR, ALIAS));
    assert!(!r.is_a(FSDIR, ALIAS));
    assert!(!r.is_a(TARGET, FILE));
  }

  #[test]
  fn chain_is_most_derived_first() {
    let r = TypeRegistry::with_builtins();
    let c = r.chain(BUILDFILE);
    assert_eq!(c.first(), Some(&BUILDFILE));
    assert_eq!(c.last(), Some(&TARGET));
    assert_eq!(c.len(), 5); // buildfile, file, path_target, mtime_target, target
  }

  #[test]
  fn see_through_flags() {
    let r = TypeRegistry::with_builtins();
    assert!(r.get(ALIAS).see_through);
    assert!(r.get(DIR).see_through);
    assert!(!r.get(FILE).see_through);
    assert!(!r.get(FSDIR).see_through);
  }
}
