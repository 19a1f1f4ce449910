//! Interned string pool.
//!
//! Extensions and project names are interned process-wide: interning the
//! same string twice returns the same [`Sym`], so comparison is index
//! equality. Insertion is guarded by a reader-writer lock; the returned
//! symbols stay valid for the life of the pool.

use std::collections::HashMap;
use std::sync::RwLock;

/// A stable reference to an interned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sym(u32);

#[derive(Default)]
struct PoolInner {
  by_value: HashMap<String, Sym>,
  values: Vec<String>,
}

/// A process-wide set of unique strings.
#[derive(Default)]
pub struct SymPool {
  inner: RwLock<PoolInner>,
}

impl SymPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Intern a string, returning its stable symbol.
  pub fn intern(&self, s: &str) -> Sym {
    if let Some(sym) = self.find(s) {
      return sym;
    }

    let mut inner = self.inner.write().unwrap();
    // Re-check: another writer may have raced us between the read and
    // write lock acquisitions.
    if let Some(&sym) = inner.by_value.get(s) {
      return sym;
    }

    let sym = Sym(inner.values.len() as u32);
    inner.values.push(s.to_string());
    inner.by_value.insert(s.to_string(), sym);
    sym
  }

  /// Look up a string without interning it.
  pub fn find(&self, s: &str) -> Option<Sym> {
    self.inner.read().unwrap().by_value.get(s).copied()
  }

  /// Resolve a symbol back to its string.
  pub fn resolve(&self, sym: Sym) -> String {
    self.inner.read().unwrap().values[sym.0 as usize].clone()
  }

  pub fn len(&self) -> usize {
    self.inner.read().unwrap().values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn intern_is_stable() {
    let pool = SymPool::new();
    let a = pool.intern("cxx");
    let b = pool.intern("cxx");
    assert_eq!(a, b);
    assert_eq!(pool.resolve(a), "cxx");
  }

  #[test]
  fn distinct_strings_distinct_syms() {
    let pool = SymPool::new();
    let a = pool.intern("c");
    let b = pool.intern("h");
    assert_ne!(a, b);
    assert_eq!(pool.len(), 2);
  }

  #[test]
  fn find_does_not_intern() {
    let pool = SymPool::new();
    assert!(pool.find("build").is_none());
    pool.intern("build");
    assert!(pool.find("build").is_some());
  }

  #[test]
  fn empty_string_interns() {
    // "No extension" is represented as the interned empty string.
    let pool = SymPool::new();
    let e = pool.intern("");
    assert_eq!(pool.resolve(e), "");
  }
}
