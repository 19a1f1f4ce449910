//! Actions and the per-root operation tables.
//!
//! An action is a composite identifier packed into a single word: the
//! meta-operation, the (outer) operation, and an optional inner operation
//! for nested requests such as update-for-install. Packing keeps compare
//! and hash cheap; the inner slot also drives recipe-override precedence
//! (an action with an inner operation supersedes the plain one).
//!
//! Every root scope carries two parallel ordered tables, meta-operations
//! and operations. The id reserved for an entry is its insertion position
//! (starting at 1); the first three operation slots are always default,
//! update, clean, and the first meta-operation is perform.

use std::fmt;

/// A meta-operation id within a root's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetaOperationId(pub u8);

/// An operation id within a root's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u8);

pub const PERFORM: MetaOperationId = MetaOperationId(1);

pub const DEFAULT: OperationId = OperationId(1);
pub const UPDATE: OperationId = OperationId(2);
pub const CLEAN: OperationId = OperationId(3);

/// A composite action id: (meta-operation, outer operation, inner
/// operation), packed for cheap compare and hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action(u32);

impl Action {
  pub fn new(meta: MetaOperationId, op: OperationId) -> Self {
    Self::with_inner(meta, op, OperationId(0))
  }

  pub fn with_inner(meta: MetaOperationId, outer: OperationId, inner: OperationId) -> Self {
    Action(((meta.0 as u32) << 16) | ((outer.0 as u32) << 8) | inner.0 as u32)
  }

  pub fn meta(self) -> MetaOperationId {
    MetaOperationId((self.0 >> 16) as u8)
  }

  pub fn outer(self) -> OperationId {
    OperationId((self.0 >> 8) as u8)
  }

  pub fn inner(self) -> OperationId {
    OperationId(self.0 as u8)
  }

  /// The effective operation: the inner one if set, the outer otherwise.
  pub fn operation(self) -> OperationId {
    let inner = self.inner();
    if inner.0 != 0 { inner } else { self.outer() }
  }

  /// Whether this action strictly supersedes another for recipe-override
  /// purposes: same meta-operation and outer operation, and this action
  /// additionally carries an inner operation the other lacks.
  pub fn supersedes(self, other: Action) -> bool {
    self.meta() == other.meta()
      && self.outer() == other.outer()
      && self.inner().0 != 0
      && other.inner().0 == 0
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({}", self.meta().0, self.outer().0)?;
    if self.inner().0 != 0 {
      write!(f, ",{}", self.inner().0)?;
    }
    f.write_str(")")
  }
}

/// Execution ordering for an operation.
///
/// `First` builds prerequisites before dependents (update and friends);
/// `Last` inverts the order (clean).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
  First,
  Last,
}

/// Pre-operation hook: an operation to run first, if any.
pub type PreHook = fn(MetaOperationId) -> Option<OperationId>;

/// Post-operation hook.
pub type PostHook = fn(MetaOperationId);

pub struct OperationInfo {
  pub name: &'static str,
  pub mode: ExecutionMode,
  pub pre: Option<PreHook>,
  pub post: Option<PostHook>,
}

pub struct MetaOperationInfo {
  pub name: &'static str,
}

/// An ordered table whose entry ids are insertion positions (from 1).
pub struct OperationTable<T> {
  entries: Vec<T>,
}

impl<T> Default for OperationTable<T> {
  fn default() -> Self {
    Self { entries: Vec::new() }
  }
}

impl<T> OperationTable<T> {
  pub fn insert(&mut self, info: T) -> u8 {
    self.entries.push(info);
    self.entries.len() as u8
  }

  pub fn get(&self, id: u8) -> Option<&T> {
    if id == 0 {
      return None;
    }
    self.entries.get(id as usize - 1)
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

impl OperationTable<OperationInfo> {
  pub fn find(&self, name: &str) -> Option<OperationId> {
    self
      .entries
      .iter()
      .position(|e| e.name == name)
      .map(|i| OperationId(i as u8 + 1))
  }
}

impl OperationTable<MetaOperationInfo> {
  pub fn find(&self, name: &str) -> Option<MetaOperationId> {
    self
      .entries
      .iter()
      .position(|e| e.name == name)
      .map(|i| MetaOperationId(i as u8 + 1))
  }
}

// Canonical entries. Only perform plus (default, update, clean) are seeded
// into a fresh root; the rest are registered by the driver or by modules.

pub const PERFORM_META: MetaOperationInfo = MetaOperationInfo { name: "perform" };
pub const CONFIGURE_META: MetaOperationInfo = MetaOperationInfo { name: "configure" };
pub const DISFIGURE_META: MetaOperationInfo = MetaOperationInfo { name: "disfigure" };
pub const DIST_META: MetaOperationInfo = MetaOperationInfo { name: "dist" };
pub const INFO_META: MetaOperationInfo = MetaOperationInfo { name: "info" };

pub const DEFAULT_OP: OperationInfo = OperationInfo {
  name: "default",
  mode: ExecutionMode::First,
  pre: None,
  post: None,
};

pub const UPDATE_OP: OperationInfo = OperationInfo {
  name: "update",
  mode: ExecutionMode::First,
  pre: None,
  post: None,
};

pub const CLEAN_OP: OperationInfo = OperationInfo {
  name: "clean",
  mode: ExecutionMode::Last,
  pre: None,
  post: None,
};

fn test_pre(_: MetaOperationId) -> Option<OperationId> {
  // Test what is up to date.
  Some(UPDATE)
}

pub const TEST_OP: OperationInfo = OperationInfo {
  name: "test",
  mode: ExecutionMode::First,
  pre: Some(test_pre),
  post: None,
};

fn install_pre(_: MetaOperationId) -> Option<OperationId> {
  // Update using the update-for-install variant.
  Some(UPDATE)
}

pub const INSTALL_OP: OperationInfo = OperationInfo {
  name: "install",
  mode: ExecutionMode::First,
  pre: Some(install_pre),
  post: None,
};

pub const UNINSTALL_OP: OperationInfo = OperationInfo {
  name: "uninstall",
  mode: ExecutionMode::Last,
  pre: None,
  post: None,
};

pub const UPDATE_FOR_INSTALL_OP: OperationInfo = OperationInfo {
  name: "update-for-install",
  mode: ExecutionMode::First,
  pre: None,
  post: None,
};
