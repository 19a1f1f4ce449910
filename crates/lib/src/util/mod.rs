//! Shared helpers.

#[cfg(test)]
pub mod testutil;

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: collapse `.` and `..` components.
///
/// Purely textual, no filesystem access; `..` at the start of a relative
/// path is preserved.
pub fn normalize(p: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for c in p.components() {
    match c {
      Component::CurDir => {}
      Component::ParentDir => {
        let popped = match out.components().next_back() {
          Some(Component::Normal(_)) => out.pop(),
          _ => false,
        };
        if !popped {
          out.push("..");
        }
      }
      other => out.push(other.as_os_str()),
    }
  }
  if out.as_os_str().is_empty() {
    out.push(".");
  }
  out
}
