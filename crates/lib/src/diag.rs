//! Diagnostic severities, source locations, and the verbosity dial.
//!
//! Errors in the engine are per-module `thiserror` enums; this module only
//! carries the pieces they share: a severity scale, a buildfile location
//! (file/line/column) that user-input diagnostics are bound to, and the
//! small-integer verbosity dial the driver exposes.

use std::fmt;
use std::path::{Path, PathBuf};

/// Diagnostic severity.
///
/// `Fail` is the terminating variant (the current invocation aborts);
/// `Error` records and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
  Trace,
  Info,
  Warn,
  Error,
  Fail,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Severity::Trace => "trace",
      Severity::Info => "info",
      Severity::Warn => "warning",
      Severity::Error => "error",
      Severity::Fail => "error", // terminating, but printed the same
    };
    f.write_str(s)
  }
}

/// A position in a buildfile or script, for user-input diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
  pub path: PathBuf,
  pub line: u64,
  pub column: u64,
}

impl Location {
  pub fn new(path: impl Into<PathBuf>, line: u64, column: u64) -> Self {
    Self {
      path: path.into(),
      line,
      column,
    }
  }

  /// Location referring to a file as a whole.
  pub fn file(path: impl Into<PathBuf>) -> Self {
    Self::new(path, 0, 0)
  }
}

impl fmt::Display for Location {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.path.display())?;
    if self.line != 0 {
      write!(f, ":{}", self.line)?;
      if self.column != 0 {
        write!(f, ":{}", self.column)?;
      }
    }
    Ok(())
  }
}

impl Location {
  pub fn display_path(&self) -> &Path {
    &self.path
  }
}

/// The verbosity dial. Levels 0-3 are end-user output, 4-6 tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(pub u8);

impl Verbosity {
  pub const QUIET: Verbosity = Verbosity(0);
  pub const DEFAULT: Verbosity = Verbosity(1);

  /// True for levels that should print executed command lines.
  pub fn commands(self) -> bool {
    self.0 >= 2
  }

  /// True for internal tracing levels.
  pub fn tracing(self) -> bool {
    self.0 >= 4
  }
}

impl Default for Verbosity {
  fn default() -> Self {
    Verbosity::DEFAULT
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn location_display() {
    let l = Location::new("dir/buildfile", 12, 3);
    assert_eq!(l.to_string(), "dir/buildfile:12:3");

    let f = Location::file("build/bootstrap.build");
    assert_eq!(f.to_string(), "build/bootstrap.build");
  }

  #[test]
  fn severity_order() {
    assert!(Severity::Trace < Severity::Info);
    assert!(Severity::Error < Severity::Fail);
  }

  #[test]
  fn verbosity_thresholds() {
    assert!(!Verbosity(1).commands());
    assert!(Verbosity(2).commands());
    assert!(!Verbosity(3).tracing());
    assert!(Verbosity(4).tracing());
  }
}
