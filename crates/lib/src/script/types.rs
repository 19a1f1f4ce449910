//! Test-script object model.
//!
//! The pre-parsed representation the script parser produces and the
//! runner consumes: lines, commands with redirects and cleanups, pipes,
//! and `&&`/`||` expressions. Here-document content comes in literal and
//! regex flavors; regex here-docs carry per-line literal/regex
//! alternatives plus global flags.

use std::fmt;
use std::path::PathBuf;

/// Pre-parse line classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
  Var,
  Cmd,
  If,
  Ifn,
  Elif,
  Elifn,
  Else,
  End,
}

/// A pre-parsed script line.
#[derive(Debug, Clone)]
pub struct Line {
  pub kind: LineKind,
  pub text: String,
}

/// One line of a regex here-document: either a literal or a regex, with
/// per-line flags.
#[derive(Debug, Clone)]
pub struct RegexLine {
  pub regex: bool,
  pub value: String,
  pub flags: String,
  pub line: u64,
}

impl RegexLine {
  pub fn literal(value: impl Into<String>, line: u64) -> Self {
    Self {
      regex: false,
      value: value.into(),
      flags: String::new(),
      line,
    }
  }

  pub fn pattern(value: impl Into<String>, flags: impl Into<String>, line: u64) -> Self {
    Self {
      regex: true,
      value: value.into(),
      flags: flags.into(),
      line,
    }
  }
}

/// A regex here-document: introducer character, global flags, lines.
#[derive(Debug, Clone)]
pub struct RegexLines {
  pub intro: char,
  pub flags: String,
  pub lines: Vec<RegexLine>,
}

/// Output file redirect mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
  Compare,
  Overwrite,
  Append,
}

/// A redirect of one of the three standard streams.
#[derive(Debug, Clone, Default)]
pub enum Redirect {
  /// Assert that no input is consumed / no output is produced.
  None,

  /// Inherit the stream.
  #[default]
  Pass,

  /// /dev/null.
  Null,

  /// Capture and emit via the trace log.
  Trace,

  /// Duplicate the other output descriptor (1 or 2).
  Merge(u32),

  File {
    path: PathBuf,
    mode: RedirectMode,
  },

  HereStrLiteral(String),
  HereStrRegex(RegexLines),
  HereDocLiteral(String),
  HereDocRegex(RegexLines),

  /// Reference to a previously given here-document (no chains).
  HereDocRef(Box<Redirect>),
}

impl Redirect {
  /// Resolve a here-document reference, one level.
  pub fn effective(&self) -> &Redirect {
    match self {
      Redirect::HereDocRef(r) => r,
      other => other,
    }
  }

  /// Literal here content, if this is a literal here redirect.
  pub fn here_literal(&self) -> Option<&str> {
    match self.effective() {
      Redirect::HereStrLiteral(s) | Redirect::HereDocLiteral(s) => Some(s),
      _ => None,
    }
  }

  pub fn here_regex(&self) -> Option<&RegexLines> {
    match self.effective() {
      Redirect::HereStrRegex(r) | Redirect::HereDocRegex(r) => Some(r),
      _ => None,
    }
  }
}

/// Cleanup strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
  /// `&foo`: clean up, fail if it does not exist.
  Always,
  /// `&?foo`: clean up, ignore if it does not exist.
  Maybe,
  /// `&!foo`: don't clean up, but the path must still exist.
  Never,
}

/// A file or directory registered for cleanup when the scope is left.
/// A directory must be empty at cleanup time.
#[derive(Debug, Clone)]
pub struct Cleanup {
  pub kind: CleanupKind,
  pub path: PathBuf,
  pub dir: bool,
}

impl Cleanup {
  pub fn file(kind: CleanupKind, path: impl Into<PathBuf>) -> Self {
    Self {
      kind,
      path: path.into(),
      dir: false,
    }
  }

  pub fn dir(kind: CleanupKind, path: impl Into<PathBuf>) -> Self {
    Self {
      kind,
      path: path.into(),
      dir: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitComparison {
  Eq,
  Ne,
}

/// The expected exit status of a command. Only the least significant 8
/// bits of the real status are meaningful portably, hence the u8.
#[derive(Debug, Clone, Copy)]
pub struct CommandExit {
  pub comparison: ExitComparison,
  pub code: u8,
}

impl Default for CommandExit {
  fn default() -> Self {
    Self {
      comparison: ExitComparison::Eq,
      code: 0,
    }
  }
}

/// A single command: program, arguments, three redirects, cleanups, and
/// the exit expectation.
#[derive(Debug, Clone)]
pub struct Command {
  pub program: PathBuf,
  pub arguments: Vec<String>,

  pub input: Redirect,
  pub out: Redirect,
  pub err: Redirect,

  pub cleanups: Vec<Cleanup>,

  pub exit: CommandExit,
}

impl Command {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      arguments: Vec::new(),
      input: Redirect::Pass,
      out: Redirect::Pass,
      err: Redirect::Pass,
      cleanups: Vec::new(),
      exit: CommandExit::default(),
    }
  }

  pub fn arg(mut self, a: impl Into<String>) -> Self {
    self.arguments.push(a.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.arguments.extend(args.into_iter().map(Into::into));
    self
  }
}

impl fmt::Display for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.program.display())?;
    for a in &self.arguments {
      write!(f, " {}", a)?;
    }
    Ok(())
  }
}

/// Commands connected into a pipe; started together, joined in order.
pub type Pipe = Vec<Command>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOperator {
  /// `||`: OR-ed to an implied false for the first term.
  Or,
  /// `&&`.
  And,
}

/// One term of a command expression.
#[derive(Debug, Clone)]
pub struct ExprTerm {
  pub op: ExprOperator,
  pub pipe: Pipe,
}

/// Pipes joined by `&&`/`||` with short-circuit evaluation.
pub type CommandExpr = Vec<ExprTerm>;
