//! The test-script sub-language: pre-parsed object model and the runner.

pub mod runner;
pub mod types;

pub use runner::{Runner, ScriptError, ScriptScope};
pub use types::{
  CleanupKind, Cleanup, Command, CommandExit, CommandExpr, ExitComparison, ExprOperator, ExprTerm,
  Line, LineKind, Pipe, Redirect, RedirectMode, RegexLine, RegexLines,
};
