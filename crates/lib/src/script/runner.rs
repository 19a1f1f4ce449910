//! The test-script runner.
//!
//! Commands run with the script scope's working directory as CWD and
//! their standard streams redirected to files; once a child exits and its
//! status is validated, each captured file is compared with the expected
//! output. Capturing to files (rather than pipes) sidesteps non-blocking
//! reads of two streams and leaves the output of a faulty command around
//! for troubleshooting.
//!
//! Literal here content is compared with the external `diff` utility over
//! a materialised `.orig` sibling; regex here content is matched line by
//! line against the captured file. Cleanups registered during the scope's
//! lifetime run in reverse order when the scope is left.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};

use thiserror::Error;
use tracing::{trace, warn};

use crate::diag::Verbosity;
use crate::util::normalize;

use super::types::{
  CleanupKind, Cleanup, Command, CommandExpr, ExitComparison, ExprOperator, Pipe, Redirect,
  RedirectMode, RegexLines,
};

#[derive(Debug, Error)]
pub enum ScriptError {
  #[error("directory {0} is not empty; clean it up and rerun")]
  WorkdirNotEmpty(PathBuf),

  #[error("unable to execute {program}: {source}")]
  Exec {
    program: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("program {0} not found in PATH")]
  ProgramNotFound(PathBuf),

  #[error("{program}: {msg}")]
  Exit { program: PathBuf, msg: String },

  #[error("{program} unexpectedly writes to {name}; {name} is saved to {path}")]
  UnexpectedOutput {
    program: PathBuf,
    name: &'static str,
    path: PathBuf,
  },

  #[error(
    "{program} {name} doesn't match the expected output; {name} is saved to {output}, expected output to {expected}"
  )]
  OutputMismatch {
    program: PathBuf,
    name: &'static str,
    output: PathBuf,
    expected: PathBuf,
  },

  #[error("unable to compare {name} with the expected output: {msg}")]
  CompareFailed { name: &'static str, msg: String },

  #[error("invalid {name} redirect for {program}")]
  InvalidRedirect {
    program: PathBuf,
    name: &'static str,
  },

  #[error("registered for cleanup directory {0} is not empty")]
  CleanupDirNotEmpty(PathBuf),

  #[error("registered for cleanup path {0} does not exist")]
  CleanupMissing(PathBuf),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Regex(#[from] regex::Error),
}

/// A script scope: a nested block with its own working directory, cleanup
/// stack, and local variables.
pub struct ScriptScope {
  pub work_dir: PathBuf,
  pub vars: HashMap<String, String>,
  cleanups: Vec<Cleanup>,
}

impl ScriptScope {
  pub fn new(work_dir: impl Into<PathBuf>) -> Self {
    Self {
      work_dir: work_dir.into(),
      vars: HashMap::new(),
      cleanups: Vec::new(),
    }
  }

  /// Register a path for cleanup when the scope is left.
  pub fn clean(&mut self, c: Cleanup) {
    self.cleanups.push(c);
  }

  fn normalize(&self, p: &Path) -> PathBuf {
    if p.is_absolute() {
      normalize(p)
    } else {
      normalize(&self.work_dir.join(p))
    }
  }
}

/// Runs commands within script scopes. Commands in distinct scopes may
/// run in parallel (each on its own runner call); commands within a pipe
/// are started together and joined in order.
pub struct Runner {
  pub verbosity: Verbosity,
}

impl Default for Runner {
  fn default() -> Self {
    Self {
      verbosity: Verbosity::DEFAULT,
    }
  }
}

struct Spawned {
  child: Child,
  program: PathBuf,
  here_in: Option<String>,
  out_capture: Option<PathBuf>,
  err_capture: Option<PathBuf>,
}

impl Runner {
  pub fn new(verbosity: Verbosity) -> Self {
    Self { verbosity }
  }

  /// Enter a scope: create its working directory (which must be empty if
  /// it already exists) and register it for cleanup.
  pub fn enter(&self, sp: &mut ScriptScope) -> Result<(), ScriptError> {
    let wd = sp.work_dir.clone();

    if !wd.exists() {
      std::fs::create_dir_all(&wd)?;
    } else if std::fs::read_dir(&wd)?.next().is_some() {
      return Err(ScriptError::WorkdirNotEmpty(wd));
    }

    sp.clean(Cleanup::dir(CleanupKind::Always, wd));
    Ok(())
  }

  /// Run a command, failing on any mismatch.
  pub fn run(&self, sp: &mut ScriptScope, c: &Command, ci: usize) -> Result<(), ScriptError> {
    let matched = self.run_pipe_impl(sp, std::slice::from_ref(c), ci, true)?;
    debug_assert!(matched, "exit mismatch must have failed");
    Ok(())
  }

  /// Run a command as a condition: an exit-status mismatch yields false
  /// instead of failing (output mismatches still fail).
  pub fn run_cond(&self, sp: &mut ScriptScope, c: &Command, ci: usize) -> Result<bool, ScriptError> {
    self.run_pipe_impl(sp, std::slice::from_ref(c), ci, false)
  }

  /// Run a pipe, failing on any mismatch.
  pub fn run_pipe(&self, sp: &mut ScriptScope, pipe: &Pipe, ci: usize) -> Result<(), ScriptError> {
    let matched = self.run_pipe_impl(sp, pipe, ci, true)?;
    debug_assert!(matched);
    Ok(())
  }

  /// Evaluate a command expression with short-circuiting.
  pub fn run_expr(&self, sp: &mut ScriptScope, expr: &CommandExpr) -> Result<bool, ScriptError> {
    let mut value = false;
    let mut ci = 0;

    for term in expr {
      let skip = match term.op {
        ExprOperator::Or => value,
        ExprOperator::And => !value,
      };
      if !skip {
        value = self.run_pipe_impl(sp, &term.pipe, ci, false)?;
      }
      ci += term.pipe.len();
    }

    Ok(value)
  }

  /// Leave a scope: walk the cleanup stack in reverse registration order,
  /// removing each unique path.
  pub fn leave(&self, sp: &mut ScriptScope) -> Result<(), ScriptError> {
    let cleanups: Vec<Cleanup> = sp.cleanups.drain(..).collect();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for c in cleanups.into_iter().rev() {
      // Repeated registration of a path is valid; remove it once.
      if !seen.insert(c.path.clone()) {
        continue;
      }

      match c.kind {
        CleanupKind::Never => {
          if !c.path.exists() {
            return Err(ScriptError::CleanupMissing(c.path));
          }
        }
        CleanupKind::Always | CleanupKind::Maybe => {
          let missing_ok = c.kind == CleanupKind::Maybe;

          if c.dir {
            if !c.path.exists() {
              if missing_ok {
                continue;
              }
              return Err(ScriptError::CleanupMissing(c.path));
            }
            if std::fs::read_dir(&c.path)?.next().is_some() {
              return Err(ScriptError::CleanupDirNotEmpty(c.path));
            }
            std::fs::remove_dir(&c.path)?;
          } else {
            match std::fs::remove_file(&c.path) {
              Ok(()) => {}
              Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !missing_ok {
                  return Err(ScriptError::CleanupMissing(c.path));
                }
              }
              Err(e) => return Err(e.into()),
            }
          }
        }
      }
    }

    Ok(())
  }

  fn run_pipe_impl(
    &self,
    sp: &mut ScriptScope,
    pipe: &[Command],
    ci: usize,
    diag: bool,
  ) -> Result<bool, ScriptError> {
    let last = pipe.len().saturating_sub(1);

    // Start all commands, chaining stdout to the next stdin.
    let mut spawned: Vec<Spawned> = Vec::with_capacity(pipe.len());
    let mut prev_stdout = None;

    for (i, c) in pipe.iter().enumerate() {
      let s = self.spawn_command(sp, c, ci + i, prev_stdout.take(), i < last)?;
      spawned.push(s);
      if i < last {
        prev_stdout = spawned
          .last_mut()
          .and_then(|s| s.child.stdout.take())
          .map(Stdio::from);
      }
    }

    // Here-document content delivery happens before the child wait.
    for s in &mut spawned {
      if let Some(content) = s.here_in.take() {
        if let Some(mut stdin) = s.child.stdin.take() {
          stdin.write_all(content.as_bytes())?;
        }
      }
    }

    // Join in order and validate.
    let mut all_matched = true;
    for (i, (c, mut s)) in pipe.iter().zip(spawned.into_iter()).enumerate() {
      let status = s.child.wait().map_err(|e| ScriptError::Exec {
        program: s.program.clone(),
        source: e,
      })?;

      let matched = self.check_exit(sp, c, &s, status.code(), diag)?;
      if !matched {
        all_matched = false;
        continue;
      }

      // Check whether the standard outputs match expectations.
      if i == last || !matches!(c.out.effective(), Redirect::Pass) {
        if let Some(p) = &s.out_capture {
          self.check_output(sp, &s.program, "stdout", p, &c.out)?;
        }
      }
      if let Some(p) = &s.err_capture {
        self.check_output(sp, &s.program, "stderr", p, &c.err)?;
      }

      // Register command-declared cleanup paths relative to the scope CWD.
      for cl in &c.cleanups {
        let mut cl = cl.clone();
        cl.path = sp.normalize(&cl.path);
        sp.clean(cl);
      }
    }

    Ok(all_matched)
  }

  fn spawn_command(
    &self,
    sp: &mut ScriptScope,
    c: &Command,
    ci: usize,
    stdin_override: Option<Stdio>,
    pipe_stdout: bool,
  ) -> Result<Spawned, ScriptError> {
    // Pre-search the program so the path is reflected in diagnostics.
    let program = resolve_program(&c.program)?;

    if self.verbosity.commands() {
      trace!(command = %c, "running");
    }

    let mut cmd = std::process::Command::new(&program);
    cmd.args(&c.arguments).current_dir(&sp.work_dir);

    // stdin.
    let mut here_in = None;
    match stdin_override {
      Some(s) => {
        cmd.stdin(s);
      }
      None => match c.input.effective() {
        Redirect::Pass => {
          cmd.stdin(Stdio::inherit());
        }
        // For 'none' we rely on a read from /dev/null failing to produce
        // the data the program expects.
        Redirect::Null | Redirect::None => {
          cmd.stdin(Stdio::null());
        }
        Redirect::HereStrLiteral(s) | Redirect::HereDocLiteral(s) => {
          here_in = Some(s.clone());
          cmd.stdin(Stdio::piped());
        }
        Redirect::File { path, .. } => {
          let p = sp.normalize(path);
          let f = std::fs::File::open(&p)?;
          cmd.stdin(Stdio::from(f));
        }
        _ => {
          return Err(ScriptError::InvalidRedirect {
            program,
            name: "stdin",
          });
        }
      },
    }

    // stdout/stderr. Open the non-merge stream first so a merge can
    // duplicate its handle.
    let mut out_capture = None;
    let mut err_capture = None;

    if pipe_stdout {
      cmd.stdout(Stdio::piped());
      let (err_stdio, err_p, _) = self.open_output(sp, &c.err, "stderr", ci, None)?;
      cmd.stderr(err_stdio);
      err_capture = err_p;
    } else {
      match (c.out.effective(), c.err.effective()) {
        (Redirect::Merge(2), _) => {
          let (err_stdio, err_p, err_file) = self.open_output(sp, &c.err, "stderr", ci, None)?;
          let (out_stdio, out_p, _) =
            self.open_output(sp, &c.out, "stdout", ci, err_file.as_ref())?;
          cmd.stdout(out_stdio);
          cmd.stderr(err_stdio);
          out_capture = out_p;
          err_capture = err_p;
        }
        _ => {
          let (out_stdio, out_p, out_file) = self.open_output(sp, &c.out, "stdout", ci, None)?;
          let (err_stdio, err_p, _) =
            self.open_output(sp, &c.err, "stderr", ci, out_file.as_ref())?;
          cmd.stdout(out_stdio);
          cmd.stderr(err_stdio);
          out_capture = out_p;
          err_capture = err_p;
        }
      }
    }

    let child = cmd.spawn().map_err(|e| ScriptError::Exec {
      program: program.clone(),
      source: e,
    })?;

    Ok(Spawned {
      child,
      program,
      here_in,
      out_capture,
      err_capture,
    })
  }

  /// Open a file (or pass-through) for an output redirect. Returns the
  /// Stdio, the capture path when the content needs validation, and the
  /// opened file for merge duplication.
  fn open_output(
    &self,
    sp: &mut ScriptScope,
    r: &Redirect,
    name: &'static str,
    ci: usize,
    merge_source: Option<&std::fs::File>,
  ) -> Result<(Stdio, Option<PathBuf>, Option<std::fs::File>), ScriptError> {
    let capture_name = |base: &str| {
      if ci > 0 {
        format!("{}-{}", base, ci)
      } else {
        base.to_string()
      }
    };

    match r.effective() {
      Redirect::Pass => Ok((Stdio::inherit(), None, None)),
      Redirect::Null => Ok((Stdio::null(), None, None)),
      Redirect::Merge(_) => {
        let f = merge_source.ok_or(ScriptError::InvalidRedirect {
          program: PathBuf::new(),
          name,
        })?;
        Ok((Stdio::from(f.try_clone()?), None, None))
      }
      Redirect::File { path, mode } => {
        let p = sp.normalize(path);
        match mode {
          RedirectMode::Overwrite | RedirectMode::Append => {
            let f = std::fs::OpenOptions::new()
              .write(true)
              .create(true)
              .append(*mode == RedirectMode::Append)
              .truncate(*mode == RedirectMode::Overwrite)
              .open(&p)?;
            let stdio = Stdio::from(f.try_clone()?);
            Ok((stdio, None, Some(f)))
          }
          // For compare, capture to a scope-local file and diff against
          // the named one afterwards.
          RedirectMode::Compare => {
            let cp = sp.normalize(Path::new(&capture_name(name)));
            let f = std::fs::File::create(&cp)?;
            sp.clean(Cleanup::file(CleanupKind::Always, cp.clone()));
            let stdio = Stdio::from(f.try_clone()?);
            Ok((stdio, Some(cp), Some(f)))
          }
        }
      }
      Redirect::None
      | Redirect::Trace
      | Redirect::HereStrLiteral(_)
      | Redirect::HereStrRegex(_)
      | Redirect::HereDocLiteral(_)
      | Redirect::HereDocRegex(_) => {
        let p = sp.normalize(Path::new(&capture_name(name)));
        let f = std::fs::File::create(&p)?;
        // Repeated registration is fine; duplicates are handled on leave.
        sp.clean(Cleanup::file(CleanupKind::Always, p.clone()));
        let stdio = Stdio::from(f.try_clone()?);
        Ok((stdio, Some(p), Some(f)))
      }
      Redirect::HereDocRef(_) => unreachable!("effective() resolves references"),
    }
  }

  /// Validate the exit status. On mismatch, dump the cached stderr and
  /// either fail (diag) or report false.
  fn check_exit(
    &self,
    _sp: &ScriptScope,
    c: &Command,
    s: &Spawned,
    status: Option<i32>,
    diag: bool,
  ) -> Result<bool, ScriptError> {
    let valid = matches!(status, Some(st) if (0..256).contains(&st));
    let eq = c.exit.comparison == ExitComparison::Eq;
    let correct = matches!(status, Some(st) if valid && ((st == c.exit.code as i32) == eq));

    if correct {
      return Ok(true);
    }

    if !diag {
      // Condition context: an exit mismatch is just a false value, but a
      // status we cannot interpret still fails.
      if valid {
        return Ok(false);
      }
    }

    // Dump cached stderr to ease troubleshooting.
    if let Some(p) = &s.err_capture {
      if let Ok(content) = std::fs::read_to_string(p) {
        if !content.is_empty() {
          eprint!("{}", content);
        }
      }
    }

    let msg = match status {
      None => "terminated abnormally".to_string(),
      Some(st) if !valid => format!(
        "exit status {} is invalid: must be an unsigned integer < 256",
        st
      ),
      Some(st) => format!(
        "exit status {} {} {}",
        st,
        if eq { "!=" } else { "==" },
        c.exit.code
      ),
    };

    Err(ScriptError::Exit {
      program: s.program.clone(),
      msg,
    })
  }

  /// Check a captured output file against its redirect expectation.
  fn check_output(
    &self,
    sp: &mut ScriptScope,
    program: &Path,
    name: &'static str,
    captured: &Path,
    r: &Redirect,
  ) -> Result<(), ScriptError> {
    match r.effective() {
      Redirect::None => {
        if non_empty(captured) {
          return Err(ScriptError::UnexpectedOutput {
            program: program.to_path_buf(),
            name,
            path: captured.to_path_buf(),
          });
        }
        Ok(())
      }

      Redirect::Trace => {
        if let Ok(content) = std::fs::read_to_string(captured) {
          for line in content.lines() {
            trace!("{}: {}", name, line);
          }
        }
        Ok(())
      }

      Redirect::HereStrLiteral(expected) | Redirect::HereDocLiteral(expected) => {
        let orig = materialise_orig(sp, captured, expected)?;
        self.diff(program, name, &orig, captured)
      }

      Redirect::HereStrRegex(rl) | Redirect::HereDocRegex(rl) => {
        let rendered: String = rl
          .lines
          .iter()
          .map(|l| format!("{}\n", l.value))
          .collect();
        let orig = materialise_orig(sp, captured, &rendered)?;
        self.match_regex(program, name, captured, &orig, rl)
      }

      Redirect::File {
        path,
        mode: RedirectMode::Compare,
      } => {
        let expected = sp.normalize(path);
        self.diff(program, name, &expected, captured)
      }

      _ => Ok(()),
    }
  }

  /// Compare expected and actual output with the diff utility. Its output
  /// is part of the test failure diagnostics, so it goes to stderr.
  fn diff(
    &self,
    program: &Path,
    name: &'static str,
    expected: &Path,
    actual: &Path,
  ) -> Result<(), ScriptError> {
    let output = std::process::Command::new("diff")
      .arg("--strip-trailing-cr")
      .arg("-u")
      .arg(expected)
      .arg(actual)
      .output()
      .map_err(|e| ScriptError::CompareFailed {
        name,
        msg: format!("unable to execute diff: {}", e),
      })?;

    if output.status.success() {
      return Ok(());
    }

    std::io::stderr().write_all(&output.stdout).ok();

    Err(ScriptError::OutputMismatch {
      program: program.to_path_buf(),
      name,
      output: actual.to_path_buf(),
      expected: expected.to_path_buf(),
    })
  }

  /// Match captured output line by line against a regex here-document.
  fn match_regex(
    &self,
    program: &Path,
    name: &'static str,
    captured: &Path,
    orig: &Path,
    rl: &RegexLines,
  ) -> Result<(), ScriptError> {
    let content = std::fs::read_to_string(captured)?;
    let actual: Vec<&str> = content.lines().collect();

    let mismatch = || ScriptError::OutputMismatch {
      program: program.to_path_buf(),
      name,
      output: captured.to_path_buf(),
      expected: orig.to_path_buf(),
    };

    if actual.len() != rl.lines.len() {
      warn!(
        expected = rl.lines.len(),
        got = actual.len(),
        "{} line count differs", name
      );
      return Err(mismatch());
    }

    for (line, expect) in actual.iter().zip(&rl.lines) {
      let ok = if expect.regex {
        let mut pattern = String::new();
        if rl.flags.contains('i') || expect.flags.contains('i') {
          pattern.push_str("(?i)");
        }
        pattern.push_str(&format!("^(?:{})$", expect.value));
        regex::Regex::new(&pattern)?.is_match(line)
      } else {
        *line == expect.value
      };

      if !ok {
        warn!(line = expect.line, "{} does not match", name);
        return Err(mismatch());
      }
    }

    Ok(())
  }
}

/// Write the expected content next to the captured file as `<name>.orig`
/// and register it for cleanup.
fn materialise_orig(
  sp: &mut ScriptScope,
  captured: &Path,
  expected: &str,
) -> Result<PathBuf, ScriptError> {
  let mut os = captured.as_os_str().to_os_string();
  os.push(".orig");
  let orig = PathBuf::from(os);

  std::fs::write(&orig, expected)?;
  sp.clean(Cleanup::file(CleanupKind::Always, orig.clone()));
  Ok(orig)
}

fn non_empty(p: &Path) -> bool {
  std::fs::metadata(p).map(|m| m.len() > 0).unwrap_or(false)
}

/// Resolve a program via PATH; multi-component paths are used as is.
fn resolve_program(p: &Path) -> Result<PathBuf, ScriptError> {
  if p.is_absolute() || p.components().count() > 1 {
    return Ok(p.to_path_buf());
  }

  if let Some(paths) = std::env::var_os("PATH") {
    for dir in std::env::split_paths(&paths) {
      let cand = dir.join(p);
      if cand.is_file() {
        return Ok(cand);
      }
    }
  }

  Err(ScriptError::ProgramNotFound(p.to_path_buf()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::script::types::ExprTerm;
  use crate::util::testutil::shell_cmd;
  use tempfile::TempDir;

  fn scope(tmp: &TempDir) -> ScriptScope {
    ScriptScope::new(tmp.path().join("test"))
  }

  fn sh(script: &str) -> Command {
    let (prog, args) = shell_cmd(script);
    Command::new(prog).args(args)
  }

  #[test]
  fn enter_creates_working_directory() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();

    runner.enter(&mut sp).unwrap();
    assert!(sp.work_dir.is_dir());

    runner.leave(&mut sp).unwrap();
    assert!(!sp.work_dir.exists());
  }

  #[test]
  fn enter_rejects_occupied_directory() {
    let tmp = TempDir::new().unwrap();
    let wd = tmp.path().join("test");
    std::fs::create_dir_all(&wd).unwrap();
    std::fs::write(wd.join("junk"), "x").unwrap();

    let mut sp = ScriptScope::new(wd);
    let err = Runner::default().enter(&mut sp).unwrap_err();
    assert!(matches!(err, ScriptError::WorkdirNotEmpty(_)));
  }

  #[test]
  fn here_string_comparison_passes() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut c = sh("echo foo");
    c.out = Redirect::HereStrLiteral("foo\n".to_string());

    runner.run(&mut sp, &c, 0).unwrap();
    runner.leave(&mut sp).unwrap();
  }

  #[test]
  fn here_string_mismatch_preserves_files() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut c = sh("echo foo");
    c.out = Redirect::HereStrLiteral("bar\n".to_string());

    let err = runner.run(&mut sp, &c, 0).unwrap_err();
    match err {
      ScriptError::OutputMismatch {
        output, expected, ..
      } => {
        assert!(output.exists(), "captured output must be preserved");
        assert!(expected.exists(), "expected output must be preserved");
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), "bar\n");
      }
      other => panic!("expected output mismatch, got {other}"),
    }
  }

  #[test]
  fn here_doc_on_stdin() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut c = sh("cat");
    c.input = Redirect::HereDocLiteral("line1\nline2\n".to_string());
    c.out = Redirect::HereDocLiteral("line1\nline2\n".to_string());

    runner.run(&mut sp, &c, 0).unwrap();
    runner.leave(&mut sp).unwrap();
  }

  #[test]
  fn none_redirect_asserts_silence() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut quiet = sh("true");
    quiet.out = Redirect::None;
    runner.run(&mut sp, &quiet, 0).unwrap();

    let mut loud = sh("echo noise");
    loud.out = Redirect::None;
    let err = runner.run(&mut sp, &loud, 1).unwrap_err();
    assert!(matches!(err, ScriptError::UnexpectedOutput { .. }));
  }

  #[test]
  fn exit_expectation_ne() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut c = sh("exit 3");
    c.exit = crate::script::types::CommandExit {
      comparison: ExitComparison::Ne,
      code: 0,
    };
    runner.run(&mut sp, &c, 0).unwrap();
  }

  #[test]
  fn exit_mismatch_fails_with_status() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let c = sh("exit 2");
    let err = runner.run(&mut sp, &c, 0).unwrap_err();
    match err {
      ScriptError::Exit { msg, .. } => assert!(msg.contains("2 != 0"), "got: {msg}"),
      other => panic!("expected exit error, got {other}"),
    }
  }

  #[test]
  fn regex_here_doc_matches() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut c = sh("printf 'hello 42\\nbye\\n'");
    c.out = Redirect::HereDocRegex(RegexLines {
      intro: '~',
      flags: String::new(),
      lines: vec![
        crate::script::types::RegexLine::pattern("hello [0-9]+", "", 1),
        crate::script::types::RegexLine::literal("bye", 2),
      ],
    });

    runner.run(&mut sp, &c, 0).unwrap();
  }

  #[test]
  fn regex_here_doc_mismatch() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut c = sh("echo nope");
    c.out = Redirect::HereDocRegex(RegexLines {
      intro: '~',
      flags: String::new(),
      lines: vec![crate::script::types::RegexLine::pattern("y[ae]s", "", 1)],
    });

    let err = runner.run(&mut sp, &c, 0).unwrap_err();
    assert!(matches!(err, ScriptError::OutputMismatch { .. }));
  }

  #[test]
  fn pipe_connects_commands() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let first = sh("printf 'b\\na\\n'");
    let mut second = sh("sort");
    second.out = Redirect::HereDocLiteral("a\nb\n".to_string());

    runner.run_pipe(&mut sp, &vec![first, second], 0).unwrap();
  }

  #[test]
  fn expression_short_circuits() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let marker = sp.work_dir.join("ran");

    // false && touch -> the touch must not run.
    let expr = vec![
      ExprTerm {
        op: ExprOperator::Or,
        pipe: vec![sh("false")],
      },
      ExprTerm {
        op: ExprOperator::And,
        pipe: vec![sh(&format!("touch {}", marker.display()))],
      },
    ];
    assert!(!runner.run_expr(&mut sp, &expr).unwrap());
    assert!(!marker.exists());

    // false || touch -> the touch runs.
    let expr = vec![
      ExprTerm {
        op: ExprOperator::Or,
        pipe: vec![sh("false")],
      },
      ExprTerm {
        op: ExprOperator::Or,
        pipe: vec![sh(&format!("touch {}", marker.display()))],
      },
    ];
    assert!(runner.run_expr(&mut sp, &expr).unwrap());
    assert!(marker.exists());

    std::fs::remove_file(&marker).unwrap();
  }

  #[test]
  fn cleanup_reverse_order_with_dedup() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    // A directory registered before the file inside it: reverse order
    // must remove the file first or rmdir would fail.
    let d = sp.work_dir.join("d");
    std::fs::create_dir(&d).unwrap();
    let f = d.join("f");
    std::fs::write(&f, "x").unwrap();

    sp.clean(Cleanup::dir(CleanupKind::Always, d.clone()));
    sp.clean(Cleanup::file(CleanupKind::Always, f.clone()));
    // A duplicate registration must not turn into a second removal.
    sp.clean(Cleanup::file(CleanupKind::Always, f.clone()));

    runner.leave(&mut sp).unwrap();
    assert!(!d.exists());
    assert!(!sp.work_dir.exists());
  }

  #[test]
  fn cleanup_missing_file_fails_unless_maybe() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    sp.clean(Cleanup::file(
      CleanupKind::Maybe,
      sp.work_dir.join("absent"),
    ));
    runner.leave(&mut sp).unwrap();

    let mut sp2 = ScriptScope::new(tmp.path().join("test2"));
    runner.enter(&mut sp2).unwrap();
    sp2.clean(Cleanup::file(
      CleanupKind::Always,
      sp2.work_dir.join("absent"),
    ));
    let err = runner.leave(&mut sp2).unwrap_err();
    assert!(matches!(err, ScriptError::CleanupMissing(_)));
  }

  #[test]
  fn file_redirect_overwrite_and_compare() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    // Write output to a file.
    let mut w = sh("echo stored");
    w.out = Redirect::File {
      path: PathBuf::from("result"),
      mode: RedirectMode::Overwrite,
    };
    w.cleanups
      .push(Cleanup::file(CleanupKind::Always, PathBuf::from("result")));
    runner.run(&mut sp, &w, 0).unwrap();
    assert_eq!(
      std::fs::read_to_string(sp.work_dir.join("result")).unwrap(),
      "stored\n"
    );

    // Compare against it.
    let mut c = sh("echo stored");
    c.out = Redirect::File {
      path: PathBuf::from("result"),
      mode: RedirectMode::Compare,
    };
    runner.run(&mut sp, &c, 1).unwrap();

    runner.leave(&mut sp).unwrap();
  }

  #[test]
  fn merge_stderr_into_stdout() {
    let tmp = TempDir::new().unwrap();
    let mut sp = scope(&tmp);
    let runner = Runner::default();
    runner.enter(&mut sp).unwrap();

    let mut c = sh("echo out; echo err 1>&2");
    c.out = Redirect::HereDocLiteral("out\nerr\n".to_string());
    c.err = Redirect::Merge(1);

    runner.run(&mut sp, &c, 0).unwrap();
  }
}
