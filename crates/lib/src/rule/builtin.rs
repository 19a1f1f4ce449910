//! Built-in rules: path, dir, and fsdir.
//!
//! The path rule is special: it is the declared fallback for path targets.
//! If it doesn't match then no other rule could have, and it can never be
//! ambiguous with an ordinary rule. Don't use it as a guide for writing
//! normal rules.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::action::{Action, CLEAN, DEFAULT, UPDATE};
use crate::target::types::{self};
use crate::target::{Recipe, RecipeError, Target, TargetId, TargetState};
use crate::Engine;

use super::{match_target, search_and_match, MatchData, Rule, RuleError};

/// Fallback rule for path targets: the target is a plain file expected to
/// exist on disk.
pub struct PathRule;

impl Rule for PathRule {
  fn name(&self) -> &str {
    "path"
  }

  fn fallback(&self) -> bool {
    true
  }

  fn matches(
    &self,
    eng: &Engine,
    a: Action,
    t: &Target,
    _hint: &str,
  ) -> Result<Option<MatchData>, RuleError> {
    // Only update needs the file to actually exist; for operations that
    // do nothing beyond forwarding to prerequisites we match regardless.
    if a.operation() == UPDATE {
      let p = t.derive_path(eng)?;
      Ok(if p.exists() {
        Some(MatchData::claim())
      } else {
        None
      })
    } else {
      Ok(Some(MatchData::claim()))
    }
  }

  fn apply(
    &self,
    eng: &Engine,
    a: Action,
    t: &Target,
    _data: MatchData,
  ) -> Result<Recipe, RuleError> {
    // An update of this target's prerequisites would render it out of
    // date, so there is nothing sensible to do for clean.
    if a.operation() == CLEAN {
      return Ok(Recipe::Noop);
    }

    search_and_match(eng, a, t, None)?;

    Ok(if a.operation() == UPDATE {
      Recipe::Perform(Arc::new(path_perform_update))
    } else if t.has_prerequisites() {
      Recipe::Default
    } else {
      Recipe::Noop
    })
  }
}

/// Verify the target is not older than any of its prerequisites.
fn path_perform_update(eng: &Engine, _a: Action, id: TargetId) -> Result<TargetState, RecipeError> {
  let t = eng.targets.get(id);
  let mt = t.mtime();

  for pid in t.prerequisite_targets() {
    let pt = eng.targets.get(pid);

    if eng.types.is_a(pt.ty, types::MTIME_TARGET) && pt.path().is_some() {
      let mp = pt.mtime();
      if let (Some(mt), Some(mp)) = (mt, mp) {
        if mt < mp {
          let delta = mp.duration_since(mt).unwrap_or_default();
          return Err(RecipeError::Fail(format!(
            "no recipe to update {}: prerequisite {} is ahead of {} by {:?}",
            eng.display(&t),
            eng.display(&pt),
            eng.display(&t),
            delta
          )));
        }
      }
    } else if pt.state() == TargetState::Changed {
      // Not an mtime-based target; assume it is newer if it changed.
      return Err(RecipeError::Fail(format!(
        "no recipe to update {}: prerequisite {} is ahead of {} because it was updated",
        eng.display(&t),
        eng.display(&pt),
        eng.display(&t)
      )));
    }
  }

  Ok(TargetState::Unchanged)
}

/// Alias-like rule for dir targets: forwards to prerequisites.
pub struct DirRule;

impl Rule for DirRule {
  fn name(&self) -> &str {
    "dir"
  }

  fn matches(
    &self,
    _eng: &Engine,
    _a: Action,
    _t: &Target,
    _hint: &str,
  ) -> Result<Option<MatchData>, RuleError> {
    Ok(Some(MatchData::claim()))
  }

  fn apply(
    &self,
    eng: &Engine,
    a: Action,
    t: &Target,
    _data: MatchData,
  ) -> Result<Recipe, RuleError> {
    match a.operation() {
      DEFAULT | UPDATE => search_and_match(eng, a, t, None)?,
      // When cleaning, ignore prerequisites that are not in the same or a
      // subdirectory of ours.
      CLEAN => {
        let d = t.dir.clone();
        search_and_match(eng, a, t, Some(&d))?;
      }
      _ => {
        return Err(RuleError::UnsupportedOperation {
          rule: self.name().to_string(),
        });
      }
    }
    Ok(Recipe::Default)
  }
}

/// Rule for fsdir targets: materialises a filesystem directory.
pub struct FsdirRule;

impl Rule for FsdirRule {
  fn name(&self) -> &str {
    "fsdir"
  }

  fn matches(
    &self,
    _eng: &Engine,
    _a: Action,
    _t: &Target,
    _hint: &str,
  ) -> Result<Option<MatchData>, RuleError> {
    Ok(Some(MatchData::claim()))
  }

  fn apply(
    &self,
    eng: &Engine,
    a: Action,
    t: &Target,
    _data: MatchData,
  ) -> Result<Recipe, RuleError> {
    inject_parent_fsdir(eng, a, t)?;

    match a.operation() {
      DEFAULT | UPDATE => search_and_match(eng, a, t, None)?,
      // For clean, ignore prerequisites outside our parent directory: if
      // t.dir is foo/bar/, then "we" are bar and our directory is foo/.
      CLEAN => {
        let filter = t.dir.parent().unwrap_or(&t.dir).to_path_buf();
        search_and_match(eng, a, t, Some(&filter))?;
      }
      _ => {
        return Err(RuleError::UnsupportedOperation {
          rule: self.name().to_string(),
        });
      }
    }

    Ok(match a.operation() {
      UPDATE => Recipe::Perform(Arc::new(fsdir_perform_update)),
      CLEAN => Recipe::Perform(Arc::new(fsdir_perform_clean)),
      _ => Recipe::Default,
    })
  }
}

/// Inject a dependency on the parent directory, staying within the
/// project's out root.
fn inject_parent_fsdir(eng: &Engine, a: Action, t: &Target) -> Result<(), RuleError> {
  let base = eng.base_scope(t);
  let root = match eng.scopes.root_scope(base) {
    Some(r) => r,
    None => return Ok(()),
  };
  let out_root = eng.scopes.get(root).out_path.clone();

  if t.dir == out_root || !t.dir.starts_with(&out_root) {
    return Ok(());
  }

  let parent = match t.dir.parent() {
    Some(p) if p.starts_with(&out_root) && p != out_root => p.to_path_buf(),
    _ => return Ok(()),
  };

  let (pid, _) = eng
    .targets
    .insert(&eng.exts, types::FSDIR, &parent, Path::new(""), "", None);
  eng.targets.get(pid).inc_dependents();
  t.push_prerequisite_target(pid);
  match_target(eng, a, pid, "")?;
  Ok(())
}

/// Create the directory after the prerequisites (the parent chain) have
/// been brought up to date.
fn fsdir_perform_update(eng: &Engine, _a: Action, id: TargetId) -> Result<TargetState, RecipeError> {
  let t = eng.targets.get(id);
  let d = &t.dir;

  // In the majority of cases the directory will already exist.
  if d.is_dir() {
    return Ok(TargetState::Unchanged);
  }

  info!("mkdir {}", d.display());
  match std::fs::create_dir(d) {
    Ok(()) => Ok(TargetState::Changed),
    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(TargetState::Unchanged),
    Err(e) => Err(RecipeError::Fail(format!(
      "unable to create directory {}: {}",
      d.display(),
      e
    ))),
  }
}

/// The reverse order of update: this directory is deleted first, the
/// prerequisites (parent chain) are cleaned after.
fn fsdir_perform_clean(eng: &Engine, _a: Action, id: TargetId) -> Result<TargetState, RecipeError> {
  let t = eng.targets.get(id);
  let d = &t.dir;

  if !d.exists() {
    return Ok(TargetState::Unchanged);
  }

  let occupied = std::fs::read_dir(d)?.next().is_some();
  if occupied {
    // Could not be performed at this time; the executor will retry.
    return Ok(TargetState::Postponed);
  }

  info!("rmdir {}", d.display());
  match std::fs::remove_dir(d) {
    Ok(()) => Ok(TargetState::Changed),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TargetState::Unchanged),
    Err(e) => Err(RecipeError::Fail(format!(
      "unable to remove directory {}: {}",
      d.display(),
      e
    ))),
  }
}

/// Register the built-in rules on a root scope the way the engine expects
/// them: the path rule as the update/clean fallback for path targets, and
/// the dir/fsdir rules for their types across default, update, and clean.
pub fn register_builtin_rules(rules: &mut super::RuleMap) {
  let path: Arc<dyn Rule> = Arc::new(PathRule);
  let dir: Arc<dyn Rule> = Arc::new(DirRule);
  let fsdir: Arc<dyn Rule> = Arc::new(FsdirRule);

  for op in [DEFAULT, UPDATE, CLEAN] {
    rules.insert(op, types::PATH_TARGET, "", path.clone());
    rules.insert(op, types::ALIAS, "", dir.clone());
    rules.insert(op, types::FSDIR, "", fsdir.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::PERFORM;
  use crate::rule::match_target;
  use crate::target::types::{FILE, FSDIR};
  use crate::target::ExecuteStart;
  use tempfile::TempDir;

  fn engine_at(root: &Path) -> Engine {
    let mut eng = Engine::new();
    let rs = eng.scopes.insert(root, true);
    register_builtin_rules(&mut eng.scopes.get_mut(rs).rules);
    eng
  }

  fn run_recipe(eng: &Engine, a: Action, id: TargetId) -> Result<TargetState, RecipeError> {
    let t = eng.targets.get(id);
    match t.begin_execute() {
      ExecuteStart::Done(st) => Ok(st),
      ExecuteStart::Run(r) => {
        let st = match r {
          Recipe::Noop => TargetState::Unchanged,
          Recipe::Default | Recipe::Group => TargetState::Unchanged,
          Recipe::Perform(f) => f(eng, a, id)?,
        };
        t.finish_execute(st);
        Ok(st)
      }
    }
  }

  #[test]
  fn path_rule_requires_existing_file_for_update() {
    let tmp = TempDir::new().unwrap();
    let eng = engine_at(tmp.path());

    let (id, _) = eng.targets.insert(
      &eng.exts,
      FILE,
      tmp.path(),
      Path::new(""),
      "missing",
      Some("txt"),
    );

    let err = match_target(&eng, Action::new(PERFORM, UPDATE), id, "").unwrap_err();
    assert!(matches!(err, crate::rule::MatchError::NoRule { .. }));
  }

  #[test]
  fn path_rule_matches_existing_file() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("hello.txt"), "hi").unwrap();

    let eng = engine_at(tmp.path());
    let (id, _) = eng.targets.insert(
      &eng.exts,
      FILE,
      tmp.path(),
      Path::new(""),
      "hello",
      Some("txt"),
    );

    let a = Action::new(PERFORM, UPDATE);
    match_target(&eng, a, id, "").unwrap();
    assert_eq!(run_recipe(&eng, a, id).unwrap(), TargetState::Unchanged);
  }

  #[test]
  fn path_rule_clean_is_noop() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("hello.txt"), "hi").unwrap();

    let eng = engine_at(tmp.path());
    let (id, _) = eng.targets.insert(
      &eng.exts,
      FILE,
      tmp.path(),
      Path::new(""),
      "hello",
      Some("txt"),
    );

    let a = Action::new(PERFORM, CLEAN);
    match_target(&eng, a, id, "").unwrap();
    // Noop recipe marks the target unchanged without executing.
    assert_eq!(eng.targets.get(id).state(), TargetState::Unchanged);
  }

  #[test]
  fn path_rule_fails_on_newer_prerequisite() {
    use std::time::{Duration, SystemTime};

    let tmp = TempDir::new().unwrap();
    let hello = tmp.path().join("hello.txt");
    let world = tmp.path().join("world.txt");
    std::fs::write(&hello, "hello").unwrap();
    std::fs::write(&world, "world").unwrap();

    // Backdate the target so the prerequisite is strictly newer.
    let f = std::fs::OpenOptions::new().write(true).open(&hello).unwrap();
    f.set_modified(SystemTime::now() - Duration::from_secs(3600))
      .unwrap();

    let eng = engine_at(tmp.path());
    let (id, _) = eng.targets.insert(
      &eng.exts,
      FILE,
      tmp.path(),
      Path::new(""),
      "hello",
      Some("txt"),
    );
    eng
      .targets
      .get(id)
      .add_prerequisite(crate::name::Name::parse("file{world.txt}").unwrap());

    let a = Action::new(PERFORM, UPDATE);
    match_target(&eng, a, id, "").unwrap();

    // Execute the prerequisite first, then the target.
    let t = eng.targets.get(id);
    for pid in t.prerequisite_targets() {
      run_recipe(&eng, a, pid).unwrap();
    }
    let err = run_recipe(&eng, a, id).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("ahead of"), "unexpected diagnostics: {msg}");
  }

  #[test]
  fn fsdir_update_creates_and_clean_removes() {
    let tmp = TempDir::new().unwrap();
    let eng = engine_at(tmp.path());

    let dir = tmp.path().join("a");
    let (id, _) = eng
      .targets
      .insert(&eng.exts, FSDIR, &dir, Path::new(""), "", None);

    let update = Action::new(PERFORM, UPDATE);
    match_target(&eng, update, id, "").unwrap();
    assert_eq!(run_recipe(&eng, update, id).unwrap(), TargetState::Changed);
    assert!(dir.is_dir());

    // A second update is unchanged.
    eng.targets.reset();
    match_target(&eng, update, id, "").unwrap();
    assert_eq!(run_recipe(&eng, update, id).unwrap(), TargetState::Unchanged);

    eng.targets.reset();
    let clean = Action::new(PERFORM, CLEAN);
    match_target(&eng, clean, id, "").unwrap();
    assert_eq!(run_recipe(&eng, clean, id).unwrap(), TargetState::Changed);
    assert!(!dir.exists());
  }

  #[test]
  fn fsdir_clean_of_occupied_dir_postpones() {
    let tmp = TempDir::new().unwrap();
    let eng = engine_at(tmp.path());

    let dir = tmp.path().join("busy");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("file"), "x").unwrap();

    let (id, _) = eng
      .targets
      .insert(&eng.exts, FSDIR, &dir, Path::new(""), "", None);

    let clean = Action::new(PERFORM, CLEAN);
    match_target(&eng, clean, id, "").unwrap();
    assert_eq!(run_recipe(&eng, clean, id).unwrap(), TargetState::Postponed);
    assert!(dir.exists());
  }

  #[test]
  fn fsdir_injects_parent_directory() {
    let tmp = TempDir::new().unwrap();
    let eng = engine_at(tmp.path());

    let deep = tmp.path().join("a/b");
    let (id, _) = eng
      .targets
      .insert(&eng.exts, FSDIR, &deep, Path::new(""), "", None);

    let update = Action::new(PERFORM, UPDATE);
    match_target(&eng, update, id, "").unwrap();

    let t = eng.targets.get(id);
    let prereqs = t.prerequisite_targets();
    assert_eq!(prereqs.len(), 1);
    let parent = eng.targets.get(prereqs[0]);
    assert_eq!(parent.dir, tmp.path().join("a"));
    assert_eq!(parent.dependents(), 1);
  }

  #[test]
  fn dir_rule_rejects_unknown_operation() {
    use crate::action::OperationId;

    let tmp = TempDir::new().unwrap();
    let eng = engine_at(tmp.path());

    let (id, _) = eng.targets.insert(
      &eng.exts,
      types::DIR,
      tmp.path(),
      Path::new(""),
      "",
      None,
    );

    // Register dir rule under a made-up operation id and try to apply it.
    let a = Action::new(PERFORM, OperationId(9));
    let t = eng.targets.get(id);
    let err = DirRule
      .apply(&eng, a, &t, MatchData::claim())
      .unwrap_err();
    assert!(matches!(err, RuleError::UnsupportedOperation { .. }));
  }
}
