//! The buildfile directive reader.
//!
//! Line-oriented evaluation of the subset of the build language the core
//! consumes: variable assignment (`=`, `+=`, `=+`, `?=`), target
//! declarations (`t: p1 p2`), `source`, `import`, and `export`. Names use
//! the `type{value}` syntax; `#` starts a comment line. The full build
//! language (blocks, conditionals, evaluation contexts) is the parser
//! collaborator's business, not the engine's.

use std::path::Path;

use thiserror::Error;

use crate::diag::Location;
use crate::name::{Name, NameError};
use crate::rule::{enter_target, MatchError};
use crate::scope::ScopeId;
use crate::target::TargetId;
use crate::variable::{Value, ValueError, VariableError};
use crate::Engine;

use super::LoadError;

#[derive(Debug, Error)]
pub enum BuildfileError {
  #[error("{loc}: syntax error: {msg}")]
  Syntax { loc: Location, msg: String },

  #[error("{loc}: {source}")]
  Name {
    loc: Location,
    #[source]
    source: NameError,
  },

  #[error("{loc}: {source}")]
  Value {
    loc: Location,
    #[source]
    source: ValueError,
  },

  #[error("{loc}: {source}")]
  Variable {
    loc: Location,
    #[source]
    source: VariableError,
  },

  #[error("{loc}: {source}")]
  Target {
    loc: Location,
    #[source]
    source: MatchError,
  },

  #[error("{loc}: {source}")]
  Import {
    loc: Location,
    #[source]
    source: Box<LoadError>,
  },

  #[error("{loc}: {source}")]
  Source {
    loc: Location,
    #[source]
    source: Box<LoadError>,
  },
}

/// What sourcing a buildfile produced.
#[derive(Default, Debug)]
pub struct SourceOutcome {
  /// Targets declared by this buildfile, in order.
  pub declared: Vec<TargetId>,

  /// The value of an `export` directive, if any (export stubs only).
  pub export: Option<Value>,
}

enum AssignOp {
  Assign,
  Append,
  Prepend,
  Default,
}

fn assign_op(tok: &str) -> Option<AssignOp> {
  match tok {
    "=" => Some(AssignOp::Assign),
    "+=" => Some(AssignOp::Append),
    "=+" => Some(AssignOp::Prepend),
    "?=" => Some(AssignOp::Default),
    _ => None,
  }
}

/// Evaluate a buildfile's content into the given root/base scopes.
pub fn evaluate(
  eng: &mut Engine,
  content: &str,
  path: &Path,
  root: ScopeId,
  base: ScopeId,
) -> Result<SourceOutcome, BuildfileError> {
  let mut out = SourceOutcome::default();

  for (i, raw) in content.lines().enumerate() {
    let loc = Location::new(path, i as u64 + 1, 1);
    let line = raw.trim();

    if line.is_empty() || line.starts_with('#') {
      continue;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();

    // Variable assignment.
    if tokens.len() >= 2 {
      if let Some(op) = assign_op(tokens[1]) {
        assignment(eng, &loc, base, tokens[0], op, &tokens[2..])?;
        continue;
      }
    }

    match tokens[0] {
      "source" => {
        if tokens.len() != 2 {
          return Err(BuildfileError::Syntax {
            loc,
            msg: "source expects a single path".to_string(),
          });
        }
        let dir = path.parent().unwrap_or(Path::new("."));
        let bf = crate::util::normalize(&dir.join(tokens[1]));
        let sub = super::source_once(eng, &bf, root, base, root)
          .map_err(|e| BuildfileError::Source {
            loc: loc.clone(),
            source: Box::new(e),
          })?;
        if let Some(sub) = sub {
          out.declared.extend(sub.declared);
        }
      }

      "export" => {
        let names = parse_names(&loc, &tokens[1..])?;
        out.export = Some(Value::Untyped(names));
      }

      _ => {
        // Target declaration: names, a colon, prerequisite names.
        target_declaration(eng, &loc, base, &tokens, &mut out)?;
      }
    }
  }

  Ok(out)
}

fn parse_names(loc: &Location, tokens: &[&str]) -> Result<Vec<Name>, BuildfileError> {
  tokens
    .iter()
    .map(|t| {
      Name::parse(t).map_err(|e| BuildfileError::Name {
        loc: loc.clone(),
        source: e,
      })
    })
    .collect()
}

fn assignment(
  eng: &mut Engine,
  loc: &Location,
  base: ScopeId,
  name: &str,
  op: AssignOp,
  rest: &[&str],
) -> Result<(), BuildfileError> {
  let var = eng
    .vars
    .insert(name, None, None)
    .map_err(|e| BuildfileError::Variable {
      loc: loc.clone(),
      source: e,
    })?;

  // The right-hand side: an import expression or a name list.
  let mut value = if rest.first() == Some(&"import") {
    let n = parse_names(loc, &rest[1..])?
      .into_iter()
      .next()
      .ok_or_else(|| BuildfileError::Syntax {
        loc: loc.clone(),
        msg: "import expects a name".to_string(),
      })?;
    super::import(eng, base, &n, loc).map_err(|e| BuildfileError::Import {
      loc: loc.clone(),
      source: Box::new(e),
    })?
  } else {
    Value::Untyped(parse_names(loc, rest)?)
  };

  // Assignments to typed variables are typified up front; append and
  // prepend convert element-wise as they go.
  if let Some(ty) = eng.vars.get(var).ty {
    if matches!(op, AssignOp::Assign | AssignOp::Default) {
      value = value.typify(ty).map_err(|e| BuildfileError::Value {
        loc: loc.clone(),
        source: e,
      })?;
    }
  }

  let vars = &mut eng.scopes.get_mut(base).vars;
  let r = match op {
    AssignOp::Assign => {
      *vars.assign(var) = value;
      Ok(())
    }
    AssignOp::Default => {
      vars.assign_default(var, value);
      Ok(())
    }
    AssignOp::Append => vars.append(var, value),
    AssignOp::Prepend => vars.prepend(var, value),
  };

  r.map_err(|e| BuildfileError::Value {
    loc: loc.clone(),
    source: e,
  })
}

fn target_declaration(
  eng: &mut Engine,
  loc: &Location,
  base: ScopeId,
  tokens: &[&str],
  out: &mut SourceOutcome,
) -> Result<(), BuildfileError> {
  // Find the separating colon: a bare `:` token or a trailing one.
  let mut lhs: Vec<&str> = Vec::new();
  let mut rhs: Vec<&str> = Vec::new();
  let mut seen_colon = false;

  for t in tokens {
    if seen_colon {
      rhs.push(t);
    } else if *t == ":" {
      seen_colon = true;
    } else if let Some(stripped) = t.strip_suffix(':') {
      lhs.push(stripped);
      seen_colon = true;
    } else {
      lhs.push(t);
    }
  }

  if !seen_colon || lhs.is_empty() {
    return Err(BuildfileError::Syntax {
      loc: loc.clone(),
      msg: format!("unrecognized directive '{}'", tokens.join(" ")),
    });
  }

  let targets = parse_names(loc, &lhs)?;
  let base_dir = eng.scopes.get(base).out_path.clone();

  // Anchor prerequisite directories at the declaring scope; the
  // dependent's own directory is not where relative names resolve.
  let prereqs: Vec<Name> = parse_names(loc, &rhs)?
    .into_iter()
    .map(|mut p| {
      p.dir = p.resolve_dir(&base_dir);
      p
    })
    .collect();

  for n in &targets {
    let id = enter_target(eng, &base_dir, n).map_err(|e| BuildfileError::Target {
      loc: loc.clone(),
      source: e,
    })?;
    let t = eng.targets.get(id);
    for p in &prereqs {
      t.add_prerequisite(p.clone());
    }
    out.declared.push(id);
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::variable::ValueType;
  use std::path::PathBuf;

  fn engine() -> (Engine, ScopeId) {
    let mut eng = Engine::new();
    let root = eng.scopes.insert(Path::new("/prj"), true);
    (eng, root)
  }

  fn eval(eng: &mut Engine, root: ScopeId, content: &str) -> SourceOutcome {
    evaluate(eng, content, Path::new("/prj/buildfile"), root, root).unwrap()
  }

  #[test]
  fn assigns_variables() {
    let (mut eng, root) = engine();
    eval(&mut eng, root, "greeting = hello world\n");

    let var = eng.vars.find("greeting").unwrap();
    let v = eng.scopes.get(root).vars.get(var).unwrap();
    assert_eq!(v.to_names().len(), 2);
  }

  #[test]
  fn typed_assignment_typifies() {
    let (mut eng, root) = engine();
    eng
      .vars
      .insert("flag", Some(ValueType::Bool), None)
      .unwrap();
    eval(&mut eng, root, "flag = true\n");

    let var = eng.vars.find("flag").unwrap();
    assert_eq!(
      eng.scopes.get(root).vars.get(var),
      Some(&Value::Bool(true))
    );
  }

  #[test]
  fn append_and_default_ops() {
    let (mut eng, root) = engine();
    eval(
      &mut eng,
      root,
      "x = a\nx += b\nx ?= ignored\ny ?= set\n",
    );

    let x = eng.vars.find("x").unwrap();
    assert_eq!(
      eng.scopes.get(root).vars.get(x).unwrap().to_names().len(),
      2
    );

    let y = eng.vars.find("y").unwrap();
    assert_eq!(
      eng.scopes.get(root).vars.get(y).unwrap().to_names()[0].value,
      "set"
    );
  }

  #[test]
  fn comments_and_blanks_are_skipped() {
    let (mut eng, root) = engine();
    let out = eval(&mut eng, root, "# a comment\n\n  \n");
    assert!(out.declared.is_empty());
  }

  #[test]
  fn declares_targets_with_prerequisites() {
    let (mut eng, root) = engine();
    let out = eval(&mut eng, root, "fsdir{a/b/}: fsdir{a/}\n");
    assert_eq!(out.declared.len(), 1);

    let t = eng.targets.get(out.declared[0]);
    assert_eq!(t.dir, PathBuf::from("/prj/a/b"));
    assert_eq!(t.prerequisites().len(), 1);
  }

  #[test]
  fn multiple_targets_share_prerequisites() {
    let (mut eng, root) = engine();
    let out = eval(&mut eng, root, "file{a.} file{b.} : file{c.}\n");
    assert_eq!(out.declared.len(), 2);
    for id in &out.declared {
      assert_eq!(eng.targets.get(*id).prerequisites().len(), 1);
    }
  }

  #[test]
  fn export_produces_value() {
    let (mut eng, root) = engine();
    let out = eval(&mut eng, root, "export file{hello.}\n");
    let v = out.export.unwrap();
    assert_eq!(v.to_names().len(), 1);
  }

  #[test]
  fn unrecognized_directive_is_syntax_error() {
    let (mut eng, root) = engine();
    let err = evaluate(
      &mut eng,
      "what is this",
      Path::new("/prj/buildfile"),
      root,
      root,
    )
    .unwrap_err();
    assert!(matches!(err, BuildfileError::Syntax { .. }));
  }

  #[test]
  fn locations_point_at_the_line() {
    let (mut eng, root) = engine();
    let err = evaluate(
      &mut eng,
      "x = ok\nbad directive here\n",
      Path::new("/prj/buildfile"),
      root,
      root,
    )
    .unwrap_err();
    assert!(err.to_string().contains("buildfile:2"));
  }
}
