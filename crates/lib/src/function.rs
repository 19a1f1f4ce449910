//! Built-in functions callable from buildfiles.
//!
//! A function family is registered under a name with one or more
//! overloads; resolution picks the first overload whose declared argument
//! types accept the (possibly still untyped) arguments. Null arguments
//! are permitted only for overloads that opt in. Impure functions
//! (`getenv`, `defined`, `visibility`) are marked as such so a caching
//! evaluator knows not to memoize them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

use crate::name::Name;
use crate::scope::ScopeId;
use crate::variable::{Value, ValueError, ValueType};
use crate::Engine;

#[derive(Debug, Error)]
pub enum FunctionError {
  #[error("unknown function {0}")]
  Unknown(String),

  #[error("no matching overload of {name} for the given arguments")]
  NoOverload { name: String },

  #[error("{name}: invalid argument: {msg}")]
  InvalidArgument { name: &'static str, msg: String },

  #[error("{0}() called out of scope")]
  OutOfScope(&'static str),

  #[error(transparent)]
  Value(#[from] ValueError),
}

/// Call-site context: the engine and, when the call happens during a
/// scope's evaluation, that scope.
pub struct FunctionCtx<'a> {
  pub eng: &'a Engine,
  pub scope: Option<ScopeId>,
}

/// Declared argument type of an overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
  Any,
  Bool,
  UInt,
  Int,
  String,
  Names,
  Strings,
  Paths,
}

impl ArgType {
  fn value_type(self) -> Option<ValueType> {
    match self {
      ArgType::Any => None,
      ArgType::Bool => Some(ValueType::Bool),
      ArgType::UInt => Some(ValueType::UInt),
      ArgType::Int => Some(ValueType::Int),
      ArgType::String => Some(ValueType::String),
      ArgType::Names => Some(ValueType::Names),
      ArgType::Strings => Some(ValueType::Strings),
      ArgType::Paths => Some(ValueType::Paths),
    }
  }

  fn accepts(self, v: &Value) -> bool {
    let ty = match self.value_type() {
      None => return true,
      Some(t) => t,
    };
    match v {
      Value::Null => true, // Null acceptance is gated by null_ok.
      Value::Untyped(_) => v.clone().typify(ty).is_ok(),
      typed => typed.type_of() == Some(ty),
    }
  }
}

pub type FunctionImpl = fn(&FunctionCtx, Vec<Value>) -> Result<Value, FunctionError>;

pub struct Overload {
  pub sig: &'static [ArgType],
  pub min_args: usize,
  pub null_ok: bool,
  pub pure: bool,
  pub f: FunctionImpl,
}

impl Overload {
  fn matches(&self, args: &[Value]) -> bool {
    if args.len() < self.min_args || args.len() > self.sig.len() {
      return false;
    }
    if !self.null_ok && args.iter().any(Value::is_null) {
      return false;
    }
    args.iter().zip(self.sig).all(|(v, at)| at.accepts(v))
  }
}

/// The function registry.
pub struct FunctionMap {
  map: HashMap<String, Vec<Overload>>,
}

impl FunctionMap {
  pub fn with_builtins() -> Self {
    let mut m = Self {
      map: HashMap::new(),
    };
    builtin_functions(&mut m);
    m
  }

  pub fn insert(&mut self, name: &str, o: Overload) {
    self.map.entry(name.to_string()).or_default().push(o);
  }

  pub fn contains(&self, name: &str) -> bool {
    self.map.contains_key(name)
  }

  /// Whether every overload of the function is pure.
  pub fn is_pure(&self, name: &str) -> bool {
    self
      .map
      .get(name)
      .map(|os| os.iter().all(|o| o.pure))
      .unwrap_or(false)
  }

  pub fn call(
    &self,
    ctx: &FunctionCtx,
    name: &str,
    args: Vec<Value>,
  ) -> Result<Value, FunctionError> {
    let overloads = self
      .map
      .get(name)
      .ok_or_else(|| FunctionError::Unknown(name.to_string()))?;

    for o in overloads {
      if o.matches(&args) {
        return (o.f)(ctx, args);
      }
    }

    Err(FunctionError::NoOverload {
      name: name.to_string(),
    })
  }
}

fn typed(v: Value, ty: ValueType) -> Result<Value, FunctionError> {
  Ok(v.typify(ty)?)
}

fn string_arg(name: &'static str, v: Value) -> Result<String, FunctionError> {
  match typed(v, ValueType::String)? {
    Value::String(s) => Ok(s),
    Value::Null => Err(FunctionError::InvalidArgument {
      name,
      msg: "null name".to_string(),
    }),
    _ => unreachable!("typify returned a non-string"),
  }
}

/// Parse sort flags; `dedup` is the only one.
fn sort_flags(v: Option<Value>) -> Result<bool, FunctionError> {
  let mut dedup = false;
  if let Some(v) = v {
    for n in v.to_names() {
      if n.value == "dedup" && n.is_simple() {
        dedup = true;
      } else {
        return Err(FunctionError::InvalidArgument {
          name: "sort",
          msg: format!("invalid flag '{}'", n),
        });
      }
    }
  }
  Ok(dedup)
}

// Overload implementations.

fn fn_defined(ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let scope = ctx.scope.ok_or(FunctionError::OutOfScope("defined"))?;
  let name = string_arg("defined", args.remove(0))?;

  let r = match ctx.eng.vars.find(&name) {
    Some(var) => ctx
      .eng
      .scopes
      .find_var(&ctx.eng.vars, scope, var)?
      .is_some(),
    None => false,
  };
  Ok(Value::Bool(r))
}

fn fn_visibility(ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let name = string_arg("visibility", args.remove(0))?;
  Ok(match ctx.eng.vars.find(&name) {
    Some(var) => Value::String(ctx.eng.vars.get(var).visibility.to_string()),
    None => Value::Null,
  })
}

fn fn_type(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let v = args.remove(0);
  Ok(Value::String(
    v.type_of().map(|t| t.name().to_string()).unwrap_or_default(),
  ))
}

fn fn_null(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  Ok(Value::Bool(args.remove(0).is_null()))
}

fn fn_empty(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  Ok(Value::Bool(args.remove(0).is_empty()))
}

fn fn_string(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let s = match args.remove(0) {
    Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
    Value::Int(i) => i.to_string(),
    Value::UInt(u) => u.to_string(),
    v => match v.clone().typify(ValueType::Bool) {
      Ok(Value::Bool(b)) => if b { "true" } else { "false" }.to_string(),
      _ => match typed(v, ValueType::String)? {
        Value::String(s) => s,
        _ => String::new(),
      },
    },
  };
  Ok(Value::String(s))
}

/// Quote a value, returning its string representation. With escape, also
/// backslash-escape the quote characters being added (useful if the
/// result will be re-parsed).
fn fn_quote(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let escape = if args.len() > 1 {
    matches!(typed(args.remove(1), ValueType::Bool)?, Value::Bool(true))
  } else {
    false
  };

  let v = args.remove(0);
  if v.is_null() {
    return Ok(Value::String(String::new()));
  }

  let mut r = String::new();
  for (i, n) in v.to_names().iter().enumerate() {
    if i != 0 {
      r.push(' ');
    }
    let s = n.to_string();
    if s.contains([' ', '\t']) || s.is_empty() {
      let q = if escape { "\\'" } else { "'" };
      r.push_str(q);
      r.push_str(&s);
      r.push_str(q);
    } else {
      r.push_str(&s);
    }
  }
  Ok(Value::String(r))
}

fn fn_size(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let n = match args.remove(0) {
    Value::Names(ns) | Value::Untyped(ns) => ns.len(),
    Value::Strings(ss) => ss.len(),
    Value::Paths(ps) => ps.len(),
    Value::String(s) => s.len(),
    v => v.to_names().len(),
  };
  Ok(Value::UInt(n as u64))
}

fn fn_sort(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let flags = if args.len() > 1 { Some(args.remove(1)) } else { None };
  let dedup = sort_flags(flags)?;

  match args.remove(0) {
    Value::Strings(mut ss) => {
      ss.sort();
      if dedup {
        ss.dedup();
      }
      Ok(Value::Strings(ss))
    }
    Value::Paths(mut ps) => {
      ps.sort();
      if dedup {
        ps.dedup();
      }
      Ok(Value::Paths(ps))
    }
    v => {
      let mut ns = v.to_names();
      ns.sort_by_key(|n| n.to_string());
      if dedup {
        ns.dedup_by_key(|n| n.to_string());
      }
      Ok(Value::Names(ns))
    }
  }
}

/// Not pure: reads the process environment.
fn fn_getenv(_ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let name = string_arg("getenv", args.remove(0))?;
  Ok(match std::env::var(&name) {
    Ok(v) => Value::String(v),
    Err(_) => Value::Null,
  })
}

/// Not pure: reads the filesystem.
fn fn_path_search(ctx: &FunctionCtx, mut args: Vec<Value>) -> Result<Value, FunctionError> {
  let start = if args.len() > 1 {
    match typed(args.remove(1), ValueType::DirPath)? {
      Value::DirPath(d) => Some(d),
      _ => None,
    }
  } else {
    None
  };

  let pattern = match typed(args.remove(0), ValueType::Path)? {
    Value::Path(p) => p,
    _ => {
      return Err(FunctionError::InvalidArgument {
        name: "path_search",
        msg: "pattern expected".to_string(),
      });
    }
  };

  path_search(ctx.eng, &pattern, start.as_deref())
}

fn path_search(
  eng: &Engine,
  pattern: &Path,
  start: Option<&Path>,
) -> Result<Value, FunctionError> {
  // An absolute start directory must be specified for a relative pattern.
  let full = if pattern.is_absolute() {
    pattern.to_path_buf()
  } else {
    let start = match start {
      Some(s) if s.is_absolute() => s,
      Some(s) => {
        return Err(FunctionError::InvalidArgument {
          name: "path_search",
          msg: format!("start directory '{}' is relative", s.display()),
        });
      }
      None => eng.work.as_path(),
    };
    start.join(pattern)
  };

  let full_str = full.to_string_lossy().to_string();
  let re = regex::Regex::new(&format!("^{}$", glob_to_regex(&full_str))).map_err(|e| {
    FunctionError::InvalidArgument {
      name: "path_search",
      msg: format!("invalid pattern '{}': {}", full_str, e),
    }
  })?;

  // Walk from the longest literal directory prefix.
  let mut base = PathBuf::new();
  for c in full.components() {
    let s = c.as_os_str().to_string_lossy();
    if s.contains(['*', '?']) {
      break;
    }
    base.push(c.as_os_str());
  }
  if base.as_os_str().is_empty() {
    base = PathBuf::from("/");
  }

  let mut r: Vec<Name> = Vec::new();
  for entry in WalkDir::new(&base).follow_links(true) {
    let entry = match entry {
      Ok(e) => e,
      Err(e) => {
        warn!("skipping dangling symlink or inaccessible entry: {}", e);
        continue;
      }
    };

    let p = entry.path();
    if re.is_match(&p.to_string_lossy()) {
      if entry.file_type().is_dir() {
        r.push(Name::dir(p.to_path_buf()));
      } else {
        r.push(Name::simple(p.to_string_lossy().to_string()));
      }
    }
  }

  r.sort_by_key(|n| n.to_string());
  Ok(Value::Names(r))
}

/// Translate a glob pattern to a regex: `**` crosses directories, `*` and
/// `?` stay within one component.
fn glob_to_regex(pat: &str) -> String {
  let mut r = String::new();
  let mut chars = pat.chars().peekable();

  while let Some(c) = chars.next() {
    match c {
      '*' => {
        if chars.peek() == Some(&'*') {
          chars.next();
          r.push_str(".*");
        } else {
          r.push_str("[^/]*");
        }
      }
      '?' => r.push_str("[^/]"),
      c if "\\.+()|[]{}^$".contains(c) => {
        r.push('\\');
        r.push(c);
      }
      c => r.push(c),
    }
  }

  r
}

/// Register the built-in family.
pub fn builtin_functions(m: &mut FunctionMap) {
  const ANY1: &[ArgType] = &[ArgType::Any];
  const ANY2: &[ArgType] = &[ArgType::Any, ArgType::Any];
  const NAMES1: &[ArgType] = &[ArgType::Names];
  const NAMES2: &[ArgType] = &[ArgType::Names, ArgType::Names];

  // Note that defined and visibility are not pure.
  m.insert(
    "defined",
    Overload {
      sig: NAMES1,
      min_args: 1,
      null_ok: false,
      pure: false,
      f: fn_defined,
    },
  );
  m.insert(
    "visibility",
    Overload {
      sig: NAMES1,
      min_args: 1,
      null_ok: false,
      pure: false,
      f: fn_visibility,
    },
  );

  m.insert(
    "type",
    Overload {
      sig: ANY1,
      min_args: 1,
      null_ok: true,
      pure: true,
      f: fn_type,
    },
  );
  m.insert(
    "null",
    Overload {
      sig: ANY1,
      min_args: 1,
      null_ok: true,
      pure: true,
      f: fn_null,
    },
  );
  m.insert(
    "empty",
    Overload {
      sig: ANY1,
      min_args: 1,
      null_ok: true,
      pure: true,
      f: fn_empty,
    },
  );

  m.insert(
    "string",
    Overload {
      sig: ANY1,
      min_args: 1,
      null_ok: false,
      pure: true,
      f: fn_string,
    },
  );
  m.insert(
    "quote",
    Overload {
      sig: ANY2,
      min_args: 1,
      null_ok: true,
      pure: true,
      f: fn_quote,
    },
  );

  m.insert(
    "size",
    Overload {
      sig: ANY1,
      min_args: 1,
      null_ok: false,
      pure: true,
      f: fn_size,
    },
  );
  m.insert(
    "sort",
    Overload {
      sig: NAMES2,
      min_args: 1,
      null_ok: false,
      pure: true,
      f: fn_sort,
    },
  );

  m.insert(
    "getenv",
    Overload {
      sig: NAMES1,
      min_args: 1,
      null_ok: false,
      pure: false,
      f: fn_getenv,
    },
  );
  m.insert(
    "path_search",
    Overload {
      sig: NAMES2,
      min_args: 1,
      null_ok: false,
      pure: false,
      f: fn_path_search,
    },
  );
}
