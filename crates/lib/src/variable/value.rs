//! The value model.
//!
//! A value is a tagged optional: null, typed, or untyped (a raw name
//! sequence as produced by the buildfile reader). `typify` promotes an
//! untyped value to a declared type with element-wise conversion; append
//! and prepend are defined per type (string concatenation, list
//! catenation, path join). Null and "unset" are distinct: an unset
//! variable has no entry at all, a set-but-null one holds [`Value::Null`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::name::{Name, NameError, ProjectName};

#[derive(Debug, Error)]
pub enum ValueError {
  /// The `value-type-mismatch` failure.
  #[error("value type mismatch: expected {expected}, got {found}")]
  TypeMismatch {
    expected: &'static str,
    found: String,
  },

  #[error("unable to convert name '{name}' to {ty}")]
  Conversion { name: String, ty: &'static str },

  #[error("append/prepend is not defined for type {0}")]
  AppendUndefined(&'static str),

  #[error("expected absolute directory, got '{0}'")]
  NotAbsolute(String),

  #[error(transparent)]
  Name(#[from] NameError),
}

/// Declared variable types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
  Bool,
  UInt,
  Int,
  String,
  Path,
  DirPath,
  AbsDirPath,
  ProjectName,
  Name,
  Names,
  Strings,
  Paths,
}

impl ValueType {
  pub fn name(self) -> &'static str {
    match self {
      ValueType::Bool => "bool",
      ValueType::UInt => "uint64",
      ValueType::Int => "int64",
      ValueType::String => "string",
      ValueType::Path => "path",
      ValueType::DirPath => "dir_path",
      ValueType::AbsDirPath => "abs_dir_path",
      ValueType::ProjectName => "project_name",
      ValueType::Name => "name",
      ValueType::Names => "names",
      ValueType::Strings => "strings",
      ValueType::Paths => "paths",
    }
  }
}

impl fmt::Display for ValueType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// A variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Untyped(Vec<Name>),
  Bool(bool),
  UInt(u64),
  Int(i64),
  String(String),
  Path(PathBuf),
  DirPath(PathBuf),
  AbsDirPath(PathBuf),
  ProjectName(ProjectName),
  Name(Name),
  Names(Vec<Name>),
  Strings(Vec<String>),
  Paths(Vec<PathBuf>),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  pub fn is_empty(&self) -> bool {
    match self {
      Value::Null => true,
      Value::Untyped(ns) => ns.is_empty(),
      Value::String(s) => s.is_empty(),
      Value::Names(ns) => ns.is_empty(),
      Value::Strings(ss) => ss.is_empty(),
      Value::Paths(ps) => ps.is_empty(),
      _ => false,
    }
  }

  /// The value's type, if it has been typified.
  pub fn type_of(&self) -> Option<ValueType> {
    match self {
      Value::Null | Value::Untyped(_) => None,
      Value::Bool(_) => Some(ValueType::Bool),
      Value::UInt(_) => Some(ValueType::UInt),
      Value::Int(_) => Some(ValueType::Int),
      Value::String(_) => Some(ValueType::String),
      Value::Path(_) => Some(ValueType::Path),
      Value::DirPath(_) => Some(ValueType::DirPath),
      Value::AbsDirPath(_) => Some(ValueType::AbsDirPath),
      Value::ProjectName(_) => Some(ValueType::ProjectName),
      Value::Name(_) => Some(ValueType::Name),
      Value::Names(_) => Some(ValueType::Names),
      Value::Strings(_) => Some(ValueType::Strings),
      Value::Paths(_) => Some(ValueType::Paths),
    }
  }

  /// Promote an untyped value to the given type.
  ///
  /// Typed values pass through when the type already matches and fail with
  /// `value-type-mismatch` otherwise. Conversion is strict: a scalar type
  /// requires exactly one name.
  pub fn typify(self, ty: ValueType) -> Result<Value, ValueError> {
    if self.is_null() {
      return Ok(Value::Null);
    }

    if let Some(t) = self.type_of() {
      if t == ty {
        return Ok(self);
      }
      return Err(ValueError::TypeMismatch {
        expected: ty.name(),
        found: t.name().to_string(),
      });
    }

    let names = match self {
      Value::Untyped(ns) => ns,
      _ => unreachable!("typed values handled above"),
    };

    match ty {
      ValueType::Names => Ok(Value::Names(names)),
      ValueType::Strings => {
        let ss = names
          .into_iter()
          .map(name_to_string)
          .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Strings(ss))
      }
      ValueType::Paths => {
        let ps = names
          .into_iter()
          .map(name_to_path)
          .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Paths(ps))
      }
      scalar => {
        let n = single(names, scalar)?;
        match scalar {
          ValueType::Bool => match n.value.as_str() {
            "true" if n.is_simple() => Ok(Value::Bool(true)),
            "false" if n.is_simple() => Ok(Value::Bool(false)),
            _ => Err(conversion(&n, "bool")),
          },
          ValueType::UInt => n
            .value
            .parse::<u64>()
            .map(Value::UInt)
            .map_err(|_| conversion(&n, "uint64")),
          ValueType::Int => n
            .value
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| conversion(&n, "int64")),
          ValueType::String => name_to_string(n).map(Value::String),
          ValueType::Path => name_to_path(n).map(Value::Path),
          ValueType::DirPath => name_to_dir(n).map(Value::DirPath),
          ValueType::AbsDirPath => {
            let d = name_to_dir(n)?;
            if !d.is_absolute() {
              return Err(ValueError::NotAbsolute(d.display().to_string()));
            }
            Ok(Value::AbsDirPath(d))
          }
          ValueType::ProjectName => {
            if !n.is_simple() {
              return Err(conversion(&n, "project_name"));
            }
            Ok(Value::ProjectName(ProjectName::new(n.value)?))
          }
          ValueType::Name => Ok(Value::Name(n)),
          _ => unreachable!("sequence types handled above"),
        }
      }
    }
  }

  /// Reverse a value to its raw name sequence (untypify).
  pub fn to_names(&self) -> Vec<Name> {
    match self {
      Value::Null => Vec::new(),
      Value::Untyped(ns) | Value::Names(ns) => ns.clone(),
      Value::Bool(b) => vec![Name::simple(if *b { "true" } else { "false" })],
      Value::UInt(i) => vec![Name::simple(i.to_string())],
      Value::Int(i) => vec![Name::simple(i.to_string())],
      Value::String(s) => vec![Name::simple(s.clone())],
      Value::Path(p) => vec![Name::simple(p.display().to_string())],
      Value::DirPath(d) | Value::AbsDirPath(d) => vec![Name::dir(d.clone())],
      Value::ProjectName(p) => vec![Name::simple(p.as_str())],
      Value::Name(n) => vec![n.clone()],
      Value::Strings(ss) => ss.iter().map(|s| Name::simple(s.clone())).collect(),
      Value::Paths(ps) => ps
        .iter()
        .map(|p| Name::simple(p.display().to_string()))
        .collect(),
    }
  }

  /// Append another value (`+=`).
  pub fn append(&mut self, other: Value) -> Result<(), ValueError> {
    if other.is_null() {
      return Ok(());
    }
    if self.is_null() {
      *self = other;
      return Ok(());
    }

    match self {
      Value::Untyped(ns) => {
        ns.extend(other.to_names());
        Ok(())
      }
      Value::String(s) => {
        let o = other.typify(ValueType::String)?;
        if let Value::String(os) = o {
          s.push_str(&os);
        }
        Ok(())
      }
      Value::Path(p) => {
        if let Value::Path(op) = other.typify(ValueType::Path)? {
          *p = p.join(op);
        }
        Ok(())
      }
      Value::DirPath(p) => {
        if let Value::DirPath(op) = other.typify(ValueType::DirPath)? {
          *p = p.join(op);
        }
        Ok(())
      }
      Value::Names(ns) => {
        if let Value::Names(os) = other.typify(ValueType::Names)? {
          ns.extend(os);
        }
        Ok(())
      }
      Value::Strings(ss) => {
        if let Value::Strings(os) = other.typify(ValueType::Strings)? {
          ss.extend(os);
        }
        Ok(())
      }
      Value::Paths(ps) => {
        if let Value::Paths(os) = other.typify(ValueType::Paths)? {
          ps.extend(os);
        }
        Ok(())
      }
      v => Err(ValueError::AppendUndefined(
        v.type_of().map(|t| t.name()).unwrap_or("null"),
      )),
    }
  }

  /// Prepend another value (`=+`).
  pub fn prepend(&mut self, other: Value) -> Result<(), ValueError> {
    if other.is_null() {
      return Ok(());
    }
    if self.is_null() {
      *self = other;
      return Ok(());
    }

    match self {
      Value::Untyped(ns) => {
        let mut r = other.to_names();
        r.append(ns);
        *ns = r;
        Ok(())
      }
      Value::String(s) => {
        if let Value::String(os) = other.typify(ValueType::String)? {
          s.insert_str(0, &os);
        }
        Ok(())
      }
      Value::Names(ns) => {
        if let Value::Names(mut os) = other.typify(ValueType::Names)? {
          os.append(ns);
          *ns = os;
        }
        Ok(())
      }
      Value::Strings(ss) => {
        if let Value::Strings(mut os) = other.typify(ValueType::Strings)? {
          os.append(ss);
          *ss = os;
        }
        Ok(())
      }
      Value::Paths(ps) => {
        if let Value::Paths(mut os) = other.typify(ValueType::Paths)? {
          os.append(ps);
          *ps = os;
        }
        Ok(())
      }
      v => Err(ValueError::AppendUndefined(
        v.type_of().map(|t| t.name()).unwrap_or("null"),
      )),
    }
  }

  /// Convenience accessor for directory-typed values.
  pub fn as_dir(&self) -> Option<&PathBuf> {
    match self {
      Value::DirPath(d) | Value::AbsDirPath(d) => Some(d),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }
}

fn single(mut names: Vec<Name>, ty: ValueType) -> Result<Name, ValueError> {
  if names.len() != 1 {
    return Err(ValueError::TypeMismatch {
      expected: ty.name(),
      found: format!("sequence of {} names", names.len()),
    });
  }
  Ok(names.remove(0))
}

fn conversion(n: &Name, ty: &'static str) -> ValueError {
  ValueError::Conversion {
    name: n.to_string(),
    ty,
  }
}

fn name_to_string(n: Name) -> Result<String, ValueError> {
  if n.is_simple() {
    Ok(n.value)
  } else if n.is_directory() {
    Ok(format!("{}/", n.dir.display()))
  } else if n.ty.is_none() && n.proj.is_none() {
    Ok(n.dir.join(&n.value).display().to_string())
  } else {
    Err(conversion(&n, "string"))
  }
}

fn name_to_path(n: Name) -> Result<PathBuf, ValueError> {
  if n.ty.is_some() || n.proj.is_some() {
    return Err(conversion(&n, "path"));
  }
  if n.value.is_empty() {
    Ok(n.dir)
  } else {
    Ok(n.dir.join(n.value))
  }
}

fn name_to_dir(n: Name) -> Result<PathBuf, ValueError> {
  if n.ty.is_some() || n.proj.is_some() {
    return Err(conversion(&n, "dir_path"));
  }
  // For usability, a simple name is treated as a directory.
  if n.is_directory() {
    Ok(n.dir)
  } else if n.is_simple() {
    Ok(PathBuf::from(n.value))
  } else {
    Ok(n.dir.join(n.value))
  }
}
