//! The `Name` data model.
//!
//! A name is the unit the buildfile reader produces and lookups consume: an
//! optional project qualifier, an optional directory, an optional target
//! type tag, and a value, plus a pair marker. `fsdir{a/b/}`, `file{hello}`,
//! `libs/`, and plain `hello` are all names.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
  #[error("invalid name '{0}': unterminated type tag")]
  UnterminatedType(String),

  #[error("invalid name '{0}': empty project qualifier")]
  EmptyProject(String),

  #[error("invalid project name '{0}'")]
  InvalidProject(String),
}

/// A project name with a canonical base/extension decomposition.
///
/// `foo.bash` decomposes into base `foo` and extension `bash`. Equality is
/// case-insensitive, matching the platform rules for path comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectName(String);

impl ProjectName {
  pub fn new(s: impl Into<String>) -> Result<Self, NameError> {
    let s = s.into();
    if s.is_empty() || s.starts_with('.') || s.contains(['/', '\\']) {
      return Err(NameError::InvalidProject(s));
    }
    Ok(Self(s))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The name without its extension, if any.
  pub fn base(&self) -> &str {
    match self.0.rfind('.') {
      Some(i) if i > 0 => &self.0[..i],
      _ => &self.0,
    }
  }

  /// The extension, if any.
  pub fn extension(&self) -> Option<&str> {
    match self.0.rfind('.') {
      Some(i) if i > 0 => Some(&self.0[i + 1..]),
      _ => None,
    }
  }
}

impl PartialEq for ProjectName {
  fn eq(&self, other: &Self) -> bool {
    self.0.eq_ignore_ascii_case(&other.0)
  }
}

impl Eq for ProjectName {}

impl fmt::Display for ProjectName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A logical identifier: optional project, directory, type tag, and value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Name {
  pub proj: Option<String>,
  pub dir: PathBuf,
  pub ty: Option<String>,
  pub value: String,
  pub pair: bool,
}

impl Name {
  /// A simple name: just a value.
  pub fn simple(value: impl Into<String>) -> Self {
    Self {
      value: value.into(),
      ..Default::default()
    }
  }

  /// A directory name.
  pub fn dir(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      ..Default::default()
    }
  }

  /// A typed name, e.g. `file{hello}`.
  pub fn typed(ty: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      ty: Some(ty.into()),
      value: value.into(),
      ..Default::default()
    }
  }

  pub fn is_simple(&self) -> bool {
    self.proj.is_none() && self.dir.as_os_str().is_empty() && self.ty.is_none()
  }

  pub fn is_directory(&self) -> bool {
    self.value.is_empty() && !self.dir.as_os_str().is_empty()
  }

  pub fn is_empty(&self) -> bool {
    self.proj.is_none()
      && self.dir.as_os_str().is_empty()
      && self.ty.is_none()
      && self.value.is_empty()
  }

  /// Parse the external representation.
  ///
  /// Accepted forms: `value`, `dir/`, `dir/value`, `type{value}`,
  /// `dir/type{value}`, and any of those with a `proj%` prefix. A value
  /// ending in `/` moves into the directory component.
  pub fn parse(s: &str) -> Result<Self, NameError> {
    let mut n = Name::default();
    let mut rest = s;

    if let Some(i) = rest.find('%') {
      if i == 0 {
        return Err(NameError::EmptyProject(s.to_string()));
      }
      n.proj = Some(rest[..i].to_string());
      rest = &rest[i + 1..];
    }

    if let Some(open) = rest.find('{') {
      if !rest.ends_with('}') {
        return Err(NameError::UnterminatedType(s.to_string()));
      }
      let (head, tail) = rest.split_at(open);
      let value = &tail[1..tail.len() - 1];

      // The type tag is the last path component of the head; anything
      // before it is the directory.
      match head.rfind('/') {
        Some(i) => {
          n.dir = PathBuf::from(&head[..i + 1]);
          n.ty = Some(head[i + 1..].to_string());
        }
        None => n.ty = Some(head.to_string()),
      }

      match value.strip_suffix('/') {
        Some(d) => n.dir = n.dir.join(d),
        None => n.value = value.to_string(),
      }
    } else if let Some(d) = rest.strip_suffix('/') {
      n.dir = PathBuf::from(d);
    } else {
      match rest.rfind('/') {
        Some(i) => {
          n.dir = PathBuf::from(&rest[..i]);
          n.value = rest[i + 1..].to_string();
        }
        None => n.value = rest.to_string(),
      }
    }

    Ok(n)
  }

  /// Split the value into a target name and extension at the last dot.
  ///
  /// `hello.txt` becomes `("hello", Some("txt"))`; a leading dot does not
  /// start an extension.
  pub fn split_extension(&self) -> (&str, Option<&str>) {
    match self.value.rfind('.') {
      Some(i) if i > 0 => (&self.value[..i], Some(&self.value[i + 1..])),
      _ => (self.value.as_str(), None),
    }
  }

  /// Resolve this name's directory against a base directory.
  pub fn resolve_dir(&self, base: &Path) -> PathBuf {
    if self.dir.is_absolute() {
      crate::util::normalize(&self.dir)
    } else {
      crate::util::normalize(&base.join(&self.dir))
    }
  }
}

impl fmt::Display for Name {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(p) = &self.proj {
      write!(f, "{}%", p)?;
    }
    if !self.dir.as_os_str().is_empty() {
      write!(f, "{}/", self.dir.display())?;
    }
    match &self.ty {
      Some(t) => write!(f, "{}{{{}}}", t, self.value),
      None => f.write_str(&self.value),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn project_name_decomposition() {
    let p = ProjectName::new("foo.bash").unwrap();
    assert_eq!(p.base(), "foo");
    assert_eq!(p.extension(), Some("bash"));

    let q = ProjectName::new("foo").unwrap();
    assert_eq!(q.base(), "foo");
    assert_eq!(q.extension(), None);
  }

  #[test]
  fn project_name_case_insensitive_eq() {
    let a = ProjectName::new("Foo").unwrap();
    let b = ProjectName::new("foo").unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn project_name_invalid() {
    assert!(ProjectName::new("").is_err());
    assert!(ProjectName::new(".hidden").is_err());
    assert!(ProjectName::new("a/b").is_err());
  }

  #[test]
  fn parse_simple() {
    let n = Name::parse("hello").unwrap();
    assert!(n.is_simple());
    assert_eq!(n.value, "hello");
  }

  #[test]
  fn parse_typed() {
    let n = Name::parse("file{hello}").unwrap();
    assert_eq!(n.ty.as_deref(), Some("file"));
    assert_eq!(n.value, "hello");
  }

  #[test]
  fn parse_dir_typed() {
    let n = Name::parse("fsdir{a/b/}").unwrap();
    assert_eq!(n.ty.as_deref(), Some("fsdir"));
    assert_eq!(n.dir, PathBuf::from("a/b"));
    assert!(n.value.is_empty());
    assert!(n.is_directory());
  }

  #[test]
  fn parse_dir_prefix_typed() {
    let n = Name::parse("sub/file{x}").unwrap();
    assert_eq!(n.dir, PathBuf::from("sub/"));
    assert_eq!(n.ty.as_deref(), Some("file"));
    assert_eq!(n.value, "x");
  }

  #[test]
  fn parse_directory() {
    let n = Name::parse("libs/").unwrap();
    assert!(n.is_directory());
    assert_eq!(n.dir, PathBuf::from("libs"));
  }

  #[test]
  fn parse_project_qualified() {
    let n = Name::parse("libhello%lib{hello}").unwrap();
    assert_eq!(n.proj.as_deref(), Some("libhello"));
    assert_eq!(n.ty.as_deref(), Some("lib"));
    assert_eq!(n.value, "hello");
  }

  #[test]
  fn parse_unterminated_type() {
    assert!(matches!(
      Name::parse("file{hello"),
      Err(NameError::UnterminatedType(_))
    ));
  }

  #[test]
  fn split_extension() {
    assert_eq!(Name::simple("hello.txt").split_extension(), ("hello", Some("txt")));
    assert_eq!(Name::simple("hello").split_extension(), ("hello", None));
    assert_eq!(Name::simple(".profile").split_extension(), (".profile", None));
  }

  #[test]
  fn display_round_trip() {
    for s in ["hello", "file{hello}", "libhello%lib{hello}"] {
      assert_eq!(Name::parse(s).unwrap().to_string(), s);
    }
  }
}
