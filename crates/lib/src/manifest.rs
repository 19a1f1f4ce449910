//! The installation manifest.
//!
//! Persisted state for installed entries: a JSON stream, one serialised
//! entry per line, written as entries are installed so a crashed
//! invocation still leaves a usable prefix. Producing entries is the
//! install rule chain's business; the core only defines the format.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("unable to write manifest entry: {0}")]
  Write(#[source] std::io::Error),

  #[error("unable to read manifest: {0}")]
  Read(#[source] std::io::Error),

  #[error("invalid manifest entry: {0}")]
  Parse(#[from] serde_json::Error),
}

/// One installed filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManifestEntry {
  Directory {
    path: PathBuf,
    mode: String,
  },
  File {
    path: PathBuf,
    mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
  },
  Symlink {
    path: PathBuf,
    target: PathBuf,
  },
}

/// Streams manifest entries to a writer, one JSON object per line.
pub struct ManifestWriter<W: Write> {
  out: W,
}

impl<W: Write> ManifestWriter<W> {
  pub fn new(out: W) -> Self {
    Self { out }
  }

  pub fn write(&mut self, entry: &ManifestEntry) -> Result<(), ManifestError> {
    let line = serde_json::to_string(entry)?;
    self
      .out
      .write_all(line.as_bytes())
      .and_then(|_| self.out.write_all(b"\n"))
      .map_err(ManifestError::Write)
  }

  pub fn into_inner(self) -> W {
    self.out
  }
}

/// Read a manifest stream back, e.g. for uninstall.
pub fn read_manifest<R: BufRead>(input: R) -> Result<Vec<ManifestEntry>, ManifestError> {
  let mut entries = Vec::new();
  for line in input.lines() {
    let line = line.map_err(ManifestError::Read)?;
    if line.trim().is_empty() {
      continue;
    }
    entries.push(serde_json::from_str(&line)?);
  }
  Ok(entries)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stream_round_trips() {
    let entries = vec![
      ManifestEntry::Directory {
        path: PathBuf::from("/usr/local/share/doc"),
        mode: "755".to_string(),
      },
      ManifestEntry::File {
        path: PathBuf::from("/usr/local/share/doc/README"),
        mode: "644".to_string(),
        size: Some(120),
      },
      ManifestEntry::Symlink {
        path: PathBuf::from("/usr/local/bin/tool"),
        target: PathBuf::from("tool-1.2"),
      },
    ];

    let mut w = ManifestWriter::new(Vec::new());
    for e in &entries {
      w.write(e).unwrap();
    }

    let buf = w.into_inner();
    assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 3);

    let back = read_manifest(buf.as_slice()).unwrap();
    assert_eq!(back, entries);
  }

  #[test]
  fn file_size_is_optional() {
    let e = ManifestEntry::File {
      path: PathBuf::from("/x"),
      mode: "644".to_string(),
      size: None,
    };
    let json = serde_json::to_string(&e).unwrap();
    assert!(!json.contains("size"));
    assert!(json.contains("\"type\":\"file\""));
  }

  #[test]
  fn blank_lines_are_skipped() {
    let input = b"\n{\"type\":\"directory\",\"path\":\"/d\",\"mode\":\"755\"}\n\n";
    let back = read_manifest(&input[..]).unwrap();
    assert_eq!(back.len(), 1);
  }
}
