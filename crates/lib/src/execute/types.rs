//! Error type for phase execution.

use std::path::PathBuf;

use thiserror::Error;

use crate::placeholder::PlaceholderError;

#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("placeholder error: {0}")]
  Placeholder(#[from] PlaceholderError),

  #[error("fetch failed for {url}: {message}")]
  FetchFailed { url: String, message: String },

  #[error("{algorithm} mismatch for {url}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    url: String,
    algorithm: &'static str,
    expected: String,
    actual: String,
  },

  #[error("invalid blake3 key: {0}")]
  InvalidKey(String),

  #[error("command failed with exit code {code:?}: {cmd}{}", stderr_suffix(.stderr))]
  CmdFailed {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("io error: {0}")]
  IoPlain(#[from] std::io::Error),

  #[error("patch {file} does not apply: {message}")]
  PatchFailed { file: PathBuf, message: String },

  #[error("pattern '{pattern}' not found in {file}")]
  ReplaceNotFound { file: PathBuf, pattern: String },

  #[error("unsupported archive format: {0}")]
  UnsupportedArchive(PathBuf),

  #[error("failed to unpack {path}: {message}")]
  Unpack { path: PathBuf, message: String },

  #[error("entry '{entry}' escapes the destination directory")]
  UnsafeEntry { entry: String },

  #[error("not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error("reader task failed: {0}")]
  Task(String),

  #[error("operation cancelled")]
  Cancelled,
}

impl ExecuteError {
  pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    ExecuteError::Io {
      op,
      path: path.into(),
      source,
    }
  }
}

fn stderr_suffix(stderr: &str) -> String {
  if stderr.is_empty() {
    String::new()
  } else {
    format!("\n{stderr}")
  }
}
