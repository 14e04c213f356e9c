use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Expected digest of a downloaded file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Checksum {
  /// BLAKE3 digest, optionally keyed with a 32-byte hex key.
  Blake3 { hex: String, key: Option<String> },
  Sha256(String),
  /// Compared against the HTTP `ETag` response header.
  Etag(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid checksum '{0}': expected sha256:<hex>, blake3:<hex>, blake3:<key>:<hex> or etag:<tag>")]
pub struct ChecksumParseError(pub String);

impl Checksum {
  pub fn algorithm(&self) -> &'static str {
    match self {
      Checksum::Blake3 { key: None, .. } => "blake3",
      Checksum::Blake3 { key: Some(_), .. } => "blake3-keyed",
      Checksum::Sha256(_) => "sha256",
      Checksum::Etag(_) => "etag",
    }
  }

  /// The value a download is compared against.
  pub fn expected(&self) -> &str {
    match self {
      Checksum::Blake3 { hex, .. } => hex,
      Checksum::Sha256(hex) => hex,
      Checksum::Etag(tag) => tag,
    }
  }
}

fn is_hex_digest(s: &str) -> bool {
  s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FromStr for Checksum {
  type Err = ChecksumParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let err = || ChecksumParseError(s.to_string());
    let (algorithm, rest) = s.split_once(':').ok_or_else(err)?;
    match algorithm {
      "sha256" if is_hex_digest(rest) => Ok(Checksum::Sha256(rest.to_ascii_lowercase())),
      "blake3" => match rest.split_once(':') {
        Some((key, hex)) if is_hex_digest(key) && is_hex_digest(hex) => Ok(Checksum::Blake3 {
          hex: hex.to_ascii_lowercase(),
          key: Some(key.to_ascii_lowercase()),
        }),
        None if is_hex_digest(rest) => Ok(Checksum::Blake3 {
          hex: rest.to_ascii_lowercase(),
          key: None,
        }),
        _ => Err(err()),
      },
      "etag" if !rest.is_empty() => Ok(Checksum::Etag(rest.trim_matches('"').to_string())),
      _ => Err(err()),
    }
  }
}

impl fmt::Display for Checksum {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Checksum::Blake3 { hex, key: None } => write!(f, "blake3:{hex}"),
      Checksum::Blake3 { hex, key: Some(key) } => write!(f, "blake3:{key}:{hex}"),
      Checksum::Sha256(hex) => write!(f, "sha256:{hex}"),
      Checksum::Etag(tag) => write!(f, "etag:{tag}"),
    }
  }
}

impl TryFrom<String> for Checksum {
  type Error = ChecksumParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Checksum> for String {
  fn from(value: Checksum) -> Self {
    value.to_string()
  }
}

/// A builtin operation recorded by a build phase.
///
/// String arguments may contain placeholders (see [`crate::placeholder`]); relative
/// paths are taken from the executor's current working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
  /// Run a program directly.
  Exec {
    program: String,
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
  },
  /// Run a script through the build shell.
  Shell { script: String },
  /// Apply a unified diff, stripping `strip` leading path components.
  Patch { file: String, strip: u32 },
  /// Replace every occurrence of `from` with `to` inside `file`.
  Replace { file: String, from: String, to: String },
  SetEnv { key: String, value: String },
  AppendEnv { key: String, value: String },
  PrependEnv { key: String, value: String },
  Symlink { target: String, link: String },
  /// Copy `src` (file or directory tree) to `dest`, or link each file when `link` is set.
  Install { src: String, dest: String, link: bool },
  Mkdir { path: String },
  WriteFile {
    path: String,
    contents: String,
    executable: bool,
  },
  Download {
    url: String,
    dest: String,
    checksum: Checksum,
  },
  /// Extract a `.tar`, `.tar.gz`/`.tgz` or `.zip` archive.
  Unpack {
    archive: String,
    dest: String,
    strip_components: u32,
  },
  /// Run `body` with `dir` as the working directory, restoring it afterwards.
  Chdir { dir: String, body: Vec<Op> },
}

impl Op {
  pub fn name(&self) -> &'static str {
    match self {
      Op::Exec { .. } => "exec",
      Op::Shell { .. } => "shell",
      Op::Patch { .. } => "patch",
      Op::Replace { .. } => "replace",
      Op::SetEnv { .. } => "setenv",
      Op::AppendEnv { .. } => "append_env",
      Op::PrependEnv { .. } => "prepend_env",
      Op::Symlink { .. } => "symlink",
      Op::Install { .. } => "install",
      Op::Mkdir { .. } => "mkdir",
      Op::WriteFile { .. } => "write",
      Op::Download { .. } => "download",
      Op::Unpack { .. } => "unpack",
      Op::Chdir { .. } => "chdir",
    }
  }
}

/// An ordered list of operations: the executable form of a recipe phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
  pub ops: Vec<Op>,
}

impl Phase {
  pub fn new(ops: Vec<Op>) -> Self {
    Self { ops }
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }
}
