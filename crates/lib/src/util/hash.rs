//! Hashing utilities for content-addressed storage and verification.
//!
//! This module provides:
//! - `Signature`: the 256-bit content address of a recipe or instance, base58 encoded
//! - `PackageId`: the `signature-name-version` store identity
//! - `StructHasher`: order-independent structural hashing of named fields
//! - `hash_directory()` / `hash_file()` / `hash_bytes()`: SHA-256 content hashing

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Raw 256-bit digest.
pub type Digest32 = [u8; 32];

#[derive(Debug, thiserror::Error)]
pub enum HashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {source}")]
  ReadFile {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to read symlink {path}: {source}")]
  ReadSymlink {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid signature '{0}'")]
  InvalidSignature(String),

  #[error("invalid package id '{0}'")]
  InvalidPackageId(String),
}

/// A content address: 256-bit digest rendered as base58.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(pub Digest32);

impl Signature {
  pub fn as_bytes(&self) -> &Digest32 {
    &self.0
  }

  pub fn is_zero(&self) -> bool {
    self.0 == [0u8; 32]
  }
}

impl fmt::Display for Signature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl fmt::Debug for Signature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Signature({})", self)
  }
}

impl FromStr for Signature {
  type Err = HashError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = bs58::decode(s)
      .into_vec()
      .map_err(|_| HashError::InvalidSignature(s.to_string()))?;
    let digest: Digest32 = bytes
      .try_into()
      .map_err(|_| HashError::InvalidSignature(s.to_string()))?;
    Ok(Signature(digest))
  }
}

impl Serialize for Signature {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for Signature {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Returns true for bytes that may appear in a package ID.
pub fn is_id_byte(b: u8) -> bool {
  b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'+')
}

/// Store identity of a package: `signature-name-version`.
///
/// The on-disk directory of a store entry always carries exactly this name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId(String);

impl PackageId {
  pub fn new(signature: &Signature, name: &str, version: &str) -> Self {
    PackageId(format!("{signature}-{name}-{version}"))
  }

  /// Parses an ID read from disk or from an archive.
  pub fn parse(s: &str) -> Result<Self, HashError> {
    let valid = !s.is_empty() && s.bytes().all(is_id_byte) && s.contains('-') && !s.starts_with('-');
    if !valid {
      return Err(HashError::InvalidPackageId(s.to_string()));
    }
    Ok(PackageId(s.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The leading signature component.
  pub fn signature_part(&self) -> &str {
    self.0.split('-').next().unwrap_or_default()
  }
}

impl fmt::Display for PackageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl TryFrom<String> for PackageId {
  type Error = HashError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    PackageId::parse(&value)
  }
}

impl From<PackageId> for String {
  fn from(value: PackageId) -> Self {
    value.0
  }
}

impl AsRef<str> for PackageId {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

/// Order-independent structural hasher.
///
/// Every field contributes `sha256(field-name, kind, value)` and the contributions
/// are XOR-combined, so the order fields are written in never matters. Fields
/// holding their zero value (empty string, empty collection, `None`) are skipped:
/// absent and zero hash identically, any other value changes the digest.
#[derive(Debug, Default, Clone)]
pub struct StructHasher {
  acc: Digest32,
}

const KIND_STR: u8 = b's';
const KIND_BYTES: u8 = b'b';
const KIND_DIGEST: u8 = b'd';
const KIND_MAP: u8 = b'm';
const KIND_SET: u8 = b'S';
const KIND_BOOL: u8 = b'B';

impl StructHasher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn str(&mut self, field: &str, value: &str) -> &mut Self {
    if !value.is_empty() {
      self.mix(field, KIND_STR, value.as_bytes());
    }
    self
  }

  pub fn bytes(&mut self, field: &str, value: &[u8]) -> &mut Self {
    if !value.is_empty() {
      self.mix(field, KIND_BYTES, value);
    }
    self
  }

  pub fn flag(&mut self, field: &str, value: bool) -> &mut Self {
    if value {
      self.mix(field, KIND_BOOL, &[1]);
    }
    self
  }

  pub fn digest(&mut self, field: &str, value: Option<&Digest32>) -> &mut Self {
    if let Some(d) = value.filter(|d| **d != [0u8; 32]) {
      self.mix(field, KIND_DIGEST, d);
    }
    self
  }

  /// Hashes a map field as the XOR of its per-entry hashes.
  pub fn map<'a, I>(&mut self, field: &str, entries: I) -> &mut Self
  where
    I: IntoIterator<Item = (&'a str, &'a str)>,
  {
    let combined = combine_map(entries);
    if combined != [0u8; 32] {
      self.mix(field, KIND_MAP, &combined);
    }
    self
  }

  /// Hashes a set field as the XOR of its per-member hashes. Duplicates collapse.
  pub fn set<'a, I>(&mut self, field: &str, members: I) -> &mut Self
  where
    I: IntoIterator<Item = &'a str>,
  {
    let combined = combine_set(members);
    if combined != [0u8; 32] {
      self.mix(field, KIND_SET, &combined);
    }
    self
  }

  pub fn finish(&self) -> Signature {
    Signature(self.acc)
  }

  fn mix(&mut self, field: &str, kind: u8, value: &[u8]) {
    let mut hasher = Sha256::new();
    update_prefixed(&mut hasher, field.as_bytes());
    hasher.update([kind]);
    update_prefixed(&mut hasher, value);
    xor_into(&mut self.acc, &hasher.finalize().into());
  }
}

fn update_prefixed(hasher: &mut Sha256, data: &[u8]) {
  hasher.update((data.len() as u64).to_le_bytes());
  hasher.update(data);
}

fn xor_into(acc: &mut Digest32, other: &Digest32) {
  for (a, b) in acc.iter_mut().zip(other.iter()) {
    *a ^= b;
  }
}

/// XOR of `sha256(key, value)` over all entries.
pub fn combine_map<'a, I>(entries: I) -> Digest32
where
  I: IntoIterator<Item = (&'a str, &'a str)>,
{
  let mut acc = [0u8; 32];
  for (key, value) in entries {
    let mut hasher = Sha256::new();
    update_prefixed(&mut hasher, key.as_bytes());
    update_prefixed(&mut hasher, value.as_bytes());
    xor_into(&mut acc, &hasher.finalize().into());
  }
  acc
}

/// XOR of `sha256(member)` over the distinct members.
pub fn combine_set<'a, I>(members: I) -> Digest32
where
  I: IntoIterator<Item = &'a str>,
{
  let unique: BTreeSet<&str> = members.into_iter().collect();
  let mut acc = [0u8; 32];
  for member in unique {
    let mut hasher = Sha256::new();
    update_prefixed(&mut hasher, member.as_bytes());
    xor_into(&mut acc, &hasher.finalize().into());
  }
  acc
}

/// A full 64-character SHA256 hash for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash includes file contents, directory structure and symlink targets, never
/// timestamps or permissions. Entries are sorted by path; names in `exclude` are skipped.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, HashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| HashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| HashError::ReadSymlink {
        path: entry_path.display().to_string(),
        source: e,
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let mut file = fs::File::open(path).map_err(|e| HashError::ReadFile {
    path: path.display().to_string(),
    source: e,
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| HashError::ReadFile {
      path: path.display().to_string(),
      source: e,
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}
