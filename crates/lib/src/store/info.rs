//! `.pkg-info.json`: the record kept inside every store entry.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::PKG_INFO_FILENAME;
use crate::recipe::{Constraints, InputRecord};
use crate::util::hash::PackageId;

use super::StoreError;

/// What a store entry was built from and what it needs at run time.
///
/// `runtime_deps` is always a subset of `build_deps`, except for explicit
/// dependencies which are runtime dependencies by declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkgInfo {
  pub id: PackageId,
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub repo: String,
  #[serde(default)]
  pub declared_deps: Vec<PackageId>,
  #[serde(default)]
  pub runtime_deps: Vec<PackageId>,
  #[serde(default)]
  pub build_deps: Vec<PackageId>,
  #[serde(default)]
  pub constraints: Constraints,
  #[serde(default)]
  pub inputs: Vec<InputRecord>,
}

impl PkgInfo {
  /// A record with no dependencies or inputs.
  pub fn new(id: PackageId, name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      id,
      name: name.into(),
      version: version.into(),
      repo: String::new(),
      declared_deps: Vec::new(),
      runtime_deps: Vec::new(),
      build_deps: Vec::new(),
      constraints: Constraints::new(),
      inputs: Vec::new(),
    }
  }

  /// Reads the record of the entry at `entry_dir`.
  pub fn read(entry_dir: &Path) -> Result<Self, StoreError> {
    let path = entry_dir.join(PKG_INFO_FILENAME);
    let contents = std::fs::read_to_string(&path).map_err(|e| StoreError::io("read", &path, e))?;
    serde_json::from_str(&contents).map_err(|source| StoreError::InvalidInfo { path, source })
  }

  /// Writes the record into the entry at `entry_dir`.
  pub fn write(&self, entry_dir: &Path) -> Result<(), StoreError> {
    let path = entry_dir.join(PKG_INFO_FILENAME);
    let json = serde_json::to_string_pretty(self).map_err(|source| StoreError::InvalidInfo {
      path: path.clone(),
      source,
    })?;
    std::fs::write(&path, json).map_err(|e| StoreError::io("write", &path, e))
  }
}
