//! Where prebuilt archives come from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::car::{CarInfo, Packed};
use crate::util::hash::PackageId;

#[derive(Debug, Error)]
pub enum LookupError {
  #[error("no archive for {0}")]
  NotFound(PackageId),

  #[error("archive lookup for {id} failed: {message}")]
  Transport { id: PackageId, message: String },

  #[error("invalid archive metadata for {id}: {message}")]
  Invalid { id: PackageId, message: String },

  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl LookupError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, LookupError::NotFound(_))
  }
}

/// A provider of signed archives, queried by package ID.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
  /// The info record of the archive for `id`, or [`LookupError::NotFound`].
  async fn lookup(&self, id: &PackageId) -> Result<CarInfo, LookupError>;

  /// The archive bytes for `id`.
  async fn fetch(&self, id: &PackageId) -> Result<Vec<u8>, LookupError>;

  /// Label for logs.
  fn name(&self) -> &str;
}

/// A source that never has anything; every package is built from source.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSubstitutes;

#[async_trait]
impl ArchiveSource for NoSubstitutes {
  async fn lookup(&self, id: &PackageId) -> Result<CarInfo, LookupError> {
    Err(LookupError::NotFound(id.clone()))
  }

  async fn fetch(&self, id: &PackageId) -> Result<Vec<u8>, LookupError> {
    Err(LookupError::NotFound(id.clone()))
  }

  fn name(&self) -> &str {
    "none"
  }
}

/// Archives in a local directory: `<id>.car` plus its `<id>.json` info record.
#[derive(Debug, Clone)]
pub struct DirArchiveSource {
  dir: PathBuf,
}

impl DirArchiveSource {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Writes a packed archive and its info record into the directory.
  pub fn publish(&self, packed: &Packed) -> Result<(), LookupError> {
    std::fs::create_dir_all(&self.dir).map_err(|source| LookupError::Io {
      op: "create",
      path: self.dir.clone(),
      source,
    })?;
    let id = &packed.info.id;
    let info = serde_json::to_vec_pretty(&packed.info).map_err(|e| LookupError::Invalid {
      id: id.clone(),
      message: e.to_string(),
    })?;
    write(&self.dir.join(format!("{id}.car")), &packed.bytes)?;
    write(&self.dir.join(format!("{id}.json")), &info)?;
    debug!(id = %id, dir = ?self.dir, "published archive");
    Ok(())
  }

  fn read(&self, id: &PackageId, extension: &str) -> Result<Vec<u8>, LookupError> {
    let path = self.dir.join(format!("{id}.{extension}"));
    match std::fs::read(&path) {
      Ok(bytes) => Ok(bytes),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LookupError::NotFound(id.clone())),
      Err(source) => Err(LookupError::Io {
        op: "read",
        path,
        source,
      }),
    }
  }
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), LookupError> {
  std::fs::write(path, bytes).map_err(|source| LookupError::Io {
    op: "write",
    path: path.to_path_buf(),
    source,
  })
}

#[async_trait]
impl ArchiveSource for DirArchiveSource {
  async fn lookup(&self, id: &PackageId) -> Result<CarInfo, LookupError> {
    let bytes = self.read(id, "json")?;
    let info: CarInfo = serde_json::from_slice(&bytes).map_err(|e| LookupError::Invalid {
      id: id.clone(),
      message: e.to_string(),
    })?;
    if &info.id != id {
      return Err(LookupError::Invalid {
        id: id.clone(),
        message: format!("record describes {}", info.id),
      });
    }
    Ok(info)
  }

  async fn fetch(&self, id: &PackageId) -> Result<Vec<u8>, LookupError> {
    self.read(id, "car")
  }

  fn name(&self) -> &str {
    "directory"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::car::{CarSigner, pack};
  use tempfile::TempDir;

  #[tokio::test]
  async fn no_substitutes_is_always_not_found() {
    let id = PackageId::parse("sigA-A-1").unwrap();
    assert!(NoSubstitutes.lookup(&id).await.unwrap_err().is_not_found());
    assert!(NoSubstitutes.fetch(&id).await.unwrap_err().is_not_found());
  }

  #[tokio::test]
  async fn directory_source_serves_published_archives() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("file"), "x").unwrap();

    let id = PackageId::parse("sigA-A-1").unwrap();
    let packed = pack(
      CarInfo::new(id.clone(), "A", "1"),
      &tree,
      &CarSigner::generate(),
      Path::new("/kiln/store"),
    )
    .unwrap();

    let source = DirArchiveSource::new(temp.path().join("cache"));
    source.publish(&packed).unwrap();

    assert_eq!(source.lookup(&id).await.unwrap(), packed.info);
    assert_eq!(source.fetch(&id).await.unwrap(), packed.bytes);

    let missing = PackageId::parse("sigB-B-1").unwrap();
    assert!(source.lookup(&missing).await.unwrap_err().is_not_found());
  }

  #[tokio::test]
  async fn mismatched_record_is_invalid() {
    let temp = TempDir::new().unwrap();
    let id = PackageId::parse("sigA-A-1").unwrap();
    let other = CarInfo::new(PackageId::parse("sigB-B-1").unwrap(), "B", "1");
    std::fs::write(temp.path().join("sigA-A-1.json"), serde_json::to_vec(&other).unwrap()).unwrap();

    let source = DirArchiveSource::new(temp.path());
    assert!(matches!(source.lookup(&id).await, Err(LookupError::Invalid { .. })));
  }
}
