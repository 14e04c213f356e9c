//! Executing an install plan.
//!
//! Packages are installed one at a time in plan order while the store lock is held.
//! A package is either built from its recipe or unpacked from a verified archive.
//! When one fails, the error names it; packages installed before it stay.

pub mod profile;

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::build::{self, BuildError, BuildOptions};
use crate::car::{self, CarError, CarInfo};
use crate::platform::immutable::{self, ImmutableError};
use crate::resolve::{ArchiveSource, Installer, LookupError, PackagePlan};
use crate::store::{LockMode, PkgInfo, Store, StoreError, StoreLock, StoreLockError};
use crate::util::hash::PackageId;

pub use profile::create_profile;

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("failed to build {id}: {source}")]
  Build {
    id: PackageId,
    #[source]
    source: BuildError,
  },

  #[error("failed to fetch archive for {id}: {source}")]
  Fetch {
    id: PackageId,
    #[source]
    source: LookupError,
  },

  #[error("failed to unpack archive for {id}: {source}")]
  Archive {
    id: PackageId,
    #[source]
    source: CarError,
  },

  #[error("archive for {expected} contains {found}")]
  IdMismatch { expected: PackageId, found: PackageId },

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Immutable(#[from] ImmutableError),

  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl InstallError {
  /// The package whose installation failed, if the failure belongs to one.
  pub fn package(&self) -> Option<&PackageId> {
    match self {
      InstallError::Build { id, .. } | InstallError::Fetch { id, .. } | InstallError::Archive { id, .. } => Some(id),
      InstallError::IdMismatch { expected, .. } => Some(expected),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
  pub build: BuildOptions,
}

/// Installs every pending package of `plan`. Returns the IDs newly installed.
pub async fn install(
  plan: &PackagePlan,
  store: &Store,
  source: &dyn ArchiveSource,
  options: &InstallOptions,
) -> Result<Vec<PackageId>, InstallError> {
  let _lock = StoreLock::acquire(store.active(), LockMode::Exclusive, "install")?;

  let mut installed = Vec::new();
  for package in plan.pending() {
    if store.is_installed(&package.id) && store.read_info(&package.id).is_ok() {
      continue;
    }

    match &package.installer {
      Installer::Installed => continue,
      Installer::Build(recipe) => {
        build::realize(recipe, store, &options.build)
          .await
          .map_err(|source| InstallError::Build {
            id: package.id.clone(),
            source,
          })?;
      }
      Installer::Archive(info) => {
        install_archive(&package.id, info, store, source).await?;
      }
    }
    installed.push(package.id.clone());
  }

  info!(installed = installed.len(), "install complete");
  Ok(installed)
}

async fn install_archive(
  id: &PackageId,
  planned: &CarInfo,
  store: &Store,
  source: &dyn ArchiveSource,
) -> Result<(), InstallError> {
  info!(id = %id, source = source.name(), "installing from archive");
  let bytes = source.fetch(id).await.map_err(|source| InstallError::Fetch {
    id: id.clone(),
    source,
  })?;

  let target = store.entry_path(id);
  immutable::remove_entry(&target)?;
  let info = car::unpack(&bytes, &target).map_err(|source| InstallError::Archive {
    id: id.clone(),
    source,
  })?;

  if let Err(err) = record_archive(id, &info, planned, store) {
    warn!(id = %id, error = %err, "removing unpacked archive");
    if let Err(e) = immutable::remove_entry(&target) {
      warn!(path = ?target, error = %e, "failed to remove unpacked archive");
    }
    let _ = std::fs::remove_file(store.sidecar_path(id));
    return Err(err);
  }
  Ok(())
}

/// Checks the unpacked record and writes the side-car and `.pkg-info.json`.
fn record_archive(id: &PackageId, info: &CarInfo, planned: &CarInfo, store: &Store) -> Result<(), InstallError> {
  if &info.id != id {
    return Err(InstallError::IdMismatch {
      expected: id.clone(),
      found: info.id.clone(),
    });
  }
  if info.dependencies != planned.dependencies {
    warn!(id = %id, "archive dependencies differ from the looked-up record");
  }

  let sidecar = store.sidecar_path(id);
  let json = serde_json::to_vec_pretty(info).map_err(|e| InstallError::Io {
    op: "serialize",
    path: sidecar.clone(),
    source: std::io::Error::other(e),
  })?;
  std::fs::write(&sidecar, json).map_err(|source| InstallError::Io {
    op: "write",
    path: sidecar.clone(),
    source,
  })?;

  let deps = info.dependency_ids();
  let target = store.entry_path(id);
  let pkg = PkgInfo {
    repo: info.repo.clone(),
    declared_deps: deps.clone(),
    runtime_deps: deps.clone(),
    build_deps: deps,
    constraints: info.constraints.clone(),
    ..PkgInfo::new(id.clone(), &info.name, &info.version)
  };
  pkg.write(&target)?;
  immutable::freeze(&target)?;
  Ok(())
}
