//! Mark-and-sweep garbage collection of store entries.
//!
//! Roots are the symlinks in `roots/`. Each resolves either straight to a store
//! entry or to a profile directory whose symlinks point into the store. Everything
//! reachable from those entries through recorded runtime dependencies is live;
//! every other ID in the active store is swept.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::{fs, io};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::platform::immutable::{self, ImmutableError};
use crate::store::{LockMode, Store, StoreError, StoreLock, StoreLockError};
use crate::util::hash::PackageId;

#[derive(Debug, Error)]
pub enum GcError {
  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to delete {path}: {source}")]
  Delete {
    path: PathBuf,
    #[source]
    source: ImmutableError,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GcStats {
  pub scanned: usize,
  pub reachable: usize,
  pub deleted: usize,
  pub bytes_freed: u64,
}

#[derive(Debug, serde::Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// The ID of the store entry containing `path`, if it lies inside one.
fn store_id(store: &Store, path: &Path) -> Option<PackageId> {
  store.paths().iter().find_map(|prefix| {
    let rest = path.strip_prefix(prefix).ok()?;
    match rest.components().next()? {
      Component::Normal(name) => PackageId::parse(name.to_str()?).ok(),
      _ => None,
    }
  })
}

/// Store IDs referenced by symlinks anywhere under `dir`.
fn linked_ids(store: &Store, dir: &Path, found: &mut Vec<PackageId>) -> Result<(), GcError> {
  for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|e| GcError::Io {
      op: "walk",
      path: e.path().unwrap_or(dir).to_path_buf(),
      source: e.into_io_error().unwrap_or_else(|| io::Error::other("filesystem loop")),
    })?;
    if !entry.path_is_symlink() {
      continue;
    }

    let link = fs::read_link(entry.path()).map_err(|source| GcError::Io {
      op: "read link",
      path: entry.path().to_path_buf(),
      source,
    })?;
    let target = match entry.path().parent() {
      Some(parent) if link.is_relative() => parent.join(&link),
      _ => link,
    };
    let target = dunce::canonicalize(&target).unwrap_or(target);
    if let Some(id) = store_id(store, &target) {
      found.push(id);
    }
  }
  Ok(())
}

/// IDs reachable from the symlinks in `roots_dir`.
pub fn mark(store: &Store, roots_dir: &Path) -> Result<BTreeSet<PackageId>, GcError> {
  let mut pending = Vec::new();

  let entries = match fs::read_dir(roots_dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      debug!(path = ?roots_dir, "no roots directory");
      return Ok(BTreeSet::new());
    }
    Err(source) => {
      return Err(GcError::Io {
        op: "read",
        path: roots_dir.to_path_buf(),
        source,
      });
    }
  };

  let mut roots: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
  roots.sort();

  for root in roots {
    let target = match dunce::canonicalize(&root) {
      Ok(target) => target,
      Err(e) => {
        warn!(root = ?root, error = %e, "skipping dangling root");
        continue;
      }
    };

    if let Some(id) = store_id(store, &target) {
      pending.push(id);
    } else if target.is_dir() {
      linked_ids(store, &target, &mut pending)?;
    }
  }

  let mut reachable = BTreeSet::new();
  while let Some(id) = pending.pop() {
    if reachable.contains(&id) {
      continue;
    }
    match store.read_info(&id) {
      Ok(info) => pending.extend(info.runtime_deps),
      Err(e) if e.is_not_found() => {
        debug!(id = %id, "reachable package has no record");
      }
      Err(e) => return Err(e.into()),
    }
    reachable.insert(id);
  }

  debug!(reachable = reachable.len(), "mark complete");
  Ok(reachable)
}

/// IDs in the active store that are not in `reachable`.
pub fn sweep(store: &Store, reachable: &BTreeSet<PackageId>) -> Result<Vec<PackageId>, GcError> {
  let candidates: Vec<PackageId> = store
    .ids()?
    .into_iter()
    .filter(|id| !reachable.contains(id))
    .collect();
  debug!(candidates = candidates.len(), "sweep complete");
  Ok(candidates)
}

/// Marks, sweeps and, unless `dry_run`, deletes unreachable entries and their side-cars.
pub fn collect_garbage(store: &Store, roots_dir: &Path, dry_run: bool) -> Result<GcResult, GcError> {
  let _lock = StoreLock::acquire(store.active(), LockMode::Exclusive, "gc")?;

  let reachable = mark(store, roots_dir)?;
  let candidates = sweep(store, &reachable)?;

  let mut stats = GcStats {
    scanned: reachable.len() + candidates.len(),
    reachable: reachable.len(),
    ..GcStats::default()
  };
  let mut deleted_paths = Vec::new();

  for id in candidates {
    let path = store.entry_path(&id);
    let size = dir_size(&path);
    debug!(id = %id, bytes = size, "removing unreachable entry");

    if !dry_run {
      immutable::remove_entry(&path).map_err(|source| GcError::Delete {
        path: path.clone(),
        source,
      })?;
      let sidecar = store.sidecar_path(&id);
      if let Err(e) = fs::remove_file(&sidecar)
        && e.kind() != io::ErrorKind::NotFound
      {
        return Err(GcError::Io {
          op: "remove",
          path: sidecar,
          source: e,
        });
      }
    }

    stats.deleted += 1;
    stats.bytes_freed += size;
    deleted_paths.push(path);
  }

  info!(
    reachable = stats.reachable,
    deleted = stats.deleted,
    bytes_freed = stats.bytes_freed,
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult { stats, deleted_paths })
}
