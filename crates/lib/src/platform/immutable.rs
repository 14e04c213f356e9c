//! Freezing and thawing store entries.
//!
//! A store entry is made read-only once its build or unpack succeeds. Before GC or a
//! failed-build rollback can delete it, write permission is restored.
//!
//! Symlinks are never followed: an entry may link into other store entries and those
//! must keep their own permissions.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ImmutableError {
  #[error("failed to set permissions on {path}: {source}")]
  SetPermissions {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to read metadata for {path}: {source}")]
  Metadata {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to traverse directory {path}: {source}")]
  WalkDir {
    path: String,
    #[source]
    source: walkdir::Error,
  },

  #[error("failed to remove {path}: {source}")]
  Remove {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// Removes write permission from every file and directory under `path`.
///
/// Files become 0444, directories and executables 0555. Per-entry failures are
/// logged and skipped.
pub fn freeze(path: &Path) -> Result<(), ImmutableError> {
  if fs::symlink_metadata(path).is_err() {
    return Ok(());
  }

  debug!(path = ?path, "freezing store entry");

  // Children first so directories are still writable while we visit them.
  for entry in WalkDir::new(path).contents_first(true) {
    let entry = entry.map_err(|e| ImmutableError::WalkDir {
      path: path.display().to_string(),
      source: e,
    })?;

    if entry.path_is_symlink() {
      continue;
    }

    if let Err(e) = set_writable(entry.path(), false) {
      warn!(path = ?entry.path(), error = %e, "failed to freeze, continuing");
    }
  }

  #[cfg(target_os = "macos")]
  clear_bsd_flags(path);

  Ok(())
}

/// Restores write permission under `path` (0644 files, 0755 directories and executables).
pub fn thaw(path: &Path) -> Result<(), ImmutableError> {
  if fs::symlink_metadata(path).is_err() {
    return Ok(());
  }

  debug!(path = ?path, "thawing store entry");

  // Parents first so we can descend into them.
  let mut walker = WalkDir::new(path).into_iter();
  while let Some(entry) = walker.next() {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) => {
        // An unreadable directory gets fixed before we try again.
        if let Some(p) = e.path() {
          let _ = set_writable(p, true);
        }
        return Err(ImmutableError::WalkDir {
          path: path.display().to_string(),
          source: e,
        });
      }
    };

    if entry.path_is_symlink() {
      if entry.file_type().is_dir() {
        walker.skip_current_dir();
      }
      continue;
    }

    if let Err(e) = set_writable(entry.path(), true) {
      warn!(path = ?entry.path(), error = %e, "failed to thaw, continuing");
    }
  }

  Ok(())
}

/// Thaws and deletes a store entry. A missing path is not an error.
pub fn remove_entry(path: &Path) -> Result<(), ImmutableError> {
  let metadata = match fs::symlink_metadata(path) {
    Ok(m) => m,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
    Err(e) => {
      return Err(ImmutableError::Metadata {
        path: path.display().to_string(),
        source: e,
      });
    }
  };

  let result = if metadata.is_dir() {
    thaw(path)?;
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  };

  result.map_err(|e| ImmutableError::Remove {
    path: path.display().to_string(),
    source: e,
  })
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> Result<(), ImmutableError> {
  use std::os::unix::fs::PermissionsExt;

  let metadata = fs::symlink_metadata(path).map_err(|e| ImmutableError::Metadata {
    path: path.display().to_string(),
    source: e,
  })?;

  let executable = metadata.is_dir() || (metadata.permissions().mode() & 0o111 != 0);
  let new_mode = match (writable, executable) {
    (false, false) => 0o444,
    (false, true) => 0o555,
    (true, false) => 0o644,
    (true, true) => 0o755,
  };

  fs::set_permissions(path, fs::Permissions::from_mode(new_mode)).map_err(|e| ImmutableError::SetPermissions {
    path: path.display().to_string(),
    source: e,
  })
}

/// Clears BSD file flags (e.g. UF_IMMUTABLE) that would block a later GC.
#[cfg(target_os = "macos")]
fn clear_bsd_flags(path: &Path) {
  use std::ffi::CString;
  use std::os::unix::ffi::OsStrExt;

  for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
    if entry.path_is_symlink() {
      continue;
    }
    if let Ok(cpath) = CString::new(entry.path().as_os_str().as_bytes()) {
      // SAFETY: cpath is a valid NUL-terminated path for the duration of the call.
      unsafe {
        libc::chflags(cpath.as_ptr(), 0);
      }
    }
  }
}
