//! Well-known kiln directories.
//!
//! Everything lives under a single root (`/kiln` by default). `KILN_ROOT` moves the
//! whole tree and `KILN_STORE` relocates just the store.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Returns the kiln root directory.
pub fn root_dir() -> PathBuf {
  if let Ok(path) = std::env::var("KILN_ROOT") {
    return PathBuf::from(path);
  }
  PathBuf::from("/").join(APP_NAME)
}

/// Returns the directory holding content-addressed store entries.
pub fn store_dir() -> PathBuf {
  if let Ok(path) = std::env::var("KILN_STORE") {
    return PathBuf::from(path);
  }
  root_dir().join("store")
}

/// Returns the directory of GC root symlinks.
pub fn roots_dir() -> PathBuf {
  root_dir().join("roots")
}

/// Returns the directory holding profile link farms.
pub fn profiles_dir() -> PathBuf {
  root_dir().join("profiles")
}
