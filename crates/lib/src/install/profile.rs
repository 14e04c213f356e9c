//! Profiles and GC roots.
//!
//! A profile is a directory of symlinks named by package ID, each pointing at its
//! store entry. `roots/<name>` links to the profile and keeps everything in it
//! alive across garbage collection.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::store::Store;
use crate::util::hash::PackageId;

use super::InstallError;

fn io(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> InstallError {
  let path = path.to_path_buf();
  move |source| InstallError::Io { op, path, source }
}

fn replace_symlink(target: &Path, link: &Path) -> Result<(), InstallError> {
  if link.symlink_metadata().is_ok() {
    std::fs::remove_file(link).map_err(io("remove", link))?;
  }
  std::os::unix::fs::symlink(target, link).map_err(io("symlink", link))
}

/// Creates (or replaces) profile `name` holding `ids`, and its root link.
///
/// Every ID must be installed. Returns the profile directory.
pub fn create_profile(
  store: &Store,
  profiles_dir: &Path,
  roots_dir: &Path,
  name: &str,
  ids: &[PackageId],
) -> Result<PathBuf, InstallError> {
  let entries = ids
    .iter()
    .map(|id| Ok((id, store.lookup(id)?)))
    .collect::<Result<Vec<_>, InstallError>>()?;

  let profile = profiles_dir.join(name);
  if profile.symlink_metadata().is_ok() {
    std::fs::remove_dir_all(&profile).map_err(io("remove", &profile))?;
  }
  std::fs::create_dir_all(&profile).map_err(io("create", &profile))?;
  for (id, entry) in &entries {
    let link = profile.join(id.as_str());
    std::os::unix::fs::symlink(entry, &link).map_err(io("symlink", &link))?;
  }

  std::fs::create_dir_all(roots_dir).map_err(io("create", roots_dir))?;
  replace_symlink(&profile, &roots_dir.join(name))?;

  info!(profile = %name, packages = entries.len(), "created profile");
  Ok(profile)
}
