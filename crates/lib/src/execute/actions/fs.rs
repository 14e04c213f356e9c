//! Filesystem operations: `replace`, `symlink`, `install`, `mkdir` and `write`.

use std::path::Path;

use tokio::fs;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::execute::types::ExecuteError;

/// Replaces every occurrence of `from` with `to` in `file`.
pub async fn replace_in_file(file: &Path, from: &str, to: &str) -> Result<(), ExecuteError> {
  let contents = fs::read_to_string(file)
    .await
    .map_err(|e| ExecuteError::io("read", file, e))?;
  if !contents.contains(from) {
    return Err(ExecuteError::ReplaceNotFound {
      file: file.to_path_buf(),
      pattern: from.to_string(),
    });
  }
  let count = contents.matches(from).count();
  fs::write(file, contents.replace(from, to))
    .await
    .map_err(|e| ExecuteError::io("write", file, e))?;
  debug!(file = ?file, count, "replaced pattern");
  Ok(())
}

/// Creates `link` pointing at `target`, replacing an existing symlink.
pub async fn symlink(target: &str, link: &Path) -> Result<(), ExecuteError> {
  if let Some(parent) = link.parent() {
    fs::create_dir_all(parent)
      .await
      .map_err(|e| ExecuteError::io("create", parent, e))?;
  }
  if let Ok(meta) = fs::symlink_metadata(link).await
    && meta.file_type().is_symlink()
  {
    fs::remove_file(link)
      .await
      .map_err(|e| ExecuteError::io("remove", link, e))?;
  }
  fs::symlink(target, link)
    .await
    .map_err(|e| ExecuteError::io("symlink", link, e))
}

pub async fn mkdir(path: &Path) -> Result<(), ExecuteError> {
  fs::create_dir_all(path)
    .await
    .map_err(|e| ExecuteError::io("create", path, e))
}

pub async fn write_file(path: &Path, contents: &str, executable: bool) -> Result<(), ExecuteError> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)
      .await
      .map_err(|e| ExecuteError::io("create", parent, e))?;
  }
  fs::write(path, contents)
    .await
    .map_err(|e| ExecuteError::io("write", path, e))?;
  if executable {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
      .await
      .map_err(|e| ExecuteError::io("chmod", path, e))?;
  }
  Ok(())
}

/// Copies `src` to `dest`, or symlinks each file when `link` is set.
///
/// A file source installs to `dest` itself, or into it when `dest` is an existing
/// directory. A directory source is mirrored under `dest`, preserving symlinks.
pub fn install(src: &Path, dest: &Path, link: bool) -> Result<(), ExecuteError> {
  let meta = std::fs::symlink_metadata(src).map_err(|e| ExecuteError::io("read", src, e))?;
  info!(src = ?src, dest = ?dest, link, "installing");

  if !meta.is_dir() {
    let dest = if dest.is_dir() {
      match src.file_name() {
        Some(name) => dest.join(name),
        None => dest.to_path_buf(),
      }
    } else {
      dest.to_path_buf()
    };
    return install_entry(src, &dest, link);
  }

  for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(|e| ExecuteError::Io {
      op: "walk",
      path: src.to_path_buf(),
      source: e.into(),
    })?;
    let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
    let target = dest.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&target).map_err(|e| ExecuteError::io("create", &target, e))?;
    } else {
      install_entry(entry.path(), &target, link)?;
    }
  }
  Ok(())
}

fn install_entry(src: &Path, dest: &Path, link: bool) -> Result<(), ExecuteError> {
  if let Some(parent) = dest.parent() {
    std::fs::create_dir_all(parent).map_err(|e| ExecuteError::io("create", parent, e))?;
  }
  if std::fs::symlink_metadata(dest).is_ok() {
    std::fs::remove_file(dest).map_err(|e| ExecuteError::io("remove", dest, e))?;
  }

  let meta = std::fs::symlink_metadata(src).map_err(|e| ExecuteError::io("read", src, e))?;
  if meta.file_type().is_symlink() {
    let target = std::fs::read_link(src).map_err(|e| ExecuteError::io("read link", src, e))?;
    std::os::unix::fs::symlink(&target, dest).map_err(|e| ExecuteError::io("symlink", dest, e))
  } else if link {
    std::os::unix::fs::symlink(src, dest).map_err(|e| ExecuteError::io("symlink", dest, e))
  } else {
    std::fs::copy(src, dest)
      .map(drop)
      .map_err(|e| ExecuteError::io("copy", dest, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::unix::fs::PermissionsExt;
  use tempfile::TempDir;

  #[tokio::test]
  async fn replace_rewrites_all_occurrences() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("Makefile");
    std::fs::write(&file, "PREFIX=/usr\nBIN=/usr/bin\n").unwrap();

    replace_in_file(&file, "/usr", "/kiln/store/x").await.unwrap();

    assert_eq!(
      std::fs::read_to_string(&file).unwrap(),
      "PREFIX=/kiln/store/x\nBIN=/kiln/store/x/bin\n"
    );
  }

  #[tokio::test]
  async fn replace_missing_pattern_fails() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("config.h");
    std::fs::write(&file, "#define X 1\n").unwrap();
    let result = replace_in_file(&file, "Y", "Z").await;
    assert!(matches!(result, Err(ExecuteError::ReplaceNotFound { .. })));
  }

  #[tokio::test]
  async fn symlink_replaces_existing_link() {
    let temp = TempDir::new().unwrap();
    let link = temp.path().join("bin/tool");
    symlink("tool-1.0", &link).await.unwrap();
    symlink("tool-2.0", &link).await.unwrap();
    assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("tool-2.0"));
  }

  #[tokio::test]
  async fn write_executable_sets_mode() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bin/run");
    write_file(&path, "#!/bin/sh\n", true).await.unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
  }

  #[test]
  fn install_copies_tree() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    std::fs::create_dir_all(src.join("lib")).unwrap();
    std::fs::write(src.join("lib/libz.a"), "archive").unwrap();
    std::os::unix::fs::symlink("libz.a", src.join("lib/libz.so")).unwrap();

    let dest = temp.path().join("prefix");
    install(&src, &dest, false).unwrap();

    assert_eq!(std::fs::read_to_string(dest.join("lib/libz.a")).unwrap(), "archive");
    assert_eq!(std::fs::read_link(dest.join("lib/libz.so")).unwrap(), Path::new("libz.a"));
  }

  #[test]
  fn install_file_into_directory() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tool");
    std::fs::write(&src, "bin").unwrap();
    let dest = temp.path().join("bin");
    std::fs::create_dir(&dest).unwrap();

    install(&src, &dest, false).unwrap();
    assert!(dest.join("tool").is_file());
  }

  #[test]
  fn install_link_mode_symlinks_files() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tool");
    std::fs::write(&src, "bin").unwrap();
    let dest = temp.path().join("linked");

    install(&src, &dest, true).unwrap();
    assert_eq!(std::fs::read_link(&dest).unwrap(), src);
  }
}
