//! `unpack` operation: extract `.tar`, `.tar.gz`/`.tgz` and `.zip` archives.
//!
//! The format is taken from the file extension, falling back to the leading magic
//! bytes for downloads saved under an uninformative name. Entries that would land
//! outside the destination are rejected.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::info;

use crate::execute::types::ExecuteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
  Tar,
  TarGz,
  Zip,
}

impl ArchiveFormat {
  /// Detects the format of `path` by extension, then by content.
  pub fn detect(path: &Path) -> Result<Self, ExecuteError> {
    let name = path.to_string_lossy();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
      return Ok(ArchiveFormat::TarGz);
    }
    if name.ends_with(".tar") {
      return Ok(ArchiveFormat::Tar);
    }
    if name.ends_with(".zip") {
      return Ok(ArchiveFormat::Zip);
    }

    let mut magic = [0u8; 262];
    let mut file = File::open(path).map_err(|e| ExecuteError::io("open", path, e))?;
    let read = read_up_to(&mut file, &mut magic).map_err(|e| ExecuteError::io("read", path, e))?;
    let magic = &magic[..read];

    if magic.starts_with(&[0x1f, 0x8b]) {
      Ok(ArchiveFormat::TarGz)
    } else if magic.starts_with(b"PK\x03\x04") {
      Ok(ArchiveFormat::Zip)
    } else if magic.len() >= 262 && &magic[257..262] == b"ustar" {
      Ok(ArchiveFormat::Tar)
    } else {
      Err(ExecuteError::UnsupportedArchive(path.to_path_buf()))
    }
  }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
  let mut total = 0;
  while total < buf.len() {
    match reader.read(&mut buf[total..])? {
      0 => break,
      n => total += n,
    }
  }
  Ok(total)
}

/// Extracts `archive` into `dest`, dropping the first `strip` path components of
/// every entry. Entries with nothing left after stripping are skipped.
pub fn unpack_archive(archive: &Path, dest: &Path, strip: usize) -> Result<(), ExecuteError> {
  let format = ArchiveFormat::detect(archive)?;
  fs::create_dir_all(dest).map_err(|e| ExecuteError::io("create", dest, e))?;

  let file = File::open(archive).map_err(|e| ExecuteError::io("open", archive, e))?;
  let reader = BufReader::new(file);
  match format {
    ArchiveFormat::TarGz => unpack_tar(archive, Archive::new(GzDecoder::new(reader)), dest, strip)?,
    ArchiveFormat::Tar => unpack_tar(archive, Archive::new(reader), dest, strip)?,
    ArchiveFormat::Zip => unpack_zip(archive, reader, dest, strip)?,
  }

  info!(archive = ?archive, dest = ?dest, ?format, "unpacked archive");
  Ok(())
}

/// Strips `strip` components and checks the remainder stays relative and inside.
fn entry_target(entry: &Path, strip: usize) -> Result<Option<PathBuf>, ExecuteError> {
  let mut stripped = PathBuf::new();
  let components = entry.components().filter(|c| !matches!(c, Component::CurDir));
  for component in components.skip(strip) {
    match component {
      Component::Normal(part) => stripped.push(part),
      Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
        return Err(ExecuteError::UnsafeEntry {
          entry: entry.display().to_string(),
        });
      }
    }
  }
  Ok((!stripped.as_os_str().is_empty()).then_some(stripped))
}

/// Rejects `rel` when `dest/rel`, or a directory on the way to it, is a symlink.
fn check_not_linked(dest: &Path, rel: &Path) -> Result<(), ExecuteError> {
  let mut current = dest.to_path_buf();
  for part in rel.components() {
    current.push(part);
    match fs::symlink_metadata(&current) {
      Ok(m) if m.file_type().is_symlink() => {
        return Err(ExecuteError::UnsafeEntry {
          entry: rel.display().to_string(),
        });
      }
      Ok(_) => {}
      Err(_) => break,
    }
  }
  Ok(())
}

fn unpack_tar<R: Read>(archive_path: &Path, mut archive: Archive<R>, dest: &Path, strip: usize) -> Result<(), ExecuteError> {
  let failed = |e: std::io::Error| ExecuteError::Unpack {
    path: archive_path.to_path_buf(),
    message: e.to_string(),
  };

  for entry in archive.entries().map_err(failed)? {
    let mut entry = entry.map_err(failed)?;
    let path = entry.path().map_err(failed)?.into_owned();
    if path.is_absolute() {
      return Err(ExecuteError::UnsafeEntry {
        entry: path.display().to_string(),
      });
    }
    let Some(rel) = entry_target(&path, strip)? else {
      continue;
    };

    if let Ok(Some(link)) = entry.link_name()
      && entry.header().entry_type().is_hard_link()
      && entry_target(&link, 0).is_err()
    {
      return Err(ExecuteError::UnsafeEntry {
        entry: link.display().to_string(),
      });
    }

    check_not_linked(dest, &rel)?;
    let target = dest.join(&rel);
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).map_err(|e| ExecuteError::io("create", parent, e))?;
    }
    entry.unpack(&target).map_err(failed)?;
  }
  Ok(())
}

fn unpack_zip<R: Read + std::io::Seek>(
  archive_path: &Path,
  reader: R,
  dest: &Path,
  strip: usize,
) -> Result<(), ExecuteError> {
  let failed = |message: String| ExecuteError::Unpack {
    path: archive_path.to_path_buf(),
    message,
  };

  let mut archive = zip::ZipArchive::new(reader).map_err(|e| failed(format!("failed to open zip: {e}")))?;

  for i in 0..archive.len() {
    let mut file = archive
      .by_index(i)
      .map_err(|e| failed(format!("failed to read zip entry: {e}")))?;

    let path = file.enclosed_name().ok_or_else(|| ExecuteError::UnsafeEntry {
      entry: file.name().to_string(),
    })?;
    let Some(rel) = entry_target(&path, strip)? else {
      continue;
    };
    check_not_linked(dest, &rel)?;
    let target = dest.join(rel);

    if file.is_dir() {
      fs::create_dir_all(&target).map_err(|e| ExecuteError::io("create", &target, e))?;
      continue;
    }

    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).map_err(|e| ExecuteError::io("create", parent, e))?;
    }
    let mut out = File::create(&target).map_err(|e| ExecuteError::io("create", &target, e))?;
    std::io::copy(&mut file, &mut out).map_err(|e| ExecuteError::io("write", &target, e))?;

    if let Some(mode) = file.unix_mode() {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| ExecuteError::io("chmod", &target, e))?;
    }
  }
  Ok(())
}
