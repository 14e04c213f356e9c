//! Signed, reproducible package archives ("car" files).
//!
//! A car is a gzip-compressed tar holding a store entry's tree, followed by two
//! reserved entries: `.car-info.json` (the [`CarInfo`] record) and `~signature`
//! (an ed25519 signature). Entry headers carry no owner or time metadata, so the
//! same tree packed twice yields the same bytes.
//!
//! The signed message is not the archive bytes but a digest over every entry's
//! name, kind and content sum (or link target) in archive order, followed by the
//! info record. Unpacking recomputes it while extracting and removes everything it
//! wrote if verification fails.

pub mod scan;
pub mod signer;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::consts::{CAR_INFO_ENTRY, CAR_SIGNATURE_ENTRY, PKG_INFO_FILENAME};
use crate::platform::HostPlatform;
use crate::recipe::Constraints;
use crate::store::PkgInfo;
use crate::util::hash::PackageId;

pub use scan::RefScanner;
pub use signer::{CarSigner, verify};

#[derive(Debug, Error)]
pub enum CarError {
  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to traverse {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("invalid archive info record: {0}")]
  InvalidInfo(#[source] serde_json::Error),

  #[error("archive has no info record")]
  MissingInfo,

  #[error("archive is unsigned")]
  Unsigned,

  #[error("archive has no signature entry")]
  MissingSignature,

  #[error("archive signature is invalid")]
  InvalidSignature,

  #[error("invalid key: {0}")]
  InvalidKey(String),

  #[error("unsafe archive entry: {0}")]
  UnsafeEntry(String),

  #[error("unsupported archive entry type: {0}")]
  UnsupportedEntry(String),
}

impl CarError {
  pub(crate) fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
    CarError::Io {
      op,
      path: path.to_path_buf(),
      source,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarDependency {
  pub id: PackageId,
  #[serde(default)]
  pub repo: String,
  #[serde(default)]
  pub signer: String,
}

/// The `.car-info.json` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarInfo {
  pub id: PackageId,
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub repo: String,
  #[serde(default)]
  pub signer: String,
  #[serde(default)]
  pub dependencies: Vec<CarDependency>,
  #[serde(default)]
  pub platform: HostPlatform,
  #[serde(default)]
  pub constraints: Constraints,
}

impl CarInfo {
  /// An unsigned record for this host; `pack` fills in signer and dependencies.
  pub fn new(id: PackageId, name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      id,
      name: name.into(),
      version: version.into(),
      repo: String::new(),
      signer: String::new(),
      dependencies: Vec::new(),
      platform: HostPlatform::detect(),
      constraints: Constraints::new(),
    }
  }

  pub fn from_pkg_info(pkg: &PkgInfo) -> Self {
    Self {
      repo: pkg.repo.clone(),
      constraints: pkg.constraints.clone(),
      ..Self::new(pkg.id.clone(), &pkg.name, &pkg.version)
    }
  }

  pub fn dependency_ids(&self) -> Vec<PackageId> {
    self.dependencies.iter().map(|d| d.id.clone()).collect()
  }
}

/// A packed archive.
#[derive(Debug)]
pub struct Packed {
  pub bytes: Vec<u8>,
  /// SHA-256 of `bytes`, for transport integrity only.
  pub content_sum: String,
  /// The record as embedded, with signer and discovered dependencies.
  pub info: CarInfo,
}

impl Packed {
  pub fn dependency_ids(&self) -> Vec<PackageId> {
    self.info.dependency_ids()
  }
}

/// Digest over entries in archive order, then the info record.
struct EntryDigest(Sha256);

impl EntryDigest {
  fn new() -> Self {
    Self(Sha256::new())
  }

  fn entry(&mut self, name: &str, kind: u8, extra: &[u8]) {
    self.0.update(name.as_bytes());
    self.0.update([0, kind, 0]);
    self.0.update(extra);
    self.0.update([0]);
  }

  fn info(&mut self, json: &[u8]) {
    self.0.update(json);
  }

  fn finish(self) -> [u8; 32] {
    self.0.finalize().into()
  }
}

const KIND_FILE: u8 = b'f';
const KIND_EXECUTABLE: u8 = b'x';
const KIND_SYMLINK: u8 = b'l';
const KIND_DIR: u8 = b'd';

/// Hashes and scans file contents as tar reads them.
struct Inspect<'a, R> {
  inner: R,
  hasher: Sha256,
  scanner: &'a mut RefScanner,
}

impl<R: Read> Read for Inspect<'_, R> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let n = self.inner.read(buf)?;
    self.hasher.update(&buf[..n]);
    self.scanner.feed(&buf[..n]);
    Ok(n)
  }
}

/// Packs the store entry at `dir` and signs it.
///
/// The entry's own `.pkg-info.json` is left out. Absolute symlinks pointing inside
/// `dir` are rewritten relative to the link. Every `<store_prefix>/<id>` found in
/// file contents or link targets, other than `info.id` itself, becomes a dependency.
pub fn pack(mut info: CarInfo, dir: &Path, signer: &CarSigner, store_prefix: &Path) -> Result<Packed, CarError> {
  let roots = link_roots(dir);
  let mut scanner = RefScanner::new(&store_prefix.display().to_string()).excluding(info.id.clone());
  let mut digest = EntryDigest::new();
  let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
  let mut entries = 0usize;

  for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|source| CarError::Walk {
      path: dir.to_path_buf(),
      source,
    })?;
    let path = entry.path();
    let Ok(rel) = path.strip_prefix(dir) else { continue };
    let name = entry_name(rel)?;
    if name == PKG_INFO_FILENAME || name == CAR_INFO_ENTRY || name == CAR_SIGNATURE_ENTRY {
      continue;
    }

    let mut header = blank_header();
    let file_type = entry.file_type();
    if file_type.is_symlink() {
      let target = fs::read_link(path).map_err(|e| CarError::io("read link", path, e))?;
      let target = relative_link(&roots, rel, &target);
      let target_text = target
        .to_str()
        .ok_or_else(|| CarError::UnsafeEntry(format!("{name}: non-UTF-8 link target")))?;
      scanner.feed(target_text.as_bytes());

      header.set_entry_type(tar::EntryType::Symlink);
      header.set_mode(0o777);
      header.set_size(0);
      builder
        .append_link(&mut header, &name, &target)
        .map_err(|e| CarError::io("append", path, e))?;
      digest.entry(&name, KIND_SYMLINK, target_text.as_bytes());
    } else if file_type.is_dir() {
      header.set_entry_type(tar::EntryType::Directory);
      header.set_mode(0o755);
      header.set_size(0);
      builder
        .append_data(&mut header, &name, io::empty())
        .map_err(|e| CarError::io("append", path, e))?;
      digest.entry(&name, KIND_DIR, b"");
    } else if file_type.is_file() {
      let metadata = entry.metadata().map_err(|source| CarError::Walk {
        path: path.to_path_buf(),
        source,
      })?;
      let executable = metadata.permissions().mode() & 0o111 != 0;
      header.set_entry_type(tar::EntryType::Regular);
      header.set_mode(if executable { 0o755 } else { 0o644 });
      header.set_size(metadata.len());

      let file = File::open(path).map_err(|e| CarError::io("open", path, e))?;
      let mut reader = Inspect {
        inner: file,
        hasher: Sha256::new(),
        scanner: &mut scanner,
      };
      builder
        .append_data(&mut header, &name, &mut reader)
        .map_err(|e| CarError::io("append", path, e))?;
      let sum = hex::encode(reader.hasher.finalize());
      digest.entry(&name, if executable { KIND_EXECUTABLE } else { KIND_FILE }, sum.as_bytes());
    } else {
      warn!(path = ?path, "skipping special file");
      continue;
    }

    scanner.boundary();
    entries += 1;
  }

  let signer_id = signer.signer_id();
  info.signer = signer_id.clone();
  info.dependencies = scanner
    .finish()
    .into_iter()
    .map(|id| CarDependency {
      id,
      repo: info.repo.clone(),
      signer: signer_id.clone(),
    })
    .collect();

  let info_json = serde_json::to_vec_pretty(&info).map_err(CarError::InvalidInfo)?;
  digest.info(&info_json);
  let signature = signer.sign(&digest.finish());

  append_bytes(&mut builder, CAR_INFO_ENTRY, &info_json)?;
  append_bytes(&mut builder, CAR_SIGNATURE_ENTRY, &signature)?;

  let encoder = builder
    .into_inner()
    .map_err(|e| CarError::io("finish archive", dir, e))?;
  let bytes = encoder.finish().map_err(|e| CarError::io("compress", dir, e))?;
  let content_sum = hex::encode(Sha256::digest(&bytes));

  info!(
    id = %info.id,
    entries,
    dependencies = info.dependencies.len(),
    size = bytes.len(),
    "packed archive"
  );
  Ok(Packed {
    bytes,
    content_sum,
    info,
  })
}

fn blank_header() -> tar::Header {
  let mut header = tar::Header::new_gnu();
  header.set_uid(0);
  header.set_gid(0);
  header.set_mtime(0);
  header
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<(), CarError> {
  let mut header = blank_header();
  header.set_entry_type(tar::EntryType::Regular);
  header.set_mode(0o644);
  header.set_size(data.len() as u64);
  builder
    .append_data(&mut header, name, data)
    .map_err(|e| CarError::io("append", Path::new(name), e))
}

/// `dir` as given and canonicalized, for recognising absolute links into it.
fn link_roots(dir: &Path) -> Vec<PathBuf> {
  let mut roots = vec![dir.to_path_buf()];
  if let Ok(canonical) = dunce::canonicalize(dir)
    && canonical != dir
  {
    roots.push(canonical);
  }
  roots
}

/// Rewrites an absolute `target` under one of `roots` relative to the link at `rel`.
fn relative_link(roots: &[PathBuf], rel: &Path, target: &Path) -> PathBuf {
  if !target.is_absolute() {
    return target.to_path_buf();
  }
  let Some(inside) = roots.iter().find_map(|root| target.strip_prefix(root).ok()) else {
    return target.to_path_buf();
  };

  let depth = rel.parent().map(|p| p.components().count()).unwrap_or(0);
  let mut out = PathBuf::new();
  for _ in 0..depth {
    out.push("..");
  }
  out.push(inside);
  if out.as_os_str().is_empty() {
    out.push(".");
  }
  out
}

/// Archive name for a relative path: normal components joined by `/`.
fn entry_name(rel: &Path) -> Result<String, CarError> {
  let mut parts = Vec::new();
  for component in rel.components() {
    match component {
      Component::Normal(part) => parts.push(
        part
          .to_str()
          .ok_or_else(|| CarError::UnsafeEntry(rel.display().to_string()))?,
      ),
      Component::CurDir => {}
      _ => return Err(CarError::UnsafeEntry(rel.display().to_string())),
    }
  }
  if parts.is_empty() {
    return Err(CarError::UnsafeEntry(rel.display().to_string()));
  }
  Ok(parts.join("/"))
}

/// Extracts an archive into `dest` and verifies its signature.
///
/// On any failure every file, link and directory this call created is removed
/// before the error is returned.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<CarInfo, CarError> {
  let mut created = Vec::new();
  match extract(bytes, dest, &mut created) {
    Ok(info) => {
      info!(id = %info.id, entries = created.len(), dest = ?dest, "unpacked archive");
      Ok(info)
    }
    Err(err) => {
      warn!(dest = ?dest, error = %err, "archive rejected, removing extracted files");
      rollback(dest, &created);
      Err(err)
    }
  }
}

fn extract(bytes: &[u8], dest: &Path, created: &mut Vec<PathBuf>) -> Result<CarInfo, CarError> {
  if fs::symlink_metadata(dest).is_err() {
    fs::create_dir_all(dest).map_err(|e| CarError::io("create", dest, e))?;
    created.push(dest.to_path_buf());
  }

  let mut archive = tar::Archive::new(GzDecoder::new(bytes));
  let mut digest = EntryDigest::new();
  let mut info_json = None;
  let mut signature = None;

  let entries = archive.entries().map_err(|e| CarError::io("read archive", dest, e))?;
  for entry in entries {
    let mut entry = entry.map_err(|e| CarError::io("read archive", dest, e))?;
    let raw = entry.path().map_err(|e| CarError::io("read archive", dest, e))?.into_owned();
    let name = entry_name(&raw)?;

    if name == CAR_INFO_ENTRY {
      let json = read_entry(&mut entry, dest)?;
      digest.info(&json);
      info_json = Some(json);
      continue;
    }
    if name == CAR_SIGNATURE_ENTRY {
      signature = Some(read_entry(&mut entry, dest)?);
      continue;
    }

    let target = dest.join(&name);
    let entry_type = entry.header().entry_type();
    if entry_type.is_dir() {
      make_dirs(dest, &name, created)?;
      digest.entry(&name, KIND_DIR, b"");
    } else if entry_type.is_file() {
      make_dirs(dest, parent_name(&name), created)?;
      let mode = entry.header().mode().map_err(|e| CarError::io("read archive", &target, e))?;
      let executable = mode & 0o111 != 0;

      let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .map_err(|e| CarError::io("create", &target, e))?;
      created.push(target.clone());
      let sum = copy_hashed(&mut entry, &mut file, &target)?;
      let mode = if executable { 0o755 } else { 0o644 };
      fs::set_permissions(&target, fs::Permissions::from_mode(mode))
        .map_err(|e| CarError::io("chmod", &target, e))?;
      digest.entry(&name, if executable { KIND_EXECUTABLE } else { KIND_FILE }, sum.as_bytes());
    } else if entry_type.is_symlink() {
      let link = entry
        .link_name()
        .map_err(|e| CarError::io("read archive", &target, e))?
        .ok_or_else(|| CarError::UnsafeEntry(format!("{name}: symlink without target")))?
        .into_owned();
      let link_text = link
        .to_str()
        .ok_or_else(|| CarError::UnsafeEntry(format!("{name}: non-UTF-8 link target")))?
        .to_string();
      make_dirs(dest, parent_name(&name), created)?;
      std::os::unix::fs::symlink(&link, &target).map_err(|e| CarError::io("symlink", &target, e))?;
      created.push(target);
      digest.entry(&name, KIND_SYMLINK, link_text.as_bytes());
    } else {
      return Err(CarError::UnsupportedEntry(name));
    }
  }

  // Read to the end so the gzip trailer checksum is verified.
  io::copy(&mut archive.into_inner(), &mut io::sink()).map_err(|e| CarError::io("read archive", dest, e))?;

  let info_json = info_json.ok_or(CarError::MissingInfo)?;
  let info: CarInfo = serde_json::from_slice(&info_json).map_err(CarError::InvalidInfo)?;
  if info.signer.is_empty() {
    return Err(CarError::Unsigned);
  }
  let signature = signature.ok_or(CarError::MissingSignature)?;
  verify(&info.signer, &digest.finish(), &signature)?;

  debug!(id = %info.id, signer = %info.signer, "archive signature verified");
  Ok(info)
}

fn read_entry(entry: &mut impl Read, dest: &Path) -> Result<Vec<u8>, CarError> {
  let mut buf = Vec::new();
  entry
    .read_to_end(&mut buf)
    .map_err(|e| CarError::io("read archive", dest, e))?;
  Ok(buf)
}

fn copy_hashed(reader: &mut impl Read, file: &mut File, path: &Path) -> Result<String, CarError> {
  let mut hasher = Sha256::new();
  let mut buf = [0u8; 64 * 1024];
  loop {
    let n = reader.read(&mut buf).map_err(|e| CarError::io("read archive", path, e))?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
    file.write_all(&buf[..n]).map_err(|e| CarError::io("write", path, e))?;
  }
  Ok(hex::encode(hasher.finalize()))
}

fn parent_name(name: &str) -> &str {
  name.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Creates `rel` under `dest` one component at a time.
///
/// Components that already exist must be real directories, never symlinks.
fn make_dirs(dest: &Path, rel: &str, created: &mut Vec<PathBuf>) -> Result<(), CarError> {
  let mut path = dest.to_path_buf();
  for part in rel.split('/').filter(|p| !p.is_empty()) {
    path.push(part);
    match fs::symlink_metadata(&path) {
      Ok(m) if m.is_dir() => {}
      Ok(_) => return Err(CarError::UnsafeEntry(format!("{rel}: {part} is not a directory"))),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        fs::create_dir(&path).map_err(|e| CarError::io("create", &path, e))?;
        created.push(path.clone());
      }
      Err(e) => return Err(CarError::io("inspect", &path, e)),
    }
  }
  Ok(())
}

/// True if some directory between `dest` and `path` is a symlink.
fn linked_ancestor(dest: &Path, path: &Path) -> bool {
  let Ok(rel) = path.strip_prefix(dest) else { return true };
  let mut current = dest.to_path_buf();
  let mut parts = rel.components().peekable();
  while let Some(part) = parts.next() {
    if parts.peek().is_none() {
      break;
    }
    current.push(part);
    if fs::symlink_metadata(&current).is_ok_and(|m| m.file_type().is_symlink()) {
      return true;
    }
  }
  false
}

fn rollback(dest: &Path, created: &[PathBuf]) {
  for path in created.iter().rev() {
    if linked_ancestor(dest, path) {
      warn!(path = ?path, "not removing path behind a symlink");
      continue;
    }
    let result = match fs::symlink_metadata(path) {
      Ok(m) if m.is_dir() => fs::remove_dir_all(path),
      Ok(_) => fs::remove_file(path),
      Err(_) => continue,
    };
    if let Err(e) = result {
      warn!(path = ?path, error = %e, "failed to remove extracted path");
    }
  }
}
