//! Store reference scanning.
//!
//! Finds `<store-prefix>/<id>` occurrences in arbitrary bytes. The scanner is a
//! streaming state machine: feed it chunks in order and matches that straddle chunk
//! boundaries are still found.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use walkdir::WalkDir;

use crate::util::hash::{PackageId, is_id_byte};

/// Longest run of ID bytes considered; longer runs are not IDs.
const MAX_ID_LEN: usize = 255;

#[derive(Debug)]
pub struct RefScanner {
  pattern: Vec<u8>,
  /// KMP failure table for `pattern`.
  fallback: Vec<usize>,
  matched: usize,
  capture: Option<Vec<u8>>,
  exclude: Option<PackageId>,
  found: BTreeSet<PackageId>,
}

impl RefScanner {
  /// Scanner for references under `store_prefix` (without trailing slash).
  pub fn new(store_prefix: &str) -> Self {
    let mut pattern = store_prefix.trim_end_matches('/').as_bytes().to_vec();
    pattern.push(b'/');
    let fallback = failure_table(&pattern);
    Self {
      pattern,
      fallback,
      matched: 0,
      capture: None,
      exclude: None,
      found: BTreeSet::new(),
    }
  }

  /// Never report `id` (a package's references to itself).
  pub fn excluding(mut self, id: PackageId) -> Self {
    self.exclude = Some(id);
    self
  }

  pub fn feed(&mut self, bytes: &[u8]) {
    for &b in bytes {
      if let Some(capture) = self.capture.as_mut() {
        if is_id_byte(b) && capture.len() < MAX_ID_LEN {
          capture.push(b);
          continue;
        }
        self.end_capture();
      }
      self.advance(b);
    }
  }

  /// Ends the current input; a match never spans two inputs.
  pub fn boundary(&mut self) {
    self.end_capture();
    self.matched = 0;
  }

  /// Flushes a reference that ends at the end of input and returns everything found.
  pub fn finish(mut self) -> BTreeSet<PackageId> {
    self.end_capture();
    self.found
  }

  fn advance(&mut self, b: u8) {
    while self.matched > 0 && self.pattern[self.matched] != b {
      self.matched = self.fallback[self.matched - 1];
    }
    if self.pattern[self.matched] == b {
      self.matched += 1;
    }
    if self.matched == self.pattern.len() {
      self.matched = 0;
      self.capture = Some(Vec::new());
    }
  }

  fn end_capture(&mut self) {
    let Some(capture) = self.capture.take() else { return };
    let Ok(text) = String::from_utf8(capture) else { return };
    if let Ok(id) = PackageId::parse(&text)
      && self.exclude.as_ref() != Some(&id)
    {
      self.found.insert(id);
    }
  }
}

/// References under `prefix` in every file and link target below `dir`.
pub fn scan_tree(dir: &Path, prefix: &Path, exclude: Option<&PackageId>) -> io::Result<BTreeSet<PackageId>> {
  let mut scanner = RefScanner::new(&prefix.display().to_string());
  if let Some(id) = exclude {
    scanner = scanner.excluding(id.clone());
  }

  let mut buf = vec![0u8; 64 * 1024];
  for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    if entry.path_is_symlink() {
      let target = std::fs::read_link(entry.path())?;
      scanner.feed(target.as_os_str().as_encoded_bytes());
    } else if entry.file_type().is_file() {
      let mut file = File::open(entry.path())?;
      loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
          break;
        }
        scanner.feed(&buf[..n]);
      }
    }
    scanner.boundary();
  }
  Ok(scanner.finish())
}

fn failure_table(pattern: &[u8]) -> Vec<usize> {
  let mut table = vec![0; pattern.len()];
  let mut k = 0;
  for i in 1..pattern.len() {
    while k > 0 && pattern[i] != pattern[k] {
      k = table[k - 1];
    }
    if pattern[i] == pattern[k] {
      k += 1;
    }
    table[i] = k;
  }
  table
}
