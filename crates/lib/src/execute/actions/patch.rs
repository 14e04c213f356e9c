//! `patch` operation: apply a unified diff to the working directory.
//!
//! Supports what `diff -u` and `git diff` produce: multiple files per patch,
//! `/dev/null` for created and deleted files, `\ No newline at end of file` markers
//! and hunks that drifted a few lines from their recorded position.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::execute::types::ExecuteError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
  Context(String),
  Remove(String),
  Add(String),
}

#[derive(Debug, Default)]
struct Hunk {
  old_start: usize,
  old_count: usize,
  lines: Vec<Line>,
  old_missing_newline: bool,
  new_missing_newline: bool,
}

impl Hunk {
  fn old_lines(&self) -> Vec<&str> {
    self
      .lines
      .iter()
      .filter_map(|l| match l {
        Line::Context(s) | Line::Remove(s) => Some(s.as_str()),
        Line::Add(_) => None,
      })
      .collect()
  }

  fn new_lines(&self) -> Vec<String> {
    self
      .lines
      .iter()
      .filter_map(|l| match l {
        Line::Context(s) | Line::Add(s) => Some(s.clone()),
        Line::Remove(_) => None,
      })
      .collect()
  }
}

#[derive(Debug)]
struct FilePatch {
  old: Option<String>,
  new: Option<String>,
  hunks: Vec<Hunk>,
}

/// Applies the patch in `patch_file` relative to `root`, stripping `strip` leading
/// path components from every file name.
pub fn apply_patch_file(patch_file: &Path, root: &Path, strip: u32) -> Result<(), ExecuteError> {
  let text = std::fs::read_to_string(patch_file).map_err(|e| ExecuteError::io("read", patch_file, e))?;
  info!(patch = ?patch_file, strip, "applying patch");
  apply_patch(&text, root, strip).map_err(|message| ExecuteError::PatchFailed {
    file: patch_file.to_path_buf(),
    message,
  })
}

fn apply_patch(text: &str, root: &Path, strip: u32) -> Result<(), String> {
  let files = parse(text)?;
  if files.is_empty() {
    return Err("no file changes found".to_string());
  }

  for file in files {
    let name = file
      .new
      .as_deref()
      .or(file.old.as_deref())
      .ok_or_else(|| "patch names neither an old nor a new file".to_string())?;
    let target = root.join(strip_path(name, strip)?);
    debug!(file = ?target, hunks = file.hunks.len(), "patching file");

    let original = match &file.old {
      None => String::new(),
      Some(_) => std::fs::read_to_string(&target).map_err(|e| format!("{}: {e}", target.display()))?,
    };

    let patched = apply_hunks(&original, &file.hunks).map_err(|e| format!("{}: {e}", target.display()))?;

    if file.new.is_none() {
      std::fs::remove_file(&target).map_err(|e| format!("{}: {e}", target.display()))?;
      continue;
    }
    if let Some(parent) = target.parent() {
      std::fs::create_dir_all(parent).map_err(|e| format!("{}: {e}", parent.display()))?;
    }
    std::fs::write(&target, patched).map_err(|e| format!("{}: {e}", target.display()))?;
  }
  Ok(())
}

fn strip_path(name: &str, strip: u32) -> Result<PathBuf, String> {
  let path: PathBuf = Path::new(name).components().skip(strip as usize).collect();
  if path.as_os_str().is_empty() {
    return Err(format!("cannot strip {strip} components from '{name}'"));
  }
  if path
    .components()
    .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
  {
    return Err(format!("refusing to patch '{name}' outside the working directory"));
  }
  Ok(path)
}

fn header_path(rest: &str) -> Option<String> {
  let name = rest.split('\t').next().unwrap_or(rest).trim();
  (name != "/dev/null").then(|| name.to_string())
}

fn parse(text: &str) -> Result<Vec<FilePatch>, String> {
  let lines: Vec<&str> = text.lines().collect();
  let mut files: Vec<FilePatch> = Vec::new();
  let mut i = 0;

  while i < lines.len() {
    let line = lines[i];
    if let Some(old) = line.strip_prefix("--- ")
      && let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ "))
    {
      files.push(FilePatch {
        old: header_path(old),
        new: header_path(new),
        hunks: Vec::new(),
      });
      i += 2;
      continue;
    }

    if line.starts_with("@@ ") {
      let file = files
        .last_mut()
        .ok_or_else(|| format!("line {}: hunk before file header", i + 1))?;
      let (hunk, next) = parse_hunk(&lines, i)?;
      file.hunks.push(hunk);
      i = next;
      continue;
    }

    i += 1;
  }

  Ok(files)
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
  match range.split_once(',') {
    Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
    None => Some((range.parse().ok()?, 1)),
  }
}

fn parse_hunk(lines: &[&str], start: usize) -> Result<(Hunk, usize), String> {
  let header = lines[start];
  let bad = || format!("line {}: malformed hunk header '{header}'", start + 1);

  let mut parts = header.split_whitespace().skip(1);
  let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(bad)?;
  let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(bad)?;
  let (old_start, old_count) = parse_range(old).ok_or_else(bad)?;
  let (_, new_count) = parse_range(new).ok_or_else(bad)?;

  let mut hunk = Hunk {
    old_start,
    old_count,
    ..Hunk::default()
  };
  let (mut old_left, mut new_left) = (old_count, new_count);
  let mut i = start + 1;

  while old_left > 0 || new_left > 0 {
    let line = lines
      .get(i)
      .ok_or_else(|| format!("hunk at line {} is truncated", start + 1))?;
    match line.as_bytes().first() {
      Some(b' ') | None => {
        hunk.lines.push(Line::Context(line.get(1..).unwrap_or_default().to_string()));
        old_left = old_left.saturating_sub(1);
        new_left = new_left.saturating_sub(1);
      }
      Some(b'-') => {
        hunk.lines.push(Line::Remove(line[1..].to_string()));
        old_left = old_left.saturating_sub(1);
      }
      Some(b'+') => {
        hunk.lines.push(Line::Add(line[1..].to_string()));
        new_left = new_left.saturating_sub(1);
      }
      Some(b'\\') => mark_missing_newline(&mut hunk),
      Some(_) => return Err(format!("line {}: unexpected line in hunk", i + 1)),
    }
    i += 1;
  }

  while let Some(line) = lines.get(i)
    && line.starts_with('\\')
  {
    mark_missing_newline(&mut hunk);
    i += 1;
  }

  Ok((hunk, i))
}

fn mark_missing_newline(hunk: &mut Hunk) {
  match hunk.lines.last() {
    Some(Line::Remove(_)) => hunk.old_missing_newline = true,
    Some(Line::Add(_)) => hunk.new_missing_newline = true,
    Some(Line::Context(_)) => {
      hunk.old_missing_newline = true;
      hunk.new_missing_newline = true;
    }
    None => {}
  }
}

fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, String> {
  let mut trailing_newline = original.is_empty() || original.ends_with('\n');
  let body = original.strip_suffix('\n').unwrap_or(original);
  let mut lines: Vec<String> = if original.is_empty() {
    Vec::new()
  } else {
    body.split('\n').map(str::to_string).collect()
  };

  let mut shift: isize = 0;
  let mut floor = 0usize;

  for (n, hunk) in hunks.iter().enumerate() {
    let old = hunk.old_lines();
    let new = hunk.new_lines();

    let recorded = if hunk.old_count == 0 {
      hunk.old_start
    } else {
      hunk.old_start.saturating_sub(1)
    };
    let expected = (recorded as isize + shift).max(floor as isize) as usize;

    let at = find_match(&lines, &old, expected, floor).ok_or_else(|| format!("hunk #{} does not apply", n + 1))?;
    if at != expected {
      debug!(hunk = n + 1, offset = at as isize - expected as isize, "hunk applied with offset");
    }

    let new_len = new.len();
    lines.splice(at..at + old.len(), new);
    shift = at as isize - recorded as isize + new_len as isize - old.len() as isize;
    floor = at + new_len;

    if hunk.new_missing_newline {
      trailing_newline = false;
    } else if hunk.old_missing_newline {
      trailing_newline = true;
    }
  }

  let mut out = lines.join("\n");
  if trailing_newline && !lines.is_empty() {
    out.push('\n');
  }
  Ok(out)
}

/// Finds `needle` in `lines` at or after `floor`, searching outward from `expected`.
fn find_match(lines: &[String], needle: &[&str], expected: usize, floor: usize) -> Option<usize> {
  let fits = |at: usize| {
    at >= floor
      && at + needle.len() <= lines.len()
      && lines[at..at + needle.len()].iter().zip(needle).all(|(a, b)| a == b)
  };

  let limit = lines.len().max(expected) + 1;
  for distance in 0..limit {
    if fits(expected + distance) {
      return Some(expected + distance);
    }
    if distance > 0 && distance <= expected && fits(expected - distance) {
      return Some(expected - distance);
    }
  }
  None
}
