//! Placeholder parsing and substitution for build operation arguments.
//!
//! Recipe phases are recorded before any directory exists, so operation arguments
//! carry placeholders that the executor resolves at run time (or, in hash mode,
//! against stable tokens that never mention a real path).
//!
//! # Placeholder Formats
//!
//! - `$${prefix}` - the store directory being populated
//! - `$${build}` - the scratch build directory
//! - `$${top}` - the directory the recipe was loaded from
//! - `$${dep:NAME}` - the store directory of dependency `NAME`
//! - `$${input:NAME}` - the materialized path of input `NAME`
//!
//! Single `$` characters pass through unchanged, so shell variables like `$HOME`
//! work without escaping. `$$${` produces a literal `$${`.
//!
//! # Example
//!
//! ```
//! use kiln_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("$${prefix}/bin:$PATH").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Prefix),
//!     Segment::Literal("/bin:$PATH".to_string()),
//! ]);
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Prefix,
  Build,
  Top,
  Dep(String),
  Input(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unknown dependency '{0}'")]
  UnresolvedDep(String),

  #[error("unknown input '{0}'")]
  UnresolvedInput(String),
}

/// Supplies placeholder values during execution.
pub trait Resolver {
  fn resolve_prefix(&self) -> Result<&str, PlaceholderError>;

  fn resolve_build(&self) -> Result<&str, PlaceholderError>;

  fn resolve_top(&self) -> Result<&str, PlaceholderError>;

  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError>;

  fn resolve_input(&self, name: &str) -> Result<&str, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    if !matches!(chars.peek(), Some((_, '$'))) {
      // Lone `$`: shell variable.
      literal.push('$');
      continue;
    }
    chars.next();

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if matches!(chars.peek(), Some((_, '{'))) {
          chars.next();
          literal.push_str("$${");
        } else {
          literal.push_str("$$$");
        }
      }
      Some((_, '{')) => {
        chars.next();

        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let mut content = String::new();
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            closed = true;
            break;
          }
          content.push(c);
        }

        if !closed {
          return Err(PlaceholderError::Unclosed(pos));
        }

        segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
      }
      _ => literal.push_str("$$"),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content {
    "prefix" => return Ok(Placeholder::Prefix),
    "build" => return Ok(Placeholder::Build),
    "top" => return Ok(Placeholder::Top),
    _ => {}
  }

  let (kind, name) = content
    .split_once(':')
    .ok_or_else(|| PlaceholderError::Malformed(format!("missing colon in '{content}'")))?;

  if name.is_empty() {
    return Err(PlaceholderError::Malformed(format!("empty name in '{content}'")));
  }

  match kind {
    "dep" => Ok(Placeholder::Dep(name.to_string())),
    "input" => Ok(Placeholder::Input(name.to_string())),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => {
        let value = match p {
          Placeholder::Prefix => resolver.resolve_prefix()?,
          Placeholder::Build => resolver.resolve_build()?,
          Placeholder::Top => resolver.resolve_top()?,
          Placeholder::Dep(name) => resolver.resolve_dep(name)?,
          Placeholder::Input(name) => resolver.resolve_input(name)?,
        };
        result.push_str(value);
      }
    }
  }

  Ok(result)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  struct TestResolver {
    prefix: String,
    deps: HashMap<String, String>,
    inputs: HashMap<String, String>,
  }

  impl TestResolver {
    fn new() -> Self {
      Self {
        prefix: "/kiln/store/sigZ-app-1.0".to_string(),
        deps: HashMap::new(),
        inputs: HashMap::new(),
      }
    }

    fn with_dep(mut self, name: &str, path: &str) -> Self {
      self.deps.insert(name.to_string(), path.to_string());
      self
    }

    fn with_input(mut self, name: &str, path: &str) -> Self {
      self.inputs.insert(name.to_string(), path.to_string());
      self
    }
  }

  impl Resolver for TestResolver {
    fn resolve_prefix(&self) -> Result<&str, PlaceholderError> {
      Ok(&self.prefix)
    }

    fn resolve_build(&self) -> Result<&str, PlaceholderError> {
      Ok("/tmp/build")
    }

    fn resolve_top(&self) -> Result<&str, PlaceholderError> {
      Ok("/recipes/app")
    }

    fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError> {
      self
        .deps
        .get(name)
        .map(|s| s.as_str())
        .ok_or_else(|| PlaceholderError::UnresolvedDep(name.to_string()))
    }

    fn resolve_input(&self, name: &str) -> Result<&str, PlaceholderError> {
      self
        .inputs
        .get(name)
        .map(|s| s.as_str())
        .ok_or_else(|| PlaceholderError::UnresolvedInput(name.to_string()))
    }
  }

  #[test]
  fn configure_line_with_dependency() {
    let resolver = TestResolver::new().with_dep("zlib", "/kiln/store/sigA-zlib-1.3");

    let cmd = "./configure --prefix=$${prefix} --with-zlib=$${dep:zlib}";
    let result = substitute(cmd, &resolver).unwrap();

    assert_eq!(
      result,
      "./configure --prefix=/kiln/store/sigZ-app-1.0 --with-zlib=/kiln/store/sigA-zlib-1.3"
    );
  }

  #[test]
  fn unpack_input_into_build_dir() {
    let resolver = TestResolver::new().with_input("src", "/tmp/build/app-1.0.tar.gz");
    let result = substitute("tar xf $${input:src} -C $${build}", &resolver).unwrap();
    assert_eq!(result, "tar xf /tmp/build/app-1.0.tar.gz -C /tmp/build");
  }

  #[test]
  fn shell_variables_pass_through() {
    let resolver = TestResolver::new();
    let script = r#"if [ -z "$1" ]; then exit 1; fi
$${prefix}/bin/app "$1"
exit $?"#;
    let result = substitute(script, &resolver).unwrap();
    assert_eq!(
      result,
      r#"if [ -z "$1" ]; then exit 1; fi
/kiln/store/sigZ-app-1.0/bin/app "$1"
exit $?"#
    );
  }

  #[test]
  fn patch_relative_to_top() {
    let resolver = TestResolver::new();
    let result = substitute("$${top}/fix-build.patch", &resolver).unwrap();
    assert_eq!(result, "/recipes/app/fix-build.patch");
  }

  #[test]
  fn adjacent_placeholders_no_separator() {
    let resolver = TestResolver::new();
    assert_eq!(substitute("$${build}$${top}", &resolver).unwrap(), "/tmp/build/recipes/app");
  }

  #[test]
  fn lone_and_double_dollars_preserved() {
    let resolver = TestResolver::new();
    assert_eq!(substitute("costs $5 or more$", &resolver).unwrap(), "costs $5 or more$");
    assert_eq!(substitute("echo $$pid", &resolver).unwrap(), "echo $$pid");
  }

  #[test]
  fn escape_placeholder_syntax() {
    let resolver = TestResolver::new();
    assert_eq!(substitute("echo $$${prefix}", &resolver).unwrap(), "echo $${prefix}");
  }

  #[test]
  fn empty_input() {
    assert!(parse("").unwrap().is_empty());
  }

  #[test]
  fn error_unclosed_placeholder() {
    assert!(matches!(parse("cp $${prefix"), Err(PlaceholderError::Unclosed(3))));
  }

  #[test]
  fn error_unknown_placeholder_type() {
    let result = parse("$${action:0}");
    assert!(matches!(result, Err(PlaceholderError::UnknownType(ref s)) if s == "action"));
  }

  #[test]
  fn error_missing_name() {
    assert!(matches!(parse("$${dep:}"), Err(PlaceholderError::Malformed(_))));
    assert!(matches!(parse("$${out}"), Err(PlaceholderError::Malformed(_))));
  }

  #[test]
  fn error_unresolved_dep() {
    let resolver = TestResolver::new();
    let result = substitute("$${dep:openssl}/lib", &resolver);
    assert!(matches!(result, Err(PlaceholderError::UnresolvedDep(ref n)) if n == "openssl"));
  }

  #[test]
  fn error_unresolved_input() {
    let resolver = TestResolver::new();
    let result = substitute("$${input:src}", &resolver);
    assert!(matches!(result, Err(PlaceholderError::UnresolvedInput(ref n)) if n == "src"));
  }
}
