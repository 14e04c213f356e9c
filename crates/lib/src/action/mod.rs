//! Build phase operations.
//!
//! A recipe phase is recorded once as a list of [`Op`]s and then handed to the
//! [`Executor`](crate::execute::Executor), which either hashes it (for the recipe
//! signature) or performs it (for a real build).
//!
//! [`PhaseBuilder`] is the recording context: the scripting layer and tests call
//! its methods in the order the phase body runs.
//!
//! # Example
//!
//! ```
//! use kiln_lib::action::{self, PhaseBuilder};
//!
//! let mut ctx = PhaseBuilder::new();
//! ctx.mkdir(format!("{}/bin", action::PREFIX));
//! ctx.chdir(action::BUILD, |ctx| {
//!   ctx.shell("make install");
//! });
//! let phase = ctx.finish();
//! assert_eq!(phase.ops.len(), 2);
//! ```

mod types;

pub use types::*;

use std::collections::BTreeMap;

/// Placeholder for the store directory being populated.
pub const PREFIX: &str = "$${prefix}";

/// Placeholder for the scratch build directory.
pub const BUILD: &str = "$${build}";

/// Placeholder for the recipe's own directory.
pub const TOP: &str = "$${top}";

/// Operation names available on a phase context.
pub const BUILTIN_OPS: &[&str] = &[
  "exec",
  "shell",
  "patch",
  "replace",
  "setenv",
  "append_env",
  "prepend_env",
  "symlink",
  "install",
  "mkdir",
  "write",
  "download",
  "unpack",
  "chdir",
];

/// Placeholder for the store directory of dependency `name`.
pub fn dep(name: &str) -> String {
  format!("$${{dep:{name}}}")
}

/// Placeholder for the materialized path of input `name`.
pub fn input(name: &str) -> String {
  format!("$${{input:{name}}}")
}

/// Records operations for a phase, including nested `chdir` blocks.
#[derive(Debug, Default)]
pub struct PhaseBuilder {
  ops: Vec<Op>,
  // Enclosing blocks while inside `begin_chdir`/`end_chdir`.
  stack: Vec<(String, Vec<Op>)>,
}

impl PhaseBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, op: Op) -> &mut Self {
    self.ops.push(op);
    self
  }

  pub fn exec<I, S>(&mut self, program: impl Into<String>, args: I) -> &mut Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.exec_with_env(program, args, BTreeMap::new())
  }

  pub fn exec_with_env<I, S>(&mut self, program: impl Into<String>, args: I, env: BTreeMap<String, String>) -> &mut Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.push(Op::Exec {
      program: program.into(),
      args: args.into_iter().map(Into::into).collect(),
      env,
    })
  }

  pub fn shell(&mut self, script: impl Into<String>) -> &mut Self {
    self.push(Op::Shell { script: script.into() })
  }

  pub fn patch(&mut self, file: impl Into<String>, strip: u32) -> &mut Self {
    self.push(Op::Patch {
      file: file.into(),
      strip,
    })
  }

  pub fn replace(&mut self, file: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
    self.push(Op::Replace {
      file: file.into(),
      from: from.into(),
      to: to.into(),
    })
  }

  pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.push(Op::SetEnv {
      key: key.into(),
      value: value.into(),
    })
  }

  pub fn append_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.push(Op::AppendEnv {
      key: key.into(),
      value: value.into(),
    })
  }

  pub fn prepend_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.push(Op::PrependEnv {
      key: key.into(),
      value: value.into(),
    })
  }

  pub fn symlink(&mut self, target: impl Into<String>, link: impl Into<String>) -> &mut Self {
    self.push(Op::Symlink {
      target: target.into(),
      link: link.into(),
    })
  }

  pub fn install(&mut self, src: impl Into<String>, dest: impl Into<String>) -> &mut Self {
    self.push(Op::Install {
      src: src.into(),
      dest: dest.into(),
      link: false,
    })
  }

  pub fn install_link(&mut self, src: impl Into<String>, dest: impl Into<String>) -> &mut Self {
    self.push(Op::Install {
      src: src.into(),
      dest: dest.into(),
      link: true,
    })
  }

  pub fn mkdir(&mut self, path: impl Into<String>) -> &mut Self {
    self.push(Op::Mkdir { path: path.into() })
  }

  pub fn write(&mut self, path: impl Into<String>, contents: impl Into<String>) -> &mut Self {
    self.push(Op::WriteFile {
      path: path.into(),
      contents: contents.into(),
      executable: false,
    })
  }

  pub fn write_executable(&mut self, path: impl Into<String>, contents: impl Into<String>) -> &mut Self {
    self.push(Op::WriteFile {
      path: path.into(),
      contents: contents.into(),
      executable: true,
    })
  }

  pub fn download(&mut self, url: impl Into<String>, dest: impl Into<String>, checksum: Checksum) -> &mut Self {
    self.push(Op::Download {
      url: url.into(),
      dest: dest.into(),
      checksum,
    })
  }

  pub fn unpack(&mut self, archive: impl Into<String>, dest: impl Into<String>, strip_components: u32) -> &mut Self {
    self.push(Op::Unpack {
      archive: archive.into(),
      dest: dest.into(),
      strip_components,
    })
  }

  /// Records `body` as a block run inside `dir`.
  pub fn chdir(&mut self, dir: impl Into<String>, body: impl FnOnce(&mut PhaseBuilder)) -> &mut Self {
    self.begin_chdir(dir);
    body(self);
    self.end_chdir();
    self
  }

  /// Opens a `chdir` block; operations recorded until [`end_chdir`](Self::end_chdir) land inside it.
  pub fn begin_chdir(&mut self, dir: impl Into<String>) {
    let outer = std::mem::take(&mut self.ops);
    self.stack.push((dir.into(), outer));
  }

  /// Closes the innermost `chdir` block. Does nothing outside a block.
  pub fn end_chdir(&mut self) {
    if let Some((dir, outer)) = self.stack.pop() {
      let body = std::mem::replace(&mut self.ops, outer);
      self.ops.push(Op::Chdir { dir, body });
    }
  }

  pub fn op_count(&self) -> usize {
    self.ops.len()
  }

  /// Closes any open blocks and returns the recorded phase.
  pub fn finish(mut self) -> Phase {
    while !self.stack.is_empty() {
      self.end_chdir();
    }
    Phase::new(self.ops)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn records_in_call_order() {
    let mut ctx = PhaseBuilder::new();
    ctx.mkdir("a").shell("echo hi").write("f", "x");
    let phase = ctx.finish();
    let names: Vec<_> = phase.ops.iter().map(Op::name).collect();
    assert_eq!(names, ["mkdir", "shell", "write"]);
  }

  #[test]
  fn chdir_nests_body() {
    let mut ctx = PhaseBuilder::new();
    ctx.mkdir("out");
    ctx.chdir("src", |ctx| {
      ctx.shell("make");
      ctx.chdir("sub", |ctx| {
        ctx.shell("make -C sub");
      });
    });
    ctx.mkdir("after");
    let phase = ctx.finish();

    assert_eq!(phase.ops.len(), 3);
    match &phase.ops[1] {
      Op::Chdir { dir, body } => {
        assert_eq!(dir, "src");
        assert_eq!(body.len(), 2);
        assert!(matches!(&body[1], Op::Chdir { dir, body } if dir == "sub" && body.len() == 1));
      }
      other => panic!("expected chdir, got {other:?}"),
    }
  }

  #[test]
  fn finish_closes_open_blocks() {
    let mut ctx = PhaseBuilder::new();
    ctx.begin_chdir("src");
    ctx.shell("make");
    let phase = ctx.finish();
    assert!(matches!(&phase.ops[0], Op::Chdir { body, .. } if body.len() == 1));
  }

  #[test]
  fn placeholder_helpers() {
    assert_eq!(dep("zlib"), "$${dep:zlib}");
    assert_eq!(input("src"), "$${input:src}");
  }
}
