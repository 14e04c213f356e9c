//! Dual-mode phase executor.
//!
//! The same [`Executor`] walks a recorded [`Phase`] in one of two modes:
//!
//! - [`Mode::Hash`]: every operation writes its name and fully resolved, quoted
//!   arguments into a [`HashSink`] and touches nothing. The recipe signature uses
//!   this to fingerprint a phase.
//! - [`Mode::Run`]: operations perform real filesystem and process side effects.
//!
//! Operations run in order and the first failure aborts the phase. `chdir` blocks
//! restore the previous working directory on exit, including when the body fails.
//! Cancellation is checked before each operation in run mode and is propagated
//! into running subprocesses.

pub mod actions;
pub mod types;

pub use types::ExecuteError;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::action::{Op, Phase};
use crate::consts::{BASE_BUILD_PATH, SOURCE_DATE_EPOCH};
use crate::placeholder::{self, PlaceholderError, Resolver};
use crate::util::hash::Digest32;

/// Accumulates the canonical encoding of executed operations.
#[derive(Debug, Clone, Default)]
pub struct HashSink {
  hasher: Sha256,
  ops: usize,
}

impl HashSink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Writes `name`, then each argument shell-quoted and NUL-terminated.
  pub fn record(&mut self, name: &str, args: &[String]) {
    self.hasher.update(name.as_bytes());
    self.hasher.update([0u8]);
    for arg in args {
      self.hasher.update(shell_quote(arg).as_bytes());
      self.hasher.update([0u8]);
    }
    self.hasher.update(b"\n");
    self.ops += 1;
  }

  pub fn op_count(&self) -> usize {
    self.ops
  }

  pub fn finish(self) -> Digest32 {
    self.hasher.finalize().into()
  }
}

/// Quotes `arg` for a POSIX shell. Safe words are returned unchanged.
pub fn shell_quote(arg: &str) -> String {
  let safe = !arg.is_empty()
    && arg
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b"-_./:=+,@%".contains(&b));
  if safe {
    arg.to_string()
  } else {
    format!("'{}'", arg.replace('\'', r"'\''"))
  }
}

/// Quotes and space-joins a list of words.
pub fn shell_join<'a>(words: impl IntoIterator<Item = &'a String>) -> String {
  words.into_iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ")
}

/// Run-mode state shared by every operation in a phase.
#[derive(Debug, Clone, Default)]
pub struct RunState {
  pub cancel: CancellationToken,
  /// Overrides `/bin/sh` for `shell` operations.
  pub shell: Option<String>,
}

pub enum Mode {
  Hash(HashSink),
  Run(RunState),
}

/// Mutable execution context: directories, environment and placeholder values.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
  pub cwd: PathBuf,
  pub prefix: String,
  pub build: String,
  pub top: String,
  pub env: BTreeMap<String, String>,
  /// Dependency name to store path (run mode) or package ID (hash mode).
  pub deps: BTreeMap<String, String>,
  /// Input name to materialized path (run mode) or identity string (hash mode).
  pub inputs: BTreeMap<String, String>,
}

impl ExecContext {
  /// Context with location-independent tokens, used for hashing.
  pub fn canonical() -> Self {
    Self {
      cwd: PathBuf::from("/@build@"),
      prefix: "/@prefix@".to_string(),
      build: "/@build@".to_string(),
      top: "/@top@".to_string(),
      ..Self::default()
    }
  }

  /// Context for a real build writing into `prefix`, starting in `build`.
  ///
  /// The environment starts isolated: `HOME`, temp directories, locale,
  /// `SOURCE_DATE_EPOCH`, `prefix`/`out` and a `PATH` made of dependency `bin/`
  /// directories followed by the base system path.
  pub fn for_build(prefix: &Path, build: &Path, top: &Path) -> Self {
    let prefix_str = prefix.display().to_string();
    let tmp = build.join("tmp").display().to_string();
    let env = BTreeMap::from([
      ("HOME".to_string(), "/homeless-shelter".to_string()),
      ("TMPDIR".to_string(), tmp.clone()),
      ("TMP".to_string(), tmp.clone()),
      ("TEMP".to_string(), tmp),
      ("LANG".to_string(), "C".to_string()),
      ("LC_ALL".to_string(), "C".to_string()),
      ("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string()),
      ("prefix".to_string(), prefix_str.clone()),
      ("out".to_string(), prefix_str.clone()),
      ("PATH".to_string(), BASE_BUILD_PATH.to_string()),
    ]);
    Self {
      cwd: build.to_path_buf(),
      prefix: prefix_str,
      build: build.display().to_string(),
      top: top.display().to_string(),
      env,
      ..Self::default()
    }
  }

  /// Registers a dependency; in run mode its `bin/` is put on `PATH`.
  pub fn with_dep(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
    let location = location.into();
    if let Some(path) = self.env.get_mut("PATH") {
      let bin = Path::new(&location).join("bin").display().to_string();
      *path = prepend_path(path, &bin);
    }
    self.deps.insert(name.into(), location);
    self
  }

  pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.inputs.insert(name.into(), value.into());
    self
  }

  /// Resolves `path` against the current working directory.
  pub fn abs(&self, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { self.cwd.join(p) }
  }

  fn expand(&self, text: &str) -> Result<String, PlaceholderError> {
    placeholder::substitute(text, self)
  }
}

impl Resolver for ExecContext {
  fn resolve_prefix(&self) -> Result<&str, PlaceholderError> {
    Ok(&self.prefix)
  }

  fn resolve_build(&self) -> Result<&str, PlaceholderError> {
    Ok(&self.build)
  }

  fn resolve_top(&self) -> Result<&str, PlaceholderError> {
    Ok(&self.top)
  }

  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .deps
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedDep(name.to_string()))
  }

  fn resolve_input(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .inputs
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedInput(name.to_string()))
  }
}

fn prepend_path(current: &str, entry: &str) -> String {
  if current.is_empty() {
    entry.to_string()
  } else {
    format!("{entry}:{current}")
  }
}

fn append_path(current: &str, entry: &str) -> String {
  if current.is_empty() {
    entry.to_string()
  } else {
    format!("{current}:{entry}")
  }
}

/// Interprets phases in hash or run mode.
pub struct Executor {
  mode: Mode,
  ctx: ExecContext,
}

impl Executor {
  pub fn hashing(ctx: ExecContext) -> Self {
    Self {
      mode: Mode::Hash(HashSink::new()),
      ctx,
    }
  }

  pub fn running(ctx: ExecContext, state: RunState) -> Self {
    Self {
      mode: Mode::Run(state),
      ctx,
    }
  }

  pub fn context(&self) -> &ExecContext {
    &self.ctx
  }

  pub fn is_hashing(&self) -> bool {
    matches!(self.mode, Mode::Hash(_))
  }

  /// Runs every operation of `phase` in order.
  pub async fn execute(&mut self, phase: &Phase) -> Result<(), ExecuteError> {
    self.run_ops(&phase.ops).await
  }

  /// Digest of everything hashed so far; `None` in run mode.
  pub fn finish(self) -> Option<Digest32> {
    match self.mode {
      Mode::Hash(sink) => Some(sink.finish()),
      Mode::Run(_) => None,
    }
  }

  fn run_ops<'a>(&'a mut self, ops: &'a [Op]) -> BoxFuture<'a, Result<(), ExecuteError>> {
    Box::pin(async move {
      for op in ops {
        self.step(op).await?;
      }
      Ok(())
    })
  }

  async fn step(&mut self, op: &Op) -> Result<(), ExecuteError> {
    if let Mode::Run(state) = &self.mode
      && state.cancel.is_cancelled()
    {
      return Err(ExecuteError::Cancelled);
    }

    if let Op::Chdir { dir, body } = op {
      return self.chdir(dir, body).await;
    }

    let resolved = self.resolve(op)?;
    match &mut self.mode {
      Mode::Hash(sink) => {
        let args = canonical_args(&resolved);
        trace!(op = resolved.name(), ?args, "hashing operation");
        sink.record(resolved.name(), &args);
        Ok(())
      }
      Mode::Run(state) => {
        debug!(op = resolved.name(), cwd = ?self.ctx.cwd, "running operation");
        match resolved {
          Op::SetEnv { key, value } => {
            self.ctx.env.insert(key, value);
            Ok(())
          }
          Op::AppendEnv { key, value } => {
            let entry = self.ctx.env.entry(key).or_default();
            *entry = append_path(entry, &value);
            Ok(())
          }
          Op::PrependEnv { key, value } => {
            let entry = self.ctx.env.entry(key).or_default();
            *entry = prepend_path(entry, &value);
            Ok(())
          }
          other => actions::run(&other, &self.ctx, state).await,
        }
      }
    }
  }

  async fn chdir(&mut self, dir: &str, body: &[Op]) -> Result<(), ExecuteError> {
    let dir = self.ctx.expand(dir)?;

    if let Mode::Hash(sink) = &mut self.mode {
      sink.record("chdir", std::slice::from_ref(&dir));
      self.run_ops(body).await?;
      if let Mode::Hash(sink) = &mut self.mode {
        sink.record("popd", &[]);
      }
      return Ok(());
    }

    let target = self.ctx.abs(&dir);
    if !target.is_dir() {
      return Err(ExecuteError::NotADirectory(target));
    }

    let saved = std::mem::replace(&mut self.ctx.cwd, target);
    let result = self.run_ops(body).await;
    self.ctx.cwd = saved;
    result
  }

  /// Substitutes placeholders in every string argument of `op`.
  fn resolve(&self, op: &Op) -> Result<Op, ExecuteError> {
    let ctx = &self.ctx;
    let x = |s: &String| ctx.expand(s);
    let resolved = match op {
      Op::Exec { program, args, env } => Op::Exec {
        program: x(program)?,
        args: args.iter().map(x).collect::<Result<_, _>>()?,
        env: env
          .iter()
          .map(|(k, v)| -> Result<(String, String), PlaceholderError> { Ok((k.clone(), x(v)?)) })
          .collect::<Result<_, _>>()?,
      },
      Op::Shell { script } => Op::Shell { script: x(script)? },
      Op::Patch { file, strip } => Op::Patch {
        file: x(file)?,
        strip: *strip,
      },
      Op::Replace { file, from, to } => Op::Replace {
        file: x(file)?,
        from: x(from)?,
        to: x(to)?,
      },
      Op::SetEnv { key, value } => Op::SetEnv {
        key: key.clone(),
        value: x(value)?,
      },
      Op::AppendEnv { key, value } => Op::AppendEnv {
        key: key.clone(),
        value: x(value)?,
      },
      Op::PrependEnv { key, value } => Op::PrependEnv {
        key: key.clone(),
        value: x(value)?,
      },
      Op::Symlink { target, link } => Op::Symlink {
        target: x(target)?,
        link: x(link)?,
      },
      Op::Install { src, dest, link } => Op::Install {
        src: x(src)?,
        dest: x(dest)?,
        link: *link,
      },
      Op::Mkdir { path } => Op::Mkdir { path: x(path)? },
      Op::WriteFile {
        path,
        contents,
        executable,
      } => Op::WriteFile {
        path: x(path)?,
        contents: x(contents)?,
        executable: *executable,
      },
      Op::Download { url, dest, checksum } => Op::Download {
        url: x(url)?,
        dest: x(dest)?,
        checksum: checksum.clone(),
      },
      Op::Unpack {
        archive,
        dest,
        strip_components,
      } => Op::Unpack {
        archive: x(archive)?,
        dest: x(dest)?,
        strip_components: *strip_components,
      },
      Op::Chdir { dir, body } => Op::Chdir {
        dir: x(dir)?,
        body: body.clone(),
      },
    };
    Ok(resolved)
  }
}

/// Hashes a phase against `ctx` without touching the filesystem.
pub fn hash_phase(phase: &Phase, ctx: ExecContext) -> Result<Digest32, ExecuteError> {
  let mut executor = Executor::hashing(ctx);
  futures::executor::block_on(executor.execute(phase))?;
  executor
    .finish()
    .ok_or_else(|| ExecuteError::Task("hash sink missing".to_string()))
}

/// The argument list recorded for `op` in hash mode.
///
/// Variable-length lists collapse into one shell-joined word so that list
/// boundaries stay unambiguous.
fn canonical_args(op: &Op) -> Vec<String> {
  match op {
    Op::Exec { program, args, env } => {
      let env_words: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
      vec![program.clone(), shell_join(args), shell_join(&env_words)]
    }
    Op::Shell { script } => vec![script.clone()],
    Op::Patch { file, strip } => vec![file.clone(), strip.to_string()],
    Op::Replace { file, from, to } => vec![file.clone(), from.clone(), to.clone()],
    Op::SetEnv { key, value } | Op::AppendEnv { key, value } | Op::PrependEnv { key, value } => {
      vec![key.clone(), value.clone()]
    }
    Op::Symlink { target, link } => vec![target.clone(), link.clone()],
    Op::Install { src, dest, link } => vec![src.clone(), dest.clone(), link.to_string()],
    Op::Mkdir { path } => vec![path.clone()],
    Op::WriteFile {
      path,
      contents,
      executable,
    } => vec![path.clone(), contents.clone(), executable.to_string()],
    Op::Download { url, dest, checksum } => vec![url.clone(), dest.clone(), checksum.to_string()],
    Op::Unpack {
      archive,
      dest,
      strip_components,
    } => vec![archive.clone(), dest.clone(), strip_components.to_string()],
    Op::Chdir { dir, .. } => vec![dir.clone()],
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::{self, PhaseBuilder};
  use tempfile::TempDir;

  fn hash(phase: &Phase) -> Digest32 {
    hash_phase(phase, ExecContext::canonical()).unwrap()
  }

  mod hash_mode {
    use super::*;

    #[test]
    fn identical_phases_hash_identically() {
      let build = || {
        let mut ctx = PhaseBuilder::new();
        ctx.mkdir(format!("{}/bin", action::PREFIX)).shell("make install");
        ctx.finish()
      };
      assert_eq!(hash(&build()), hash(&build()));
    }

    #[test]
    fn argument_boundaries_do_not_collide() {
      let mut a = PhaseBuilder::new();
      a.exec("echo", ["a b"]);
      let mut b = PhaseBuilder::new();
      b.exec("echo", ["a", "b"]);
      assert_ne!(hash(&a.finish()), hash(&b.finish()));
    }

    #[test]
    fn operation_name_participates() {
      let mut a = PhaseBuilder::new();
      a.set_env("PATH", "/x");
      let mut b = PhaseBuilder::new();
      b.append_env("PATH", "/x");
      assert_ne!(hash(&a.finish()), hash(&b.finish()));
    }

    #[test]
    fn chdir_scope_participates() {
      let mut a = PhaseBuilder::new();
      a.chdir("src", |ctx| {
        ctx.shell("make");
      });
      a.shell("make install");
      let mut b = PhaseBuilder::new();
      b.chdir("src", |ctx| {
        ctx.shell("make");
        ctx.shell("make install");
      });
      assert_ne!(hash(&a.finish()), hash(&b.finish()));
    }

    #[test]
    fn dependency_placeholder_hashes_as_id() {
      let mut ctx = PhaseBuilder::new();
      ctx.shell(format!("{}/bin/tool", action::dep("tool")));
      let phase = ctx.finish();

      let a = hash_phase(&phase, ExecContext::canonical().with_dep("tool", "sigA-tool-1.0")).unwrap();
      let b = hash_phase(&phase, ExecContext::canonical().with_dep("tool", "sigB-tool-1.0")).unwrap();
      assert_ne!(a, b);
    }

    #[test]
    fn unresolved_placeholder_is_fatal() {
      let mut ctx = PhaseBuilder::new();
      ctx.shell(format!("cat {}", action::input("missing")));
      let result = hash_phase(&ctx.finish(), ExecContext::canonical());
      assert!(matches!(
        result,
        Err(ExecuteError::Placeholder(PlaceholderError::UnresolvedInput(_)))
      ));
    }

    #[test]
    fn hashing_touches_nothing() {
      let temp = TempDir::new().unwrap();
      let target = temp.path().join("should-not-exist");
      let mut ctx = PhaseBuilder::new();
      ctx.mkdir(target.display().to_string());
      hash(&ctx.finish());
      assert!(!target.exists());
    }
  }

  mod run_mode {
    use super::*;

    fn setup() -> (TempDir, ExecContext) {
      let temp = TempDir::new().unwrap();
      let prefix = temp.path().join("prefix");
      let build = temp.path().join("build");
      std::fs::create_dir_all(&prefix).unwrap();
      std::fs::create_dir_all(&build).unwrap();
      let ctx = ExecContext::for_build(&prefix, &build, temp.path());
      (temp, ctx)
    }

    #[tokio::test]
    async fn writes_into_prefix() {
      let (temp, ctx) = setup();
      let mut phase = PhaseBuilder::new();
      phase
        .mkdir(format!("{}/share", action::PREFIX))
        .write(format!("{}/share/greeting", action::PREFIX), "hello");

      let mut exec = Executor::running(ctx, RunState::default());
      exec.execute(&phase.finish()).await.unwrap();

      let written = std::fs::read_to_string(temp.path().join("prefix/share/greeting")).unwrap();
      assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn chdir_restores_cwd_after_failure() {
      let (temp, ctx) = setup();
      std::fs::create_dir(temp.path().join("build/src")).unwrap();
      let mut phase = PhaseBuilder::new();
      phase.chdir("src", |ctx| {
        ctx.shell("exit 3");
      });

      let mut exec = Executor::running(ctx, RunState::default());
      let err = exec.execute(&phase.finish()).await.unwrap_err();

      assert!(matches!(err, ExecuteError::CmdFailed { code: Some(3), .. }));
      assert_eq!(exec.context().cwd, temp.path().join("build"));
    }

    #[tokio::test]
    async fn chdir_into_missing_directory_fails() {
      let (_temp, ctx) = setup();
      let mut phase = PhaseBuilder::new();
      phase.chdir("nope", |ctx| {
        ctx.shell("true");
      });
      let mut exec = Executor::running(ctx, RunState::default());
      assert!(matches!(
        exec.execute(&phase.finish()).await,
        Err(ExecuteError::NotADirectory(_))
      ));
    }

    #[tokio::test]
    async fn relative_paths_follow_chdir() {
      let (temp, ctx) = setup();
      std::fs::create_dir(temp.path().join("build/src")).unwrap();
      let mut phase = PhaseBuilder::new();
      phase.chdir("src", |ctx| {
        ctx.write("marker", "x");
      });
      let mut exec = Executor::running(ctx, RunState::default());
      exec.execute(&phase.finish()).await.unwrap();
      assert!(temp.path().join("build/src/marker").exists());
    }

    #[tokio::test]
    async fn env_operations_reach_subprocesses() {
      let (temp, ctx) = setup();
      let mut phase = PhaseBuilder::new();
      phase
        .set_env("GREETING", "hello")
        .append_env("GREETING", "world")
        .prepend_env("PATH", "/opt/tools/bin")
        .shell(format!(
          "echo \"$GREETING\" > {p}/greeting; echo \"$PATH\" > {p}/path",
          p = action::PREFIX
        ));

      let mut exec = Executor::running(ctx, RunState::default());
      exec.execute(&phase.finish()).await.unwrap();

      let greeting = std::fs::read_to_string(temp.path().join("prefix/greeting")).unwrap();
      assert_eq!(greeting.trim(), "hello:world");
      let path = std::fs::read_to_string(temp.path().join("prefix/path")).unwrap();
      assert!(path.starts_with("/opt/tools/bin:"));
    }

    #[tokio::test]
    async fn isolated_environment() {
      let (temp, ctx) = setup();
      let mut phase = PhaseBuilder::new();
      phase.shell(format!(
        "echo \"$HOME $SOURCE_DATE_EPOCH $out\" > {}/env",
        action::PREFIX
      ));
      let mut exec = Executor::running(ctx, RunState::default());
      exec.execute(&phase.finish()).await.unwrap();

      let env = std::fs::read_to_string(temp.path().join("prefix/env")).unwrap();
      let prefix = temp.path().join("prefix");
      assert_eq!(env.trim(), format!("/homeless-shelter 315532800 {}", prefix.display()));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
      let (temp, ctx) = setup();
      let state = RunState::default();
      state.cancel.cancel();
      let mut phase = PhaseBuilder::new();
      phase.mkdir(format!("{}/never", action::PREFIX));

      let mut exec = Executor::running(ctx, state);
      assert!(matches!(
        exec.execute(&phase.finish()).await,
        Err(ExecuteError::Cancelled)
      ));
      assert!(!temp.path().join("prefix/never").exists());
    }

    #[tokio::test]
    async fn failure_stops_remaining_operations() {
      let (temp, ctx) = setup();
      let mut phase = PhaseBuilder::new();
      phase
        .shell("exit 1")
        .write(format!("{}/after", action::PREFIX), "x");

      let mut exec = Executor::running(ctx, RunState::default());
      assert!(exec.execute(&phase.finish()).await.is_err());
      assert!(!temp.path().join("prefix/after").exists());
    }
  }

  #[test]
  fn shell_quote_examples() {
    assert_eq!(shell_quote("plain-word"), "plain-word");
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("a b"), "'a b'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
  }
}
