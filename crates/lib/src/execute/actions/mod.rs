//! Run-mode implementations of the builtin operations.
//!
//! Placeholders are already resolved by the time an [`Op`] reaches [`run`]; relative
//! paths are taken from the context's working directory. Environment operations
//! mutate the executor context directly and never reach this module.

pub mod cmd;
pub mod fetch;
pub mod fs;
pub mod patch;
pub mod unpack;

use crate::action::Op;
use crate::execute::types::ExecuteError;
use crate::execute::{ExecContext, RunState};

pub use cmd::{execute_exec, execute_shell};
pub use fetch::execute_download;
pub use unpack::unpack_archive;

/// Performs one resolved operation.
pub async fn run(op: &Op, ctx: &ExecContext, state: &RunState) -> Result<(), ExecuteError> {
  match op {
    Op::Exec { program, args, env } => execute_exec(program, args, env, ctx, state).await.map(drop),
    Op::Shell { script } => execute_shell(script, ctx, state).await.map(drop),
    Op::Patch { file, strip } => {
      let patch_file = ctx.abs(file);
      let root = ctx.cwd.clone();
      let strip = *strip;
      blocking(move || patch::apply_patch_file(&patch_file, &root, strip)).await
    }
    Op::Replace { file, from, to } => fs::replace_in_file(&ctx.abs(file), from, to).await,
    Op::Symlink { target, link } => fs::symlink(target, &ctx.abs(link)).await,
    Op::Install { src, dest, link } => {
      let src = ctx.abs(src);
      let dest = ctx.abs(dest);
      let link = *link;
      blocking(move || fs::install(&src, &dest, link)).await
    }
    Op::Mkdir { path } => fs::mkdir(&ctx.abs(path)).await,
    Op::WriteFile {
      path,
      contents,
      executable,
    } => fs::write_file(&ctx.abs(path), contents, *executable).await,
    Op::Download { url, dest, checksum } => execute_download(url, &ctx.abs(dest), checksum, state)
      .await
      .map(drop),
    Op::Unpack {
      archive,
      dest,
      strip_components,
    } => {
      let archive = ctx.abs(archive);
      let dest = ctx.abs(dest);
      let strip = *strip_components as usize;
      blocking(move || unpack_archive(&archive, &dest, strip)).await
    }
    // Handled by the executor itself.
    Op::SetEnv { .. } | Op::AppendEnv { .. } | Op::PrependEnv { .. } | Op::Chdir { .. } => Ok(()),
  }
}

/// Runs synchronous filesystem work off the async runtime.
async fn blocking<F>(f: F) -> Result<(), ExecuteError>
where
  F: FnOnce() -> Result<(), ExecuteError> + Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| ExecuteError::Task(e.to_string()))?
}
