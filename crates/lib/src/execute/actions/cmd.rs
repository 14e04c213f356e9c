//! Process-spawning operations (`exec` and `shell`).
//!
//! Commands run with the executor's isolated environment (the process environment
//! is cleared first). stdout and stderr are drained by two reader tasks so a full
//! pipe on either stream cannot stall the child; an invocation completes only once
//! both readers have finished and the process has exited.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::execute::types::ExecuteError;
use crate::execute::{ExecContext, RunState};

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Captured output of a finished command.
#[derive(Debug, Default)]
pub struct CommandOutput {
  pub stdout: String,
  pub stderr: String,
}

/// Runs `program` with `args`; `env` is layered over the context environment.
pub async fn execute_exec(
  program: &str,
  args: &[String],
  env: &BTreeMap<String, String>,
  ctx: &ExecContext,
  state: &RunState,
) -> Result<CommandOutput, ExecuteError> {
  info!(program = %program, "executing program");

  let mut command = isolated_command(program, ctx).await?;
  command.args(args);
  command.envs(env);

  let cmd_line = std::iter::once(program)
    .chain(args.iter().map(String::as_str))
    .collect::<Vec<_>>()
    .join(" ");
  run_to_completion(command, cmd_line, &state.cancel).await
}

/// Runs `script` through the build shell.
pub async fn execute_shell(script: &str, ctx: &ExecContext, state: &RunState) -> Result<CommandOutput, ExecuteError> {
  info!(script = %first_line(script), "executing shell script");

  let (shell, shell_args) = get_shell(state.shell.as_deref());
  let mut command = isolated_command(&shell, ctx).await?;
  command.args(&shell_args).arg(script);

  run_to_completion(command, script.to_string(), &state.cancel).await
}

async fn isolated_command(program: &str, ctx: &ExecContext) -> Result<Command, ExecuteError> {
  if let Some(tmp) = ctx.env.get("TMPDIR") {
    tokio::fs::create_dir_all(tmp)
      .await
      .map_err(|e| ExecuteError::io("create", tmp, e))?;
  }

  let mut command = Command::new(program);
  command
    .current_dir(&ctx.cwd)
    .env_clear()
    .envs(&ctx.env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
  Ok(command)
}

async fn run_to_completion(
  mut command: Command,
  cmd_line: String,
  cancel: &CancellationToken,
) -> Result<CommandOutput, ExecuteError> {
  let program = command.as_std().get_program().to_owned();
  debug!(program = ?program, cwd = ?command.as_std().get_current_dir(), "spawning process");

  let mut child = command
    .spawn()
    .map_err(|e| ExecuteError::io("spawn", Path::new(&program), e))?;

  let stdout = child
    .stdout
    .take()
    .ok_or_else(|| ExecuteError::Task("stdout was not captured".to_string()))?;
  let stderr = child
    .stderr
    .take()
    .ok_or_else(|| ExecuteError::Task("stderr was not captured".to_string()))?;

  let stdout_task = drain(stdout, "stdout", usize::MAX);
  let stderr_task = drain(stderr, "stderr", STDERR_TAIL_LINES);

  let status = tokio::select! {
    status = child.wait() => status.map_err(|e| ExecuteError::io("wait for", Path::new(&program), e))?,
    _ = cancel.cancelled() => {
      warn!(cmd = %first_line(&cmd_line), "cancelling running command");
      let _ = child.kill().await;
      let _ = stdout_task.await;
      let _ = stderr_task.await;
      return Err(ExecuteError::Cancelled);
    }
  };

  let stdout = join_reader(stdout_task).await?;
  let stderr = join_reader(stderr_task).await?;

  if !status.success() {
    return Err(ExecuteError::CmdFailed {
      cmd: cmd_line,
      code: status.code(),
      stderr,
    });
  }

  Ok(CommandOutput {
    stdout: stdout.trim().to_string(),
    stderr,
  })
}

/// Reads `reader` line by line, logging each line and keeping the last `keep` lines.
fn drain<R>(reader: R, stream: &'static str, keep: usize) -> JoinHandle<std::io::Result<String>>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = VecDeque::new();
    loop {
      buf.clear();
      if reader.read_until(b'\n', &mut buf).await? == 0 {
        break;
      }
      let line = String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string();
      debug!(stream, "{line}");
      lines.push_back(line);
      if lines.len() > keep {
        lines.pop_front();
      }
    }
    Ok(Vec::from(lines).join("\n"))
  })
}

async fn join_reader(task: JoinHandle<std::io::Result<String>>) -> Result<String, ExecuteError> {
  task
    .await
    .map_err(|e| ExecuteError::Task(e.to_string()))?
    .map_err(ExecuteError::IoPlain)
}

fn first_line(text: &str) -> &str {
  text.trim_start().lines().next().unwrap_or_default()
}

/// Shell binary and flags for `shell` operations.
///
/// `/bin/sh` is the default rather than `$SHELL`, since interactive shells may
/// source profile files and leak the user's environment into the build.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  match override_shell {
    Some(shell) => (shell.to_string(), vec!["-c".to_string()]),
    None => ("/bin/sh".to_string(), vec!["-c".to_string()]),
  }
}
