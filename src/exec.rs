use crate::driver::DriverError;
use futures_util::stream::{self, Stream};
use std::{
    env,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::trace;

/// Captured output of a single lifecycle operation together with the wall-clock time the call
/// took. The elapsed time covers the call itself, not the lifetime of the container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub output: String,
    pub elapsed: Duration,
}
impl ExecOutput {
    pub fn new(output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            output: output.into(),
            elapsed,
        }
    }
}

/// Finds a binary along `PATH` (or uses the given path as-is when it contains a separator) and
/// evaluates any symlinks.
///
/// # Arguments
///
/// * `name` - A binary name such as `docker` or a path such as `/usr/local/bin/runc`.
///
/// # Returns
///
/// The canonical path of the binary or a `DriverError::Config` if it cannot be found.
pub fn resolve_binary(name: &str) -> Result<PathBuf, DriverError> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate
            .canonicalize()
            .map_err(|err| DriverError::Config(format!("unable to resolve binary {name}: {err}")));
    }

    let search_path = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
        .and_then(|path| path.canonicalize().ok())
        .ok_or_else(|| DriverError::Config(format!("unable to find binary {name} on PATH")))
}

fn command_line(binary: &Path, args: &[String]) -> String {
    format!("{} {}", binary.display(), args.join(" "))
}

/// Executes a command and returns its combined stdout/stderr output.
pub async fn exec_cmd(binary: &Path, args: &[String]) -> Result<String, DriverError> {
    let command = command_line(binary, args);
    trace!("exec: {command}");

    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DriverError::Spawn {
            command: command.clone(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        Err(DriverError::Exec {
            command,
            status: output.status,
            output: combined,
        })
    }
}

/// Executes a command, timing it, and returns the combined stdout/stderr output.
pub async fn exec_timed_cmd(binary: &Path, args: &[String]) -> Result<ExecOutput, DriverError> {
    let start = Instant::now();
    let output = exec_cmd(binary, args).await?;
    Ok(ExecOutput::new(output, start.elapsed()))
}

/// Executes a command with all standard streams attached to the null device. Used by runtimes
/// which would otherwise hold on to the caller's terminal.
pub async fn exec_timed_cmd_no_out(
    binary: &Path,
    args: &[String],
) -> Result<ExecOutput, DriverError> {
    let command = command_line(binary, args);
    trace!("exec (no output): {command}");

    let start = Instant::now();
    let status = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| DriverError::Spawn {
            command: command.clone(),
            source,
        })?;
    let elapsed = start.elapsed();

    if status.success() {
        Ok(ExecOutput::new("", elapsed))
    } else {
        Err(DriverError::Exec {
            command,
            status,
            output: String::new(),
        })
    }
}

/// Spawns a command and yields its stdout line by line. The child is killed when the stream is
/// dropped.
pub fn exec_cmd_stream(
    binary: &Path,
    args: &[String],
) -> Result<impl Stream<Item = Result<String, DriverError>> + Send, DriverError> {
    let command = command_line(binary, args);
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DriverError::Spawn {
            command: command.clone(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DriverError::Config(format!("no stdout captured for {command}")))?;
    let lines = BufReader::new(stdout).lines();

    Ok(stream::unfold(
        (child, lines),
        |(child, mut lines)| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), (child, lines))),
                Ok(None) => None,
                Err(err) => Some((Err(DriverError::Io(err)), (child, lines))),
            }
        },
    ))
}

#[cfg(test)]
#[cfg(target_family = "unix")]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn resolve_binary_finds_sh_on_path() -> anyhow::Result<()> {
        let path = resolve_binary("sh")?;
        assert!(path.is_absolute());
        Ok(())
    }

    #[test]
    fn resolve_binary_rejects_unknown_names() {
        let res = resolve_binary("definitely-not-a-real-binary-name");
        assert!(matches!(res, Err(DriverError::Config(_))));
    }

    #[tokio::test]
    async fn exec_cmd_returns_combined_output() -> anyhow::Result<()> {
        let sh = resolve_binary("sh")?;
        let out = exec_cmd(&sh, &["-c".into(), "echo out; echo err 1>&2".into()]).await?;
        assert!(out.contains("out"));
        assert!(out.contains("err"));
        Ok(())
    }

    #[tokio::test]
    async fn failing_commands_carry_their_output() -> anyhow::Result<()> {
        let sh = resolve_binary("sh")?;
        let res = exec_timed_cmd(&sh, &["-c".into(), "echo boom; exit 3".into()]).await;
        match res {
            Err(DriverError::Exec { output, status, .. }) => {
                assert_eq!(output.trim(), "boom");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected exec error, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn streamed_output_is_split_into_lines() -> anyhow::Result<()> {
        let sh = resolve_binary("sh")?;
        let lines = exec_cmd_stream(&sh, &["-c".into(), "echo a; echo b".into()])?
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }
}
