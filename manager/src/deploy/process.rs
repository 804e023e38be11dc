//! Subprocess execution with timeouts and line streaming

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::errors::BotError;

/// Receives each output line as soon as it is read
pub type LineSink<'a> = dyn Fn(&str) + Send + Sync + 'a;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);
const ERROR_TAIL_LINES: usize = 20;

/// A command line to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL once the timeout expires
    pub kill_grace: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// `program arg1 arg2`, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last lines of stderr (stdout when stderr is empty)
    pub fn error_tail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Run a command; a non-zero exit is a [`BotError::ToolError`]
pub async fn run_command(
    spec: &CommandSpec,
    sink: Option<&LineSink<'_>>,
) -> Result<CommandOutput, BotError> {
    let output = run_command_unchecked(spec, sink).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(BotError::ToolError {
            program: spec.program.clone(),
            code: output.code,
            stderr: output.error_tail(),
        })
    }
}

/// Run a command and return its output whatever the exit status.
///
/// Fails only when the program cannot be spawned or the timeout expires.
pub async fn run_command_unchecked(
    spec: &CommandSpec,
    sink: Option<&LineSink<'_>>,
) -> Result<CommandOutput, BotError> {
    debug!("Running: {}", spec.display());

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| BotError::ToolError {
        program: spec.program.clone(),
        code: None,
        stderr: format!("failed to spawn: {}", e),
    })?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let collect = async {
        let (stdout, stderr) = tokio::join!(read_lines(stdout, sink), read_lines(stderr, sink));
        let status = child.wait().await?;
        Ok::<_, std::io::Error>(CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    };

    let result = tokio::time::timeout(spec.timeout, collect).await;
    match result {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(
                "{} timed out after {:?}, terminating",
                spec.display(),
                spec.timeout
            );
            terminate(&mut child, spec.kill_grace).await;
            Err(BotError::Timeout {
                program: spec.program.clone(),
                secs: spec.timeout.as_secs(),
            })
        }
    }
}

async fn read_lines<R>(reader: Option<R>, sink: Option<&LineSink<'_>>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(sink) = sink {
                    sink(&line);
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading subprocess output: {}", e);
                break;
            }
        }
    }
    collected
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid is our own unreaped child
        let sent = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0;
        if sent && tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill subprocess: {}", e);
    }
}
