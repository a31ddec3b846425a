//! Subprocess runner for external tools (`ldb*` directory tools, `osslsigncode`).
//!
//! [`run_tool`] spawns the program, optionally feeds bytes to stdin,
//! captures both streams and enforces a wall-clock timeout. A non-zero exit
//! status is not an error here: callers inspect [`ToolOutput`] and decide.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (16 MiB).
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// A fully described tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    /// `-1` if killed by a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The program could not be found.
    #[error("Tool not found: {0}")]
    NotFound(String),
    /// The program exceeded its timeout and was killed.
    #[error("Tool timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    /// Spawning or talking to the process failed.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Run `command` to completion or until its timeout fires.
pub async fn run_tool(command: ToolCommand) -> Result<ToolOutput, ToolError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    tracing::debug!(program = %command.program.display(), args = command.args.len(), "Spawning tool");
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ToolError::NotFound(command.program.display().to_string()),
        _ => ToolError::Io(e),
    })?;

    // Readers start before stdin is fed; the tool may fill its output pipe first.
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let stdin = child.stdin.take();
    let run = async {
        if let (Some(mut stdin), Some(bytes)) = (stdin, command.stdin.as_deref()) {
            // The tool may exit before reading everything; its exit status tells the story.
            let _ = stdin.write_all(bytes).await;
            drop(stdin);
        }
        child.wait().await
    };

    match tokio::time::timeout(command.timeout, run).await {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            Ok(ToolOutput {
                stdout,
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
                exit_code: status.code().unwrap_or(-1),
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(e)) => Err(ToolError::Io(e)),
        // `child` is killed via `kill_on_drop` on return.
        Err(_elapsed) => Err(ToolError::Timeout {
            elapsed_ms: start.elapsed().as_millis() as u64,
        }),
    }
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh", Duration::from_secs(5)).args(["-c", script])
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_tool(sh("echo hello; exit 3")).await.unwrap();
        assert_eq!(out.stdout_lossy().trim(), "hello");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn pipes_stdin_and_env() {
        let cmd = sh("cat; printf %s \"$GREETING\" >&2")
            .env("GREETING", "hi")
            .stdin(b"dn: x\n".to_vec());
        let out = run_tool(cmd).await.unwrap();
        assert_eq!(out.stdout, b"dn: x\n");
        assert_eq!(out.stderr, "hi");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let cmd = ToolCommand::new("/nonexistent/ldbsearch", Duration::from_secs(1));
        assert!(matches!(run_tool(cmd).await, Err(ToolError::NotFound(_))));
    }

    #[tokio::test]
    async fn timeout_covers_unread_stdin() {
        let cmd = ToolCommand::new("sleep", Duration::from_millis(200))
            .arg("5")
            .stdin(vec![b'x'; 1024 * 1024]);
        let start = Instant::now();
        assert!(matches!(run_tool(cmd).await, Err(ToolError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let cmd = ToolCommand::new("sleep", Duration::from_millis(100)).arg("5");
        assert!(matches!(run_tool(cmd).await, Err(ToolError::Timeout { .. })));
    }
}
