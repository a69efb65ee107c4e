//! Media subprocess handle
//!
//! Wraps one encoder or decoder process: spawn with the right pipes, a
//! background task draining stderr into the log, liveness checks, bounded
//! pipe reads, writes with immediate flush, and an idempotent
//! graceful-then-forced stop.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::command::MediaCommand;

/// How long a graceful stop waits before escalating to a kill.
const FORCED_STOP_WAIT: Duration = Duration::from_secs(2);

/// Outcome of a bounded read from the encoder pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRead {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// Nothing arrived within the wait; the process may still be alive.
    Empty,
    /// The pipe reached end-of-file.
    Eof,
}

/// Failure to start or supervise a media subprocess.
#[derive(Debug)]
pub enum ProcessError {
    /// The program could not be spawned (missing binary, permissions).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The process exited during its startup grace period.
    ExitedEarly { pid: u32 },
    /// The expected pipe end was not set up by the OS.
    PipeMissing { program: String },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to spawn '{}': {}", program, source)
            }
            ProcessError::ExitedEarly { pid } => {
                write!(f, "process (pid {}) exited immediately after start", pid)
            }
            ProcessError::PipeMissing { program } => {
                write!(f, "'{}' started without the expected pipe", program)
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Handle to one running media subprocess.
///
/// The server shares a single encoder handle across all relay loops; the
/// client owns at most one decoder handle per active link. All methods are
/// safe to call after the process died or was stopped.
pub struct MediaProcess {
    pid: u32,
    program: String,
    child: Mutex<Child>,
    /// Encoder output. Reads are exclusive: concurrent relay loops take
    /// turns, each chunk is delivered to exactly one of them.
    stdout: Option<Mutex<ChildStdout>>,
    /// Decoder input. `None` inside once closed by a stop.
    stdin: Option<Mutex<Option<ChildStdin>>>,
    stopped: AtomicBool,
}

impl MediaProcess {
    /// Spawn an encoder: stdout piped, stderr drained to the log.
    pub fn spawn_encoder(command: &MediaCommand) -> Result<Arc<Self>, ProcessError> {
        Self::spawn(command, true)
    }

    /// Spawn a decoder: stdin piped, stderr drained to the log.
    pub fn spawn_decoder(command: &MediaCommand) -> Result<Arc<Self>, ProcessError> {
        Self::spawn(command, false)
    }

    fn spawn(command: &MediaCommand, reads: bool) -> Result<Arc<Self>, ProcessError> {
        let mut builder = command.build();
        builder
            .stdin(if reads { Stdio::null() } else { Stdio::piped() })
            .stdout(if reads { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = builder.spawn().map_err(|source| ProcessError::Spawn {
            program: command.program().to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(program = command.program(), pid = pid, "Media process started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(monitor_stderr(command.program().to_string(), pid, stderr));
        }

        let stdout = if reads {
            let out = child.stdout.take().ok_or_else(|| ProcessError::PipeMissing {
                program: command.program().to_string(),
            })?;
            Some(Mutex::new(out))
        } else {
            None
        };
        let stdin = if reads {
            None
        } else {
            let inp = child.stdin.take().ok_or_else(|| ProcessError::PipeMissing {
                program: command.program().to_string(),
            })?;
            Some(Mutex::new(Some(inp)))
        };

        Ok(Arc::new(Self {
            pid,
            program: command.program().to_string(),
            child: Mutex::new(child),
            stdout,
            stdin,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has not yet exited.
    pub async fn is_alive(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match self.child.lock().await.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => false,
        }
    }

    /// Fail if the process exited within `grace` of starting.
    ///
    /// Capture encoders need a moment to negotiate with the desktop portal;
    /// if they die in that window the failure belongs to the admission that
    /// triggered the start, not to a later relay iteration.
    pub async fn ensure_running(&self, grace: Duration) -> Result<(), ProcessError> {
        tokio::time::sleep(grace).await;
        if self.is_alive().await {
            Ok(())
        } else {
            tracing::error!(
                program = %self.program,
                pid = self.pid,
                "Media process terminated immediately after start"
            );
            Err(ProcessError::ExitedEarly { pid: self.pid })
        }
    }

    /// Read the next chunk from the process output, waiting at most `wait`.
    ///
    /// Panics in debug builds if called on a decoder handle.
    pub async fn read_chunk(&self, buf: &mut [u8], wait: Duration) -> std::io::Result<PipeRead> {
        let Some(ref stdout) = self.stdout else {
            debug_assert!(false, "read_chunk on a write-side media process");
            return Ok(PipeRead::Eof);
        };
        let mut stdout = stdout.lock().await;
        match tokio::time::timeout(wait, stdout.read(buf)).await {
            Ok(Ok(0)) => Ok(PipeRead::Eof),
            Ok(Ok(n)) => Ok(PipeRead::Data(n)),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(PipeRead::Empty),
        }
    }

    /// Write a payload to the process input and flush it immediately so
    /// playback latency stays minimal.
    pub async fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let Some(ref stdin) = self.stdin else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "media process has no input pipe",
            ));
        };
        let mut stdin = stdin.lock().await;
        let Some(ref mut pipe) = *stdin else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "media process input already closed",
            ));
        };
        pipe.write_all(data).await?;
        pipe.flush().await
    }

    /// Stop the process: close its input (the graceful signal for a
    /// renderer), wait `grace`, then kill. Idempotent; a second call
    /// returns immediately.
    pub async fn stop(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(ref stdin) = self.stdin {
            stdin.lock().await.take();
        }

        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, %status, "Media process already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(pid = self.pid, error = %e, "Media process state unknown");
                return;
            }
        }

        if !grace.is_zero() {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                tracing::info!(pid = self.pid, %status, "Media process stopped");
                return;
            }
            tracing::warn!(
                pid = self.pid,
                program = %self.program,
                "Media process did not exit gracefully, killing"
            );
        }

        if child.start_kill().is_ok() {
            if tokio::time::timeout(FORCED_STOP_WAIT, child.wait()).await.is_err() {
                tracing::warn!(pid = self.pid, "Media process did not terminate after kill");
                return;
            }
        }
        tracing::info!(pid = self.pid, "Media process stopped");
    }
}

impl std::fmt::Debug for MediaProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Forward subprocess stderr lines to the log until the pipe closes.
async fn monitor_stderr(program: String, pid: u32, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            tracing::warn!(program = %program, pid = pid, "{}", line);
        }
    }
    tracing::debug!(program = %program, pid = pid, "stderr monitoring ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let cmd = MediaCommand::new("definitely-not-a-real-binary-aa51", Vec::<String>::new());
        let result = MediaProcess::spawn_encoder(&cmd);
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_encoder_reads_until_eof() {
        let cmd = MediaCommand::new("sh", ["-c", "printf abcdef"]);
        let process = MediaProcess::spawn_encoder(&cmd).unwrap();

        let mut buf = [0u8; 64];
        let mut collected = Vec::new();
        loop {
            match process
                .read_chunk(&mut buf, Duration::from_millis(200))
                .await
                .unwrap()
            {
                PipeRead::Data(n) => collected.extend_from_slice(&buf[..n]),
                PipeRead::Empty => continue,
                PipeRead::Eof => break,
            }
        }
        assert_eq!(collected, b"abcdef");
        process.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_decoder_write_and_graceful_stop() {
        // cat exits on its own once stdin closes, so the graceful path wins
        let cmd = MediaCommand::new("cat", Vec::<String>::new());
        let process = MediaProcess::spawn_decoder(&cmd).unwrap();

        assert!(process.is_alive().await);
        process.write_all(b"stream bytes").await.unwrap();

        process.stop(Duration::from_secs(1)).await;
        assert!(!process.is_alive().await);

        // Writes after stop fail instead of panicking
        assert!(process.write_all(b"more").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_twice_is_a_noop() {
        let cmd = MediaCommand::new("cat", Vec::<String>::new());
        let process = MediaProcess::spawn_decoder(&cmd).unwrap();

        process.stop(Duration::from_millis(200)).await;
        process.stop(Duration::from_millis(200)).await;
        assert!(!process.is_alive().await);
    }

    #[tokio::test]
    async fn test_ensure_running_catches_immediate_exit() {
        let cmd = MediaCommand::new("sh", ["-c", "exit 3"]);
        let process = MediaProcess::spawn_encoder(&cmd).unwrap();

        let result = process.ensure_running(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProcessError::ExitedEarly { .. })));
    }

    #[tokio::test]
    async fn test_bounded_read_returns_empty_on_silence() {
        let cmd = MediaCommand::new("sh", ["-c", "sleep 5"]);
        let process = MediaProcess::spawn_encoder(&cmd).unwrap();

        let mut buf = [0u8; 16];
        let outcome = process
            .read_chunk(&mut buf, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(outcome, PipeRead::Empty);
        process.stop(Duration::ZERO).await;
    }
}
