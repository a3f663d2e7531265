//! Child process supervision shared by toolkit jobs and the web UI server.
//!
//! Both pipes are streamed line by line into a channel. Lines can optionally be
//! appended to a log file, and the last lines of stderr are kept for error reporting.

use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};

/// Number of stderr lines kept for error messages.
const STDERR_TAIL: usize = 20;

/// Everything needed to launch a child process.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Render as a shell-like string for logging.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A single line of child output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
}

/// How a supervised process ended.
#[derive(Debug)]
pub struct ExitReport {
    pub status: ExitStatus,
    /// Last lines written to stderr.
    pub stderr_tail: Vec<String>,
}

impl ExitReport {
    /// One-line failure description: the last non-empty stderr line, which for a
    /// Python toolkit is the `ExceptionType: message` line of the traceback.
    #[must_use]
    pub fn describe(&self) -> String {
        self.stderr_tail
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map_or_else(
                || format!("Exit code: {:?}", self.status.code()),
                str::to_string,
            )
    }
}

/// A running child process with its output streams attached.
pub struct Supervised {
    name: String,
    child: Child,
    pid: u32,
    output: mpsc::UnboundedReceiver<OutputLine>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<Vec<String>>>,
}

/// Spawn `spec`, streaming its output. If `log_path` is given both pipes are
/// appended to that file.
pub fn spawn(
    name: &str,
    spec: &CommandSpec,
    log_path: Option<&Path>,
) -> Result<Supervised, ProcessError> {
    tracing::debug!("Spawning {}: {}", name, spec.display());

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = spec.dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ProcessError::Spawn(name.to_string(), e))?;
    let pid = child
        .id()
        .ok_or_else(|| ProcessError::Spawn(name.to_string(), std::io::Error::other("no PID")))?;

    let (tx, output) = mpsc::unbounded_channel();
    let log_path = log_path.map(Path::to_path_buf);

    let stdout_task = child.stdout.take().map(|stdout| {
        let tx = tx.clone();
        let log_path = log_path.clone();
        tokio::spawn(async move {
            pump(stdout, Stream::Stdout, tx, log_path, None).await;
        })
    });

    let stderr_task = child.stderr.take().map(|stderr| {
        let tx = tx.clone();
        let log_path = log_path.clone();
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);
            pump(stderr, Stream::Stderr, tx, log_path, Some(&mut tail)).await;
            tail.into_iter().collect::<Vec<_>>()
        })
    });

    Ok(Supervised {
        name: name.to_string(),
        child,
        pid,
        output,
        stdout_task,
        stderr_task,
    })
}

/// Strip the line terminator and decode lossily.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Forward lines from one pipe until EOF.
async fn pump<R: AsyncRead + Unpin>(
    pipe: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<OutputLine>,
    log_path: Option<PathBuf>,
    mut tail: Option<&mut VecDeque<String>>,
) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    let mut file = match log_path {
        Some(ref path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .ok(),
        None => None,
    };

    // Child output may not be UTF-8
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Stopped reading {:?} pipe: {}", stream, e);
                break;
            }
        }
        let line = decode_line(&buf);

        if let Some(ref mut f) = file {
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }
        if let Some(ref mut tail) = tail {
            if tail.len() >= STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        // Receiver may already be gone during shutdown
        let _ = tx.send(OutputLine { stream, line });
    }
}

impl Supervised {
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next line of output, or `None` once both pipes are closed. Cancel safe.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.output.recv().await
    }

    /// Check whether the process has exited without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        self.child
            .try_wait()
            .map_err(|e| ProcessError::Wait(self.name.clone(), e))
    }

    /// Ask the process to shut down (SIGTERM).
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: signalling a PID we spawned and still own
            let pid = self.pid as libc::pid_t;
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            self.kill();
        }
    }

    /// Kill the process immediately.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!("Failed to kill {} (PID {}): {}", self.name, self.pid, e);
        }
    }

    /// Drain the remaining output through `on_line`, then wait for exit.
    pub async fn finish(
        mut self,
        mut on_line: impl FnMut(&OutputLine),
    ) -> Result<ExitReport, ProcessError> {
        while let Some(line) = self.output.recv().await {
            on_line(&line);
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::Wait(self.name.clone(), e))?;

        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        let stderr_tail = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(ExitReport {
            status,
            stderr_tail,
        })
    }
}

/// Errors that can occur while supervising a child process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn process for {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("failed to wait for {0}: {1}")]
    Wait(String, std::io::Error),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[cfg(unix)]
    fn exit_report(code: i32, stderr: &[&str]) -> ExitReport {
        use std::os::unix::process::ExitStatusExt;
        ExitReport {
            status: ExitStatus::from_raw(code << 8),
            stderr_tail: stderr.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{FFFD} byte");
    }

    #[cfg(unix)]
    #[test]
    fn test_describe_uses_last_error_line() {
        let report = exit_report(
            1,
            &[
                "Traceback (most recent call last):",
                "  File \"run.py\", line 90, in <module>",
                "RuntimeError: CUDA out of memory",
                "",
            ],
        );
        assert_eq!(report.status.code(), Some(1));
        assert_eq!(report.describe(), "RuntimeError: CUDA out of memory");
    }

    #[cfg(unix)]
    #[test]
    fn test_describe_without_stderr() {
        assert_eq!(exit_report(2, &[]).describe(), "Exit code: Some(2)");
    }

    #[test]
    fn test_display() {
        let spec = CommandSpec {
            program: "python".to_string(),
            args: vec!["run.py".to_string(), "config.json".to_string()],
            ..Default::default()
        };
        assert_eq!(spec.display(), "python run.py config.json");
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_streams_and_tail() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("job.log");

        let child = spawn("test", &sh("echo out; echo err >&2; exit 3"), Some(&log)).unwrap();
        let mut seen = Vec::new();
        let report = child
            .finish(|l| seen.push((l.stream, l.line.clone())))
            .await
            .unwrap();

        assert_eq!(report.status.code(), Some(3));
        assert_eq!(report.stderr_tail, vec!["err".to_string()]);
        assert!(seen.contains(&(Stream::Stdout, "out".to_string())));
        assert!(seen.contains(&(Stream::Stderr, "err".to_string())));

        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("out"));
        assert!(logged.contains("err"));
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_invalid_utf8_keeps_pipe_open() {
        let child = spawn(
            "bytes",
            &sh("printf 'bad \\377 byte\\n'; sleep 0.5; echo after; exit 0"),
            None,
        )
        .unwrap();
        let mut lines = Vec::new();
        let report = child.finish(|l| lines.push(l.line.clone())).await.unwrap();

        assert!(report.status.success());
        assert_eq!(lines, vec!["bad \u{FFFD} byte".to_string(), "after".to_string()]);
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_env_and_dir() {
        let dir = tempdir().unwrap();
        let mut spec = sh("echo \"$GREETING\"; pwd");
        spec.env.insert("GREETING".to_string(), "hello".to_string());
        spec.dir = Some(dir.path().to_path_buf());

        let child = spawn("env", &spec, None).unwrap();
        let mut lines = Vec::new();
        let report = child.finish(|l| lines.push(l.line.clone())).await.unwrap();

        assert!(report.status.success());
        assert_eq!(lines[0], "hello");
        assert!(lines[1].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let spec = CommandSpec {
            program: "definitely-not-a-real-program-xyz".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            spawn("missing", &spec, None),
            Err(ProcessError::Spawn(..))
        ));
    }
}
