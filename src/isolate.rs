//! Subprocess isolation for foreign calls
//!
//! A fault inside foreign code takes down the process that made the call,
//! and a call that never returns cannot be interrupted. Running the call in a
//! child process turns both into observable outcomes: the child's exit
//! signal, or a kill after a deadline. This sits outside the core bridge; the
//! CLI uses it for `--isolate`.

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// How an isolated call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationOutcome {
    /// Exit status 0
    Completed { stdout: String, stderr: String },
    /// Non-zero exit code, reported by the child itself
    Failed {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Killed by a signal (or an abnormal exit with no code)
    Crashed {
        signal: Option<i32>,
        stderr: String,
    },
    /// Still running at the deadline; the child was killed
    TimedOut { after: Duration },
}

impl IsolationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, IsolationOutcome::Completed { .. })
    }
}

/// A command run once in a child process, with an optional deadline.
#[derive(Debug, Clone)]
pub struct IsolatedCall {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl IsolatedCall {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Re-run the current executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the child to completion, or until the deadline passes.
    pub fn run(&self) -> Result<IsolationOutcome, IsolationError> {
        tracing::debug!(program = %self.program.display(), args = ?self.args, timeout = ?self.timeout, "starting isolated call");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| IsolationError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        // Drain both pipes on their own threads so a chatty child cannot
        // block on a full pipe while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.wait(&mut child)? {
            Some(status) => status,
            None => {
                let after = self.timeout.unwrap_or_default();
                tracing::warn!(?after, "isolated call timed out, killing child");
                // The child may exit on its own between the last poll and the kill
                let _ = child.kill();
                child.wait().map_err(IsolationError::Wait)?;
                return Ok(IsolationOutcome::TimedOut { after });
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        Ok(classify(status, stdout, stderr))
    }

    /// `None` when the deadline passed first.
    fn wait(&self, child: &mut Child) -> Result<Option<ExitStatus>, IsolationError> {
        let Some(timeout) = self.timeout else {
            return child.wait().map(Some).map_err(IsolationError::Wait);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(IsolationError::Wait)? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn classify(status: ExitStatus, stdout: String, stderr: String) -> IsolationOutcome {
    if status.success() {
        return IsolationOutcome::Completed { stdout, stderr };
    }
    match status.code() {
        Some(code) => IsolationOutcome::Failed {
            code,
            stdout,
            stderr,
        },
        None => IsolationOutcome::Crashed {
            signal: exit_signal(&status),
            stderr,
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> IsolatedCall {
        IsolatedCall::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn test_completed_captures_output() {
        let outcome = sh("echo hello; echo oops >&2").run().unwrap();
        assert_eq!(
            outcome,
            IsolationOutcome::Completed {
                stdout: "hello\n".to_string(),
                stderr: "oops\n".to_string(),
            }
        );
        assert!(outcome.is_success());
    }

    #[test]
    fn test_failed_reports_exit_code() {
        let outcome = sh("echo bad >&2; exit 3").run().unwrap();
        match outcome {
            IsolationOutcome::Failed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "bad\n");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_crash_reports_signal() {
        let outcome = sh("kill -SEGV $$").run().unwrap();
        assert_eq!(
            outcome,
            IsolationOutcome::Crashed {
                signal: Some(11),
                stderr: String::new(),
            }
        );
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let outcome = sh("sleep 5")
            .timeout(Duration::from_millis(100))
            .run()
            .unwrap();
        assert_eq!(
            outcome,
            IsolationOutcome::TimedOut {
                after: Duration::from_millis(100)
            }
        );
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_spawn_failure() {
        let err = IsolatedCall::new("/nonexistent/program").run().unwrap_err();
        assert!(matches!(err, IsolationError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/program"));
    }
}
