//! Spawns the vendor command helper with a timeout and collects its output.

use sedlock_core::error::{SedError, SedResult};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Wraps a concrete binary path and the timeout applied to each invocation.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

/// Collects stdout, stderr, and exit status from a finished command.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandRunner {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    pub fn binary(&self) -> &Path {
        &self.path
    }

    /// Execute the binary with arguments and an optional stdin payload.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> SedResult<Output> {
        let mut command = Command::new(&self.path);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            SedError::Transport(format!("failed to start {}: {err}", self.path.display()))
        })?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes)?;
                stdin.flush().ok();
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> SedResult<Output> {
        let start = Instant::now();
        let stdout_handle = Self::spawn_output_reader(stdout_pipe);
        let stderr_handle = Self::spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SedError::Transport(format!(
                "{} timed out after {:?}",
                self.path.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| SedError::Transport("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| SedError::Transport("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }

    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<SedResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> SedResult<String> {
            let mut buf = Vec::new();
            if let Some(mut reader) = pipe {
                reader.read_to_end(&mut buf)?;
            }
            Ok(String::from_utf8_lossy(&buf).into_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("helper.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn captures_output_and_status() {
        let dir = tempdir().unwrap();
        let path = script(dir.path(), "cat; echo oops >&2; exit 3");
        let runner = CommandRunner::new(path, Duration::from_secs(5));
        let out = runner.run(&[], Some(b"payload")).unwrap();
        assert_eq!(out.stdout, "payload");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.status, 3);
    }

    #[test]
    fn slow_helper_times_out() {
        let dir = tempdir().unwrap();
        let path = script(dir.path(), "sleep 5");
        let runner = CommandRunner::new(path, Duration::from_millis(100));
        let err = runner.run(&[], None).unwrap_err();
        assert!(matches!(err, SedError::Transport(msg) if msg.contains("timed out")));
    }

    #[test]
    fn missing_binary_is_a_transport_error() {
        let runner = CommandRunner::new(
            PathBuf::from("/nonexistent/sedlock-helper"),
            Duration::from_secs(1),
        );
        assert!(matches!(
            runner.run(&[], None),
            Err(SedError::Transport(_))
        ));
    }
}
