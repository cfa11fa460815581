//! Handle for a spawned native autodetect process.

use super::command::autodetect_command;
use super::{AutodetectProcess, ErrorBuffer, ProcessInput, ProcessOutput};
use crate::config::ProcessConfig;
use crate::error::{AppResult, AutodetectError};
use crate::job::JobContext;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A real OS process speaking the autodetect protocol on its stdio.
///
/// Stderr is drained line by line on a background task into a bounded
/// buffer that backs [`AutodetectProcess::read_error`].
pub struct NativeProcess {
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    input: Mutex<Option<ProcessInput>>,
    output: Mutex<Option<ProcessOutput>>,
    errors: Arc<ErrorBuffer>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl NativeProcess {
    /// Start the autodetect binary for `job`.
    pub fn spawn(job: &JobContext, config: &ProcessConfig) -> AppResult<Self> {
        job.validate()?;
        let mut command = autodetect_command(job, config);
        info!(
            job_id = %job.job_id,
            executable = %config.executable.display(),
            "starting autodetect process"
        );
        Self::spawn_command(&mut command, config.error_buffer_lines)
    }

    /// Start an arbitrary command. All three standard streams must be piped.
    pub fn spawn_command(command: &mut Command, error_buffer_lines: usize) -> AppResult<Self> {
        let mut child = command.spawn().map_err(AutodetectError::Spawn)?;

        let stdin = child.stdin.take().ok_or_else(|| not_piped("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| not_piped("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| not_piped("stderr"))?;

        let pid = child.id();
        let errors = Arc::new(ErrorBuffer::new(error_buffer_lines));
        let stderr_task = {
            let errors = Arc::clone(&errors);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            debug!(target: "autodetect::stderr", "{line}");
                            errors.push(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "stopped reading autodetect stderr");
                            break;
                        }
                    }
                }
            })
        };

        debug!(?pid, "autodetect process running");
        Ok(Self {
            pid,
            child: Mutex::new(Some(child)),
            input: Mutex::new(Some(Box::new(stdin))),
            output: Mutex::new(Some(Box::new(stdout))),
            errors,
            stderr_task: Mutex::new(Some(stderr_task)),
        })
    }

    /// OS process id, if the process was running when spawned.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }
}

fn not_piped(stream: &str) -> AutodetectError {
    AutodetectError::Spawn(io::Error::new(
        io::ErrorKind::Other,
        format!("{stream} of the autodetect process is not piped"),
    ))
}

#[async_trait]
impl AutodetectProcess for NativeProcess {
    fn take_input(&self) -> Option<ProcessInput> {
        self.input.lock().take()
    }

    fn take_output(&self) -> Option<ProcessOutput> {
        self.output.lock().take()
    }

    fn is_alive(&self) -> bool {
        let mut child = self.child.lock();
        match child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(%status, "autodetect process has exited");
                false
            }
            Some(Err(e)) => {
                debug!(error = %e, "liveness check failed");
                false
            }
            None => false,
        }
    }

    fn read_error(&self) -> String {
        self.errors.contents()
    }

    async fn close(&self, timeout: Duration) -> AppResult<()> {
        drop(self.input.lock().take());
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "autodetect process exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for autodetect process"),
            Err(_) => {
                warn!(?timeout, "autodetect process did not exit in time, killing it");
                child.kill().await?;
            }
        }

        let stderr_task = self.stderr_task.lock().take();
        if let Some(task) = stderr_task {
            if tokio::time::timeout(timeout, task).await.is_err() {
                debug!("stderr reader still running after close");
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn piped(program: &str, args: &[&str]) -> Command {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    #[tokio::test]
    async fn echoes_through_cat_and_closes() {
        let process = NativeProcess::spawn_command(&mut piped("cat", &[]), 8).unwrap();
        assert!(process.is_alive());

        let mut input = process.take_input().unwrap();
        let mut output = process.take_output().unwrap();
        assert!(process.take_input().is_none());

        input.write_all(b"{\"flush\":\"1\"}").await.unwrap();
        input.shutdown().await.unwrap();
        drop(input);

        let mut echoed = String::new();
        output.read_to_string(&mut echoed).await.unwrap();
        assert_eq!(echoed, "{\"flush\":\"1\"}");

        process.close(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_alive());
        process.close(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn captures_stderr_of_dead_process() {
        let process = NativeProcess::spawn_command(
            &mut piped("sh", &["-c", "echo 'bad config' >&2; exit 3"]),
            8,
        )
        .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while process.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!process.is_alive());

        process.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(process.read_error(), "bad config");
    }

    #[tokio::test]
    async fn close_kills_process_that_ignores_end_of_input() {
        let process =
            NativeProcess::spawn_command(&mut piped("sleep", &["30"]), 8).unwrap();

        let started = std::time::Instant::now();
        process.close(Duration::from_millis(100)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let job = JobContext::new("job", ["time", "value"]);
        let config = ProcessConfig {
            executable: "/nonexistent/autodetect".into(),
            ..ProcessConfig::default()
        };
        assert!(matches!(
            NativeProcess::spawn(&job, &config),
            Err(AutodetectError::Spawn(_))
        ));
    }
}
