//! Sandboxed execution of the extraction worker.
//!
//! One isolated OS process per invocation, never reused across inputs.
//! The contract with the worker executable is bytes in on stdin, bytes out
//! on stdout; job options travel in the `PDF2MD_JOB_OPTIONS` environment
//! variable. stderr is captured for the service log only and never
//! surfaced to callers.
//!
//! Enforcement: wall-clock timeout (kill + `Timeout`), `RLIMIT_AS` applied
//! in the child before exec (`ResourceExceeded` when the worker dies under
//! it), and `kill_on_drop` so no exit path leaks a child. The dispatcher
//! never retries; every failure class is terminal for the triggering job.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout_secs: u64,
    /// Address-space ceiling in MB; 0 disables the rlimit.
    pub memory_limit_mb: u64,
    pub cpu_limit_secs: Option<u64>,
}

#[derive(Debug)]
pub enum SandboxFailure {
    Timeout,
    ResourceExceeded,
    Crash,
    /// The job was stopped while the worker was running.
    Cancelled,
}

impl SandboxFailure {
    /// Generic category persisted on the job row; raw diagnostics stay in
    /// the log.
    pub fn error_category(&self) -> &'static str {
        match self {
            SandboxFailure::Timeout => "timeout",
            SandboxFailure::ResourceExceeded => "resource_limit",
            SandboxFailure::Crash => "crash",
            SandboxFailure::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone)]
pub struct SandboxDispatcher {
    program: String,
    args: Vec<String>,
    limits: SandboxLimits,
}

impl SandboxDispatcher {
    /// `cmd` is the worker command line, whitespace-split into program and
    /// fixed arguments.
    pub fn new(cmd: &str, limits: SandboxLimits) -> anyhow::Result<Self> {
        let mut parts = cmd.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty extractor command"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            limits,
        })
    }

    /// Run one conversion. `cancel` kills the worker when notified (job
    /// stop); the child is reaped on every path.
    pub async fn run(
        &self,
        input: Bytes,
        options: &serde_json::Value,
        cancel: Arc<Notify>,
    ) -> Result<Bytes, SandboxFailure> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("PDF2MD_JOB_OPTIONS", options.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        apply_rlimits(&mut command, &self.limits);

        let mut child = command.spawn().map_err(|e| {
            tracing::error!(program = %self.program, "failed to spawn extraction worker: {}", e);
            SandboxFailure::Crash
        })?;

        // Feed stdin from a task so a worker that never reads cannot
        // deadlock us; dropping the handle closes the pipe.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            res = child.wait() => match res {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("failed waiting on extraction worker: {}", e);
                    return Err(SandboxFailure::Crash);
                }
            },
            _ = tokio::time::sleep(Duration::from_secs(self.limits.timeout_secs)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SandboxFailure::Timeout);
            }
            _ = cancel.notified() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SandboxFailure::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(Bytes::from(stdout));
        }

        let failure = classify_exit(&status, &self.limits);
        tracing::error!(
            program = %self.program,
            status = %status,
            category = failure.error_category(),
            stderr = %String::from_utf8_lossy(&stderr),
            "extraction worker failed"
        );
        Err(failure)
    }
}

#[cfg(unix)]
fn apply_rlimits(command: &mut Command, limits: &SandboxLimits) {
    use nix::sys::resource::{setrlimit, Resource};

    let mem_bytes = limits.memory_limit_mb.saturating_mul(1024 * 1024);
    let cpu_secs = limits.cpu_limit_secs;
    if mem_bytes == 0 && cpu_secs.is_none() {
        return;
    }

    // Runs in the forked child before exec; only async-signal-safe work.
    unsafe {
        command.pre_exec(move || {
            if mem_bytes > 0 {
                setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes)
                    .map_err(std::io::Error::from)?;
            }
            if let Some(cpu) = cpu_secs {
                setrlimit(Resource::RLIMIT_CPU, cpu, cpu).map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_command: &mut Command, _limits: &SandboxLimits) {}

#[cfg(unix)]
fn classify_exit(status: &std::process::ExitStatus, limits: &SandboxLimits) -> SandboxFailure {
    use std::os::unix::process::ExitStatusExt;

    // A worker dying under RLIMIT_AS shows up as SIGKILL, SIGSEGV or
    // SIGABRT depending on how the allocator reacts. With no memory limit
    // configured, every abnormal exit is a plain crash.
    const SIGABRT: i32 = 6;
    const SIGKILL: i32 = 9;
    const SIGSEGV: i32 = 11;

    match status.signal() {
        Some(SIGABRT) | Some(SIGKILL) | Some(SIGSEGV) if limits.memory_limit_mb > 0 => {
            SandboxFailure::ResourceExceeded
        }
        _ => SandboxFailure::Crash,
    }
}

#[cfg(not(unix))]
fn classify_exit(_status: &std::process::ExitStatus, _limits: &SandboxLimits) -> SandboxFailure {
    SandboxFailure::Crash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(timeout_secs: u64) -> SandboxLimits {
        SandboxLimits {
            timeout_secs,
            memory_limit_mb: 0,
            cpu_limit_secs: None,
        }
    }

    fn no_cancel() -> Arc<Notify> {
        Arc::new(Notify::new())
    }

    #[tokio::test]
    async fn test_bytes_flow_through_worker() {
        let dispatcher = SandboxDispatcher::new("cat", limits(10)).unwrap();
        let out = dispatcher
            .run(
                Bytes::from_static(b"%PDF-1.7 sample"),
                &serde_json::json!({"output_format": "markdown"}),
                no_cancel(),
            )
            .await
            .unwrap();
        assert_eq!(&out[..], b"%PDF-1.7 sample");
    }

    #[tokio::test]
    async fn test_wall_clock_timeout_kills_and_classifies() {
        let dispatcher = SandboxDispatcher::new("sleep 30", limits(1)).unwrap();
        let started = std::time::Instant::now();
        let err = dispatcher
            .run(Bytes::new(), &serde_json::json!({}), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFailure::Timeout));
        assert_eq!(err.error_category(), "timeout");
        // Killed at the deadline, not after the worker's own 30 s.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_crash() {
        let dispatcher = SandboxDispatcher::new("false", limits(10)).unwrap();
        let err = dispatcher
            .run(Bytes::new(), &serde_json::json!({}), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFailure::Crash));
        assert_eq!(err.error_category(), "crash");
    }

    #[tokio::test]
    async fn test_missing_worker_is_a_crash() {
        let dispatcher =
            SandboxDispatcher::new("/nonexistent/pdf2md-extract", limits(10)).unwrap();
        let err = dispatcher
            .run(Bytes::new(), &serde_json::json!({}), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFailure::Crash));
    }

    #[tokio::test]
    async fn test_cancel_terminates_the_worker_promptly() {
        let dispatcher = SandboxDispatcher::new("sleep 30", limits(60)).unwrap();
        let cancel = no_cancel();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.notify_one();
        });

        let started = std::time::Instant::now();
        let err = dispatcher
            .run(Bytes::new(), &serde_json::json!({}), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFailure::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(SandboxDispatcher::new("   ", limits(1)).is_err());
    }
}
