use anyhow::Context;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::budget::Budget;
use crate::error::{KilnError, Result};
use crate::toolchain::BuildStep;

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration: f64,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

/// Runs one step's command in `cwd`, capturing its output line by line.
///
/// The child is killed as soon as `budget` is exhausted and the call returns
/// [`KilnError::BudgetExceeded`].
pub async fn execute_step(step: &BuildStep, cwd: &Path, budget: &Budget) -> Result<ExecutionResult> {
    budget.check()?;

    let start = Instant::now();

    let (program, args) = step
        .commands
        .split_first()
        .with_context(|| format!("Empty command for step: {}", step.description))?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", program))?;

    tracing::debug!(program = %program, pid = ?child.id(), "spawned {}", step.description);

    let stdout = child.stdout.take().context("Failed to capture stdout")?;
    let stderr = child.stderr.take().context("Failed to capture stderr")?;

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lines.push(line);
        }
        lines
    });

    let status = tokio::select! {
        status = child.wait() => status.context("Failed to wait for child process")?,
        _ = budget.exhausted() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill {}", program);
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(KilnError::BudgetExceeded(budget.exceeded()));
        }
    };

    let stdout_lines = stdout_task.await.context("stdout task panicked")?;
    let stderr_lines = stderr_task.await.context("stderr task panicked")?;

    let duration = start.elapsed().as_secs_f64();
    let exit_code = status.code();
    let mut failure_reason: Option<String> = None;

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            failure_reason = Some(format!("Signal {} ({})", signal, signal_name(signal)));
        }
    }

    #[cfg(not(unix))]
    {
        if exit_code.is_none() && !status.success() {
            failure_reason = Some("Abnormal termination".to_string());
        }
    }

    if let Some(code) = exit_code {
        if code != 0 && failure_reason.is_none() {
            failure_reason = Some(format!("Exit code {}", code));
        }
    }

    Ok(ExecutionResult {
        success: status.success(),
        duration,
        stdout: stdout_lines,
        stderr: stderr_lines,
        exit_code,
        failure_reason,
    })
}

#[cfg(unix)]
fn signal_name(signal: i32) -> &'static str {
    match signal {
        1 => "SIGHUP (Hangup)",
        2 => "SIGINT (Interrupt)",
        3 => "SIGQUIT (Quit)",
        4 => "SIGILL (Illegal instruction)",
        6 => "SIGABRT (Abort)",
        8 => "SIGFPE (Floating point exception)",
        9 => "SIGKILL (Killed)",
        11 => "SIGSEGV (Segmentation fault)",
        13 => "SIGPIPE (Broken pipe)",
        15 => "SIGTERM (Terminated)",
        _ => "Unknown signal",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> BuildStep {
        BuildStep::new(
            "script".to_string(),
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let budget = Budget::unbounded("test");
        let result = execute_step(&sh("echo out; echo err >&2"), Path::new("."), &budget)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.stdout, vec!["out"]);
        assert_eq!(result.stderr, vec!["err"]);
        assert!(result.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let budget = Budget::unbounded("test");
        let result = execute_step(&sh("exit 3"), Path::new("."), &budget)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.failure_reason.as_deref(), Some("Exit code 3"));
    }

    #[tokio::test]
    async fn test_signal_is_reported() {
        let budget = Budget::unbounded("test");
        let result = execute_step(&sh("kill -9 $$"), Path::new("."), &budget)
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.failure_reason.unwrap().contains("SIGKILL"));
    }

    #[tokio::test]
    async fn test_budget_kills_long_running_child() {
        let budget = Budget::new("test", Some(Duration::from_millis(100)));
        let start = Instant::now();
        let result = execute_step(&sh("exec sleep 30"), Path::new("."), &budget).await;

        assert!(matches!(result, Err(KilnError::BudgetExceeded(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let budget = Budget::unbounded("test");
        let step = BuildStep::new("nothing".to_string(), vec![]);
        let result = execute_step(&step, Path::new("."), &budget).await;

        assert!(matches!(result, Err(KilnError::Other(_))));
    }
}
