//! One-shot signal-cli invocations.
//!
//! `ProcessEngine` spawns the signal-cli binary once per operation. The
//! message body (if any) goes over stdin, the reply comes back on stdout and
//! failures are reported on stderr with a non-zero exit code.
//!
//! Every invocation races process completion against a timer. When the timer
//! wins the child is killed and reaped before the call returns, so a hung
//! signal-cli never outlives its request.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{BridgeConfig, TrustPolicies, DEFAULT_COMMAND_TIMEOUT_SECS};
use crate::recipient::is_phone_number;

/// Process-level error types.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The binary is missing or not executable.
    #[error("Failed to spawn {binary}: {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: io::Error,
    },

    /// The process exceeded its deadline and was killed.
    #[error("Command timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The process exited unsuccessfully. Displays as the captured stderr,
    /// which is where signal-cli explains what went wrong.
    #[error("{}", exit_message(.code, .stderr))]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// Pipe read/write failure.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

fn exit_message(code: &Option<i32>, stderr: &String) -> String {
    if !stderr.is_empty() {
        return stderr.clone();
    }
    match code {
        Some(code) => format!("signal-cli exited with exit code {}", code),
        None => "signal-cli was terminated by a signal".to_string(),
    }
}

/// Runs signal-cli as a subprocess per call.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    binary: PathBuf,
    timeout: Duration,
    trust: TrustPolicies,
}

impl ProcessEngine {
    pub fn new(binary: impl Into<PathBuf>, trust: TrustPolicies) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            trust,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.binary.clone(), config.trust_policies()).with_timeout(config.command_timeout())
    }

    /// Set the per-command timeout. Default is 120 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run signal-cli with `args`.
    ///
    /// With `wait == true` the call writes `stdin` (if non-empty), waits for
    /// exit and returns the full stdout. With `wait == false` it returns the
    /// first line of stdout and leaves the process running; this is what
    /// device linking needs, since the link URI is printed long before the
    /// process exits.
    ///
    /// # Errors
    ///
    /// - `ExecError::SpawnFailed` if the binary cannot be started
    /// - `ExecError::Timeout` if the deadline passes (the child is killed)
    /// - `ExecError::NonZeroExit` if signal-cli reports failure
    /// - `ExecError::Io` on pipe failures
    ///
    /// # Example
    ///
    /// ```ignore
    /// let out = engine
    ///     .execute(true, vec!["-a".into(), "+4915112345678".into(), "listGroups".into()], None)
    ///     .await?;
    /// ```
    pub async fn execute(
        &self,
        wait: bool,
        args: Vec<String>,
        stdin: Option<&str>,
    ) -> Result<String, ExecError> {
        let args = self.with_trust_policy(args);
        let stdin = stdin.filter(|input| !input.is_empty());

        debug!(binary = %self.binary.display(), ?args, wait, "Executing signal-cli");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(wait);

        let child = cmd.spawn().map_err(|source| ExecError::SpawnFailed {
            binary: self.binary.display().to_string(),
            source,
        })?;

        if wait {
            self.run_to_completion(child, stdin).await
        } else {
            self.read_first_line(child).await
        }
    }

    /// Prepend `--trust-new-identities <mode>` when the account selected by
    /// `-a`/`--account` has a trust policy.
    pub fn with_trust_policy(&self, args: Vec<String>) -> Vec<String> {
        if self.trust.is_empty() {
            return args;
        }

        let mode = args
            .windows(2)
            .find(|pair| (pair[0] == "-a" || pair[0] == "--account") && is_phone_number(&pair[1]))
            .and_then(|pair| self.trust.get(&pair[1]));

        match mode {
            Some(mode) => {
                let mut full = Vec::with_capacity(args.len() + 2);
                full.push("--trust-new-identities".to_string());
                full.push(mode.as_str().to_string());
                full.extend(args);
                full
            }
            None => args,
        }
    }

    async fn run_to_completion(&self, mut child: Child, stdin: Option<&str>) -> Result<String, ExecError> {
        let input = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let completion = async {
            let write_input = async {
                if let (Some(mut pipe), Some(payload)) = (input, stdin) {
                    match pipe.write_all(payload.as_bytes()).await {
                        // The child may exit without reading its input.
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                        other => other?,
                    }
                    // Dropping the pipe closes it so the child sees EOF.
                }
                Ok::<_, io::Error>(())
            };

            let ((), out, err, status) =
                tokio::try_join!(write_input, read_pipe(stdout), read_pipe(stderr), child.wait())?;
            Ok::<_, io::Error>((status, out, err))
        };

        let outcome = timeout(self.timeout, completion).await;
        match outcome {
            Ok(Ok((status, out, err))) => {
                if status.success() {
                    Ok(out)
                } else {
                    let stderr = err.trim().to_string();
                    debug!(code = ?status.code(), %stderr, "signal-cli failed");
                    Err(ExecError::NonZeroExit {
                        code: status.code(),
                        stderr,
                    })
                }
            }
            Ok(Err(e)) => Err(ExecError::Io(e)),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "signal-cli timed out, killing it");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out signal-cli");
                }
                Err(ExecError::Timeout(self.timeout))
            }
        }
    }

    async fn read_first_line(&self, mut child: Child) -> Result<String, ExecError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Io(io::Error::other("stdout was not captured")))?;
        let stderr = child.stderr.take();
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        let first = timeout(self.timeout, reader.read_line(&mut line)).await;
        match first {
            Ok(Ok(0)) => {
                // stdout closed before producing anything; report why.
                let err = read_pipe(stderr).await.map_err(ExecError::Io)?;
                let status = child.wait().await.map_err(ExecError::Io)?;
                if status.success() {
                    Err(ExecError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "signal-cli exited without output",
                    )))
                } else {
                    Err(ExecError::NonZeroExit {
                        code: status.code(),
                        stderr: err.trim().to_string(),
                    })
                }
            }
            Ok(Ok(_)) => {
                // Keep the pipes drained and reap the child whenever it exits.
                tokio::spawn(async move {
                    let mut sink = tokio::io::sink();
                    let drain_out = tokio::io::copy(&mut reader, &mut sink);
                    let drain_err = read_pipe(stderr);
                    let _ = tokio::join!(drain_out, drain_err);
                    match child.wait().await {
                        Ok(status) => debug!(?status, "Detached signal-cli exited"),
                        Err(e) => warn!(error = %e, "Failed to reap detached signal-cli"),
                    }
                });
                Ok(line.trim_end().to_string())
            }
            Ok(Err(e)) => Err(ExecError::Io(e)),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "No output from signal-cli, killing it");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill signal-cli");
                }
                Err(ExecError::Timeout(self.timeout))
            }
        }
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::TrustMode;
    use pretty_assertions::assert_eq;

    const ACCOUNT: &str = "+4915112345678";

    fn sh() -> ProcessEngine {
        ProcessEngine::new("sh", TrustPolicies::default()).with_timeout(Duration::from_secs(5))
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = sh().execute(true, script("echo 1700000000000"), None).await.unwrap();
        assert_eq!(out, "1700000000000\n");
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let out = sh()
            .execute(true, script("cat"), Some("hello 👋 world"))
            .await
            .unwrap();
        assert_eq!(out, "hello 👋 world");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let err = sh()
            .execute(true, script("echo 'Invalid group id' >&2; exit 1"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::NonZeroExit { code: Some(1), .. }));
        assert_eq!(err.to_string(), "Invalid group id");
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_stderr() {
        let err = sh().execute(true, script("exit 3"), None).await.unwrap_err();
        assert_eq!(err.to_string(), "signal-cli exited with exit code 3");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let engine = sh().with_timeout(Duration::from_millis(500));

        let args = vec![
            "-c".to_string(),
            r#"echo $$ > "$0"; exec sleep 30"#.to_string(),
            pid_file.display().to_string(),
        ];
        let err = engine.execute(true, args, None).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let proc_entry = PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_entry.exists(), "process {} survived the timeout", pid.trim());
    }

    #[tokio::test]
    async fn test_spawn_failed() {
        let engine = ProcessEngine::new("/nonexistent/signal-cli", TrustPolicies::default());
        let err = engine.execute(true, vec!["--version".into()], None).await.unwrap_err();
        assert!(matches!(err, ExecError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_no_wait_returns_first_line() {
        let out = timeout(
            Duration::from_secs(5),
            sh().execute(false, script("echo 'sgnl://linkdevice?uuid=abc'; sleep 2; echo done"), None),
        )
        .await
        .expect("first line should not wait for exit")
        .unwrap();

        assert_eq!(out, "sgnl://linkdevice?uuid=abc");
    }

    #[tokio::test]
    async fn test_no_wait_failure_reports_stderr() {
        let err = sh()
            .execute(false, script("echo 'No such account' >&2; exit 2"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No such account");
    }

    #[test]
    fn test_trust_policy_prepended_for_account() {
        let trust: TrustPolicies = [(ACCOUNT.to_string(), TrustMode::Always)].into_iter().collect();
        let engine = ProcessEngine::new("signal-cli", trust);

        let args: Vec<String> = ["--config", "/data", "-a", ACCOUNT, "listGroups"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let full = engine.with_trust_policy(args);

        assert_eq!(
            full,
            vec!["--trust-new-identities", "always", "--config", "/data", "-a", ACCOUNT, "listGroups"]
        );
    }

    #[test]
    fn test_trust_policy_ignores_attachment_flag() {
        let trust: TrustPolicies = [(ACCOUNT.to_string(), TrustMode::Never)].into_iter().collect();
        let engine = ProcessEngine::new("signal-cli", trust);

        // `-a` after `send` is an attachment path, not an account.
        let args: Vec<String> = ["-u", "someone.01", "send", "-a", "/tmp/cat.jpg"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(engine.with_trust_policy(args.clone()), args);
    }

    #[test]
    fn test_trust_policy_unknown_account_untouched() {
        let trust: TrustPolicies = [(ACCOUNT.to_string(), TrustMode::Never)].into_iter().collect();
        let engine = ProcessEngine::new("signal-cli", trust);

        let args: Vec<String> = ["--account", "+4915199999999", "receive"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(engine.with_trust_policy(args.clone()), args);
    }

    #[tokio::test]
    async fn test_trust_policy_reaches_the_process() {
        let trust: TrustPolicies = [(ACCOUNT.to_string(), TrustMode::OnFirstUse)].into_iter().collect();
        let engine = ProcessEngine::new("echo", trust).with_timeout(Duration::from_secs(5));

        let out = engine
            .execute(true, vec!["-a".into(), ACCOUNT.into(), "send".into()], None)
            .await
            .unwrap();
        assert_eq!(out.trim(), format!("--trust-new-identities on-first-use -a {} send", ACCOUNT));
    }
}
