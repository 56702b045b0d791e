//! Agent invocation: run a coding-agent CLI as a child process.
//!
//! The invoker never interprets agent output; task-file state and
//! backpressure results carry all the semantics. Callers never branch on
//! agent kind: the tagged [`AgentCommand`] owns argument construction, and
//! everything downstream goes through the single `invoke` capability.

use crate::bus::EventBus;
use choo_core::events::{EventType, WireEvent};
use choo_core::Config;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace between SIGTERM and SIGKILL when a cancellation lands.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent binary not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent exited with code {0}")]
    ExitCode(i32),
    #[error("agent terminated by signal")]
    Killed,
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// How the agent CLI receives its prompt and bypasses permission gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// `claude -p <prompt> --dangerously-skip-permissions [--model <m>]`.
    Claude,
    /// Generic CLI reading the prompt from stdin.
    Stdin,
}

/// A resolved agent invocation target.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub kind: AgentKind,
    /// Program name or path; bare names resolve from PATH.
    pub program: String,
    pub model: Option<String>,
}

impl AgentCommand {
    /// Resolve a provider name through the config, applying command
    /// overrides. Unknown providers are an error so a bad `--provider`
    /// fails submit, not unit execution.
    pub fn resolve(provider: &str, config: &Config) -> std::result::Result<Self, String> {
        let override_cmd = config.provider_command(provider).map(str::to_string);
        match provider {
            "claude" => Ok(Self {
                kind: AgentKind::Claude,
                program: override_cmd.unwrap_or_else(|| "claude".to_string()),
                model: config.model.clone(),
            }),
            other => match override_cmd {
                Some(command) => Ok(Self {
                    kind: AgentKind::Stdin,
                    program: command,
                    model: config.model.clone(),
                }),
                None => Err(format!("unknown agent provider: {other}")),
            },
        }
    }

    fn build(&self, prompt: &str, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        match self.kind {
            AgentKind::Claude => {
                cmd.arg("-p")
                    .arg(prompt)
                    .arg("--dangerously-skip-permissions");
                if let Some(model) = &self.model {
                    cmd.arg("--model").arg(model);
                }
                cmd.stdin(Stdio::null());
            }
            AgentKind::Stdin => {
                cmd.stdin(Stdio::piped());
            }
        }
        cmd.current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, prompt: &str, workdir: &Path) -> Result<Child> {
        self.build(prompt, workdir).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotFound(self.program.clone())
            } else {
                AgentError::Io(e)
            }
        })
    }

    /// Run the agent, streaming stdout/stderr to the supplied writers.
    pub async fn invoke<O, E>(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        workdir: &Path,
        stdout_w: &mut O,
        stderr_w: &mut E,
    ) -> Result<()>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let mut child = self.spawn(prompt, workdir)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Stdin is fed concurrently with the output copies so a large prompt
        // cannot deadlock against a full stdout pipe.
        let feed = feed_stdin(stdin, prompt);
        let copy_out = async {
            if let Some(mut out) = stdout {
                tokio::io::copy(&mut out, stdout_w).await.map(|_| ())
            } else {
                Ok(())
            }
        };
        let copy_err = async {
            if let Some(mut err) = stderr {
                tokio::io::copy(&mut err, stderr_w).await.map(|_| ())
            } else {
                Ok(())
            }
        };

        let status = tokio::select! {
            result = async {
                let (fed, out, err) = tokio::join!(feed, copy_out, copy_err);
                fed?;
                out?;
                err?;
                child.wait().await
            } => result?,
            () = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(AgentError::Cancelled);
            }
        };

        exit_result(status)
    }

    /// Run the agent and capture stdout as a string, for callers that must
    /// parse a URL or JSON result.
    pub async fn invoke_capture(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        workdir: &Path,
    ) -> Result<String> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = self
            .invoke(cancel, prompt, workdir, &mut stdout, &mut stderr)
            .await;
        let captured = String::from_utf8_lossy(&stdout).into_owned();
        match result {
            Ok(()) => Ok(captured),
            Err(e) => {
                debug!(stderr = %String::from_utf8_lossy(&stderr), "agent invocation failed");
                Err(e)
            }
        }
    }

    /// Run the agent, framing per-line JSON from stdout onto the event bus.
    /// Non-JSON lines are silently ignored.
    pub async fn invoke_streaming(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        workdir: &Path,
        unit_id: &str,
        bus: &EventBus,
    ) -> Result<()> {
        let mut child = self.spawn(prompt, workdir)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let feed = feed_stdin(stdin, prompt);
        let unit = unit_id.to_string();
        let bus = bus.clone();
        let frame = async move {
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                        bus.emit(
                            WireEvent::new(EventType::AgentStream)
                                .with_unit(unit.clone())
                                .with_payload(&value),
                        );
                    }
                    // Non-JSON lines are ignored.
                }
            }
        };
        let drain_err = async {
            if let Some(mut err) = stderr {
                let _ = tokio::io::copy(&mut err, &mut tokio::io::sink()).await;
            }
        };

        let status = tokio::select! {
            result = async {
                let (fed, (), ()) = tokio::join!(feed, frame, drain_err);
                fed?;
                child.wait().await
            } => result?,
            () = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(AgentError::Cancelled);
            }
        };

        exit_result(status)
    }
}

async fn feed_stdin(stdin: Option<tokio::process::ChildStdin>, prompt: &str) -> std::io::Result<()> {
    if let Some(mut stdin) = stdin {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    Ok(())
}

fn exit_result(status: std::process::ExitStatus) -> Result<()> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(AgentError::ExitCode(code)),
        None => Err(AgentError::Killed),
    }
}

/// SIGTERM, then SIGKILL after the grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if !send_signal("-TERM", pid) {
            debug!(pid, "SIGTERM failed, child likely already gone");
        }
        let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        if graceful.is_err() {
            warn!(pid, "agent did not exit after SIGTERM, sending SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn send_signal(signal: &str, pid: u32) -> bool {
    std::process::Command::new("kill")
        .args([signal, &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use choo_core::config::{ProviderConfig, ProviderOverride};
    use tempfile::TempDir;

    fn stdin_agent(program: &str) -> AgentCommand {
        AgentCommand {
            kind: AgentKind::Stdin,
            program: program.to_string(),
            model: None,
        }
    }

    fn config_with_provider(name: &str, command: &str) -> Config {
        let mut config = Config::default();
        config.provider_config = ProviderConfig {
            provider_type: None,
            providers: [(
                name.to_string(),
                ProviderOverride {
                    command: Some(command.to_string()),
                },
            )]
            .into_iter()
            .collect(),
        };
        config
    }

    #[test]
    fn resolve_claude_defaults_to_path_lookup() {
        let config = Config::default();
        let agent = AgentCommand::resolve("claude", &config).unwrap();
        assert_eq!(agent.kind, AgentKind::Claude);
        assert_eq!(agent.program, "claude");
    }

    #[test]
    fn resolve_applies_command_override() {
        let config = config_with_provider("claude", "/opt/claude");
        let agent = AgentCommand::resolve("claude", &config).unwrap();
        assert_eq!(agent.program, "/opt/claude");
    }

    #[test]
    fn resolve_custom_provider_requires_command() {
        let config = Config::default();
        assert!(AgentCommand::resolve("mystery", &config).is_err());

        let config = config_with_provider("mystery", "/opt/mystery");
        let agent = AgentCommand::resolve("mystery", &config).unwrap();
        assert_eq!(agent.kind, AgentKind::Stdin);
        assert_eq!(agent.program, "/opt/mystery");
    }

    #[tokio::test]
    async fn invoke_streams_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho out-line\necho err-line >&2\n")
            .unwrap();
        make_executable(&script);

        let agent = stdin_agent(&script.to_string_lossy());
        let cancel = CancellationToken::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        agent
            .invoke(&cancel, "prompt", dir.path(), &mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(String::from_utf8_lossy(&stdout), "out-line\n");
        assert_eq!(String::from_utf8_lossy(&stderr), "err-line\n");
    }

    #[tokio::test]
    async fn invoke_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nexit 3\n").unwrap();
        make_executable(&script);

        let agent = stdin_agent(&script.to_string_lossy());
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        let mut err = Vec::new();

        let result = agent.invoke(&cancel, "p", dir.path(), &mut out, &mut err).await;
        assert!(matches!(result, Err(AgentError::ExitCode(3))));
    }

    #[tokio::test]
    async fn invoke_capture_returns_stdout() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho https://github.com/acme/repo/pull/42\n",
        )
        .unwrap();
        make_executable(&script);

        let agent = stdin_agent(&script.to_string_lossy());
        let cancel = CancellationToken::new();
        let output = agent.invoke_capture(&cancel, "p", dir.path()).await.unwrap();
        assert!(output.contains("pull/42"));
    }

    #[tokio::test]
    async fn stdin_agent_receives_prompt() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\ncat\n").unwrap();
        make_executable(&script);

        let agent = stdin_agent(&script.to_string_lossy());
        let cancel = CancellationToken::new();
        let output = agent
            .invoke_capture(&cancel, "the prompt text", dir.path())
            .await
            .unwrap();
        assert_eq!(output, "the prompt text");
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let dir = TempDir::new().unwrap();
        let agent = stdin_agent("/nonexistent/agent-binary");
        let cancel = CancellationToken::new();
        let result = agent.invoke_capture(&cancel, "p", dir.path()).await;
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancellation_terminates_child() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nsleep 60\n").unwrap();
        make_executable(&script);

        let agent = stdin_agent(&script.to_string_lossy());
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let result = agent.invoke_capture(&cancel, "p", dir.path()).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn streaming_frames_json_lines_onto_bus() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho '{\"kind\":\"thinking\"}'\necho not-json\necho '{\"kind\":\"done\"}'\n",
        )
        .unwrap();
        make_executable(&script);

        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let agent = stdin_agent(&script.to_string_lossy());
        let cancel = CancellationToken::new();
        agent
            .invoke_streaming(&cancel, "p", dir.path(), "alpha", &bus)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, "agent.stream");
        assert_eq!(first.unit.as_deref(), Some("alpha"));
        assert_eq!(first.payload.unwrap()["kind"], "thinking");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload.unwrap()["kind"], "done");
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}
