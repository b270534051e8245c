//! Command Execution Engine (§4.F): dispatches one-shot commands through
//! Docker, sudo and tmux awareness before running them on the remote shell,
//! then enriches and truncates the rendered output.

pub mod background;
pub mod sudo;
pub mod truncate;
pub mod tmux;

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::connection::{ConnectionRegistry, SshTransport};
use crate::credential::CredentialStore;
use crate::docker::{self, ContainerContextManager, ContextUpdate, ParsedCommand};
use crate::errors::{ConnectionError, ExecError};

pub use background::{BackgroundExecutor, BackgroundTask};

/// The result of running a command on the remote shell.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Per-call overrides for [`ExecutionEngine::execute_command`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
    pub force: bool,
}

/// Dispatches `executeCommand` and `backgroundExecute`/`stopBackground`.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<CredentialStore>,
    contexts: Arc<ContainerContextManager>,
    background: BackgroundExecutor,
    default_timeout_ms: u64,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        credentials: Arc<CredentialStore>,
        contexts: Arc<ContainerContextManager>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            credentials,
            contexts,
            background: BackgroundExecutor::new(),
            default_timeout_ms,
        }
    }

    pub async fn execute_command(
        &self,
        connection_id: &str,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<CommandOutcome, ExecError> {
        if !self.registry.is_connected(connection_id) {
            return Err(ExecError::Connection(ConnectionError::NotConnected(connection_id.to_string())));
        }
        self.registry.touch(connection_id);
        let timeout_ms = options.timeout_ms.unwrap_or(self.default_timeout_ms);

        let parsed = docker::parse(command);

        let mut effective_command = match route_docker(&self.contexts, connection_id, &parsed) {
            DockerRoute::Direct => {
                let transport = self.registry.transport(connection_id)?;
                let _op_guard = transport.op_lock.lock().await;
                let outcome = self.run_docker_direct(connection_id, &transport, &parsed, timeout_ms).await?;
                return self.finish(outcome);
            }
            DockerRoute::Command(cmd) => cmd,
        };

        if let Some(cwd) = &options.cwd {
            effective_command = format!("cd {cwd} && {effective_command}");
        }

        if sudo::contains_sudo(&effective_command) {
            let cred = self.credentials.load(connection_id);
            if let Some(password) = cred.password {
                effective_command = sudo::rewrite_with_password(&effective_command, &password);
            }
        }

        if let Some(session) = tmux::parse_send_keys_target(&effective_command) {
            let transport = self.registry.transport(connection_id)?;
            let _op_guard = transport.op_lock.lock().await;
            let outcome = self
                .run_tmux_send_keys(&transport, &session, &effective_command, timeout_ms, options.force)
                .await?;
            return self.finish(outcome);
        }

        let transport = self.registry.transport(connection_id)?;
        let _op_guard = transport.op_lock.lock().await;
        let outcome = raw_exec(&transport, &effective_command, timeout_ms).await?;

        if command.trim_start().starts_with("cd ") && outcome.exit_code == 0 {
            if let Ok(pwd) = raw_exec(&transport, "pwd", timeout_ms).await {
                self.registry.set_current_directory(connection_id, pwd.stdout.trim().to_string());
            }
        }
        drop(_op_guard);

        self.finish(outcome)
    }

    async fn run_docker_direct(
        &self,
        connection_id: &str,
        transport: &Arc<SshTransport>,
        parsed: &ParsedCommand,
        timeout_ms: u64,
    ) -> Result<CommandOutcome, ExecError> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;

        match parsed {
            ParsedCommand::DockerExec(segment) => {
                self.contexts.set_context(
                    connection_id,
                    &segment.container,
                    ContextUpdate {
                        workdir: segment.workdir.clone(),
                        env: segment.env.clone(),
                        user: segment.user.clone(),
                    },
                );
                let outcome = raw_exec(transport, &segment.original, timeout_ms).await?;
                stdout.push_str(&outcome.stdout);
                stderr.push_str(&outcome.stderr);
                exit_code = outcome.exit_code;
            }
            ParsedCommand::Compound { segments, .. } => {
                let mut last_container: Option<String> = None;
                let mut pending_regular = Vec::new();

                for segment in segments {
                    match segment {
                        ParsedCommand::DockerExec(de) => {
                            self.contexts.set_context(
                                connection_id,
                                &de.container,
                                ContextUpdate {
                                    workdir: de.workdir.clone(),
                                    env: de.env.clone(),
                                    user: de.user.clone(),
                                },
                            );
                            let outcome = raw_exec(transport, &de.original, timeout_ms).await?;
                            stdout.push_str(&outcome.stdout);
                            stderr.push_str(&outcome.stderr);
                            exit_code = outcome.exit_code;
                            last_container = Some(de.container.clone());
                            if exit_code != 0 {
                                break;
                            }
                        }
                        ParsedCommand::Regular(cmd) => pending_regular.push(cmd.clone()),
                        _ => {}
                    }
                }

                if exit_code == 0 && !pending_regular.is_empty() {
                    if let Some(container) = last_container {
                        let joined = pending_regular.join(" && ");
                        let wrapped = format!("docker exec {container} sh -c \"{joined}\"");
                        let outcome = raw_exec(transport, &wrapped, timeout_ms).await?;
                        stdout.push_str(&outcome.stdout);
                        stderr.push_str(&outcome.stderr);
                        exit_code = outcome.exit_code;
                    }
                }
            }
            _ => unreachable!("run_docker_direct only called for DockerExec/Compound routes"),
        }

        Ok(CommandOutcome { stdout, stderr, exit_code, timed_out: false })
    }

    async fn run_tmux_send_keys(
        &self,
        transport: &Arc<SshTransport>,
        session: &str,
        command: &str,
        timeout_ms: u64,
        force: bool,
    ) -> Result<CommandOutcome, ExecError> {
        let before = raw_exec(transport, &format!("tmux capture-pane -p -t {session}"), timeout_ms)
            .await?
            .stdout;

        if !force {
            if let Some(reason) = self.tmux_blocked_reason(transport, session, &before, timeout_ms).await? {
                return Err(ExecError::TmuxBlocked(reason));
            }
        }

        let sent = raw_exec(transport, command, timeout_ms).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = raw_exec(transport, &format!("tmux capture-pane -p -t {session}"), timeout_ms)
            .await?
            .stdout;

        let appended = tmux::new_lines(&before, &after);
        let window = tmux::context_window(&before, &appended);

        Ok(CommandOutcome {
            stdout: window.join("\n"),
            stderr: sent.stderr,
            exit_code: sent.exit_code,
            timed_out: false,
        })
    }

    async fn tmux_blocked_reason(
        &self,
        transport: &Arc<SshTransport>,
        session: &str,
        before_capture: &str,
        timeout_ms: u64,
    ) -> Result<Option<String>, ExecError> {
        let panes = raw_exec(
            transport,
            &format!("tmux list-panes -t {session} -F \"#{{pane_pid}} #{{pane_current_command}}\""),
            timeout_ms,
        )
        .await?;
        let Some((pid, pane_command)) = tmux::parse_pane_line(panes.stdout.lines().next().unwrap_or("")) else {
            return Ok(None);
        };

        let ps = raw_exec(transport, &format!("ps -o state= -p {pid}"), timeout_ms).await?;
        let state = ps.stdout.trim().chars().next();

        let children = raw_exec(transport, &format!("pgrep -P {pid}"), timeout_ms).await?;
        let has_child = !children.stdout.trim().is_empty();

        if !tmux::is_blocked(state, &pane_command, has_child) {
            return Ok(None);
        }

        let tail: String = before_capture.lines().rev().take(10).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
        let ps_line = format!("pid={pid} state={}", state.map(String::from).unwrap_or_default());
        Ok(Some(tmux::build_blocked_message(session, &pane_command, &ps_line, &tail)))
    }

    fn finish(&self, outcome: CommandOutcome) -> Result<CommandOutcome, ExecError> {
        if outcome.timed_out {
            return Err(ExecError::Connection(ConnectionError::Timeout(self.default_timeout_ms)));
        }
        let rendered = render(&outcome);
        let stdout = truncate::truncate_default(&rendered);
        if outcome.exit_code != 0 {
            return Err(ExecError::CommandFailed { code: outcome.exit_code, stderr: outcome.stderr });
        }
        Ok(CommandOutcome { stdout, ..outcome })
    }

    pub async fn background_execute(&self, connection_id: &str, command: &str, interval_ms: u64, cwd: Option<String>) {
        let engine = self.clone();
        let registry = self.registry.clone();
        let conn_id = connection_id.to_string();

        self.background
            .start(
                connection_id,
                command,
                interval_ms,
                {
                    let conn_id = conn_id.clone();
                    let cwd = cwd.clone();
                    move |command| {
                        let engine = engine.clone();
                        let conn_id = conn_id.clone();
                        let cwd = cwd.clone();
                        async move {
                            engine
                                .execute_command(&conn_id, &command, ExecuteOptions { cwd, timeout_ms: None, force: false })
                                .await
                                .map(|_| ())
                                .map_err(|e| e.to_string())
                        }
                    }
                },
                move |_| {
                    let registry = registry.clone();
                    let conn_id = conn_id.clone();
                    async move { registry.is_connected(&conn_id) }
                },
            )
            .await;
    }

    pub async fn stop_background(&self, connection_id: &str) {
        self.background.stop(connection_id).await;
    }

    pub async fn list_background_tasks(&self) -> Vec<BackgroundTask> {
        self.background.list().await
    }

    pub async fn stop_all_background_tasks(&self) {
        self.background.stop_all().await;
    }
}

/// Which path a parsed command takes through the Docker dispatch step.
#[derive(Debug, PartialEq, Eq)]
enum DockerRoute {
    /// A single `docker exec` or a compound line needing container context:
    /// the engine runs the segments directly and returns their output.
    Direct,
    /// A command string to continue through sudo/tmux dispatch and execution.
    Command(String),
}

fn route_docker(contexts: &ContainerContextManager, connection_id: &str, parsed: &ParsedCommand) -> DockerRoute {
    match parsed {
        ParsedCommand::DockerExec(_) => DockerRoute::Direct,
        ParsedCommand::Compound { needs_container_context: true, .. } => DockerRoute::Direct,
        ParsedCommand::Regular(_) => match contexts.active_container(connection_id) {
            Some((name, session)) => {
                DockerRoute::Command(ContainerContextManager::build_exec(&name, parsed.original(), &session, false))
            }
            None => DockerRoute::Command(parsed.original().to_string()),
        },
        _ => DockerRoute::Command(parsed.original().to_string()),
    }
}

fn render(outcome: &CommandOutcome) -> String {
    if outcome.stderr.is_empty() {
        outcome.stdout.clone()
    } else {
        format!("{}\n{}", outcome.stdout, outcome.stderr)
    }
}

async fn raw_exec(transport: &Arc<SshTransport>, command: &str, timeout_ms: u64) -> Result<CommandOutcome, ExecError> {
    let transport = transport.clone();
    let command = command.to_string();
    tokio::task::spawn_blocking(move || raw_exec_blocking(&transport, &command, timeout_ms))
        .await
        .map_err(|e| ExecError::Io(std::io::Error::other(e.to_string())))?
}

fn raw_exec_blocking(transport: &SshTransport, command: &str, timeout_ms: u64) -> Result<CommandOutcome, ExecError> {
    let _guard = transport.exec_lock.lock().expect("exec lock poisoned");
    debug!(command = %redact_sudo_payload(command), "executing command");

    transport.session.set_timeout(timeout_ms as u32);
    let mut channel = transport.session.channel_session()?;
    channel.exec(command)?;

    let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1));
    let mut stdout = String::new();
    let mut stderr = String::new();

    if read_until(&mut channel, &mut stdout, deadline).is_err() {
        channel.close().ok();
        return Ok(CommandOutcome { stdout, stderr, exit_code: 1, timed_out: true });
    }
    if read_until_stderr(&mut channel, &mut stderr, deadline).is_err() {
        channel.close().ok();
        return Ok(CommandOutcome { stdout, stderr, exit_code: 1, timed_out: true });
    }

    channel.wait_close().ok();
    let exit_code = channel.exit_status().unwrap_or(-1);
    Ok(CommandOutcome { stdout, stderr, exit_code, timed_out: false })
}

fn read_until(channel: &mut ssh2::Channel, out: &mut String, deadline: Instant) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "command timed out"));
        }
        match channel.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => out.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) => return Err(e),
        }
    }
}

fn read_until_stderr(channel: &mut ssh2::Channel, out: &mut String, deadline: Instant) -> std::io::Result<()> {
    let mut stream = channel.stderr();
    let mut buf = [0u8; 8192];
    loop {
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "command timed out"));
        }
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => out.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) => return Err(e),
        }
    }
}

fn redact_sudo_payload(command: &str) -> String {
    if command.contains("echo \"") && command.contains("sudo -S") {
        "<redacted sudo invocation>".to_string()
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ContextUpdate;

    #[test]
    fn regular_command_without_context_passes_through() {
        let contexts = ContainerContextManager::new();
        let parsed = docker::parse("ls -la");
        let route = route_docker(&contexts, "c1", &parsed);
        assert_eq!(route, DockerRoute::Command("ls -la".into()));
    }

    #[test]
    fn regular_command_with_active_container_is_wrapped() {
        let contexts = ContainerContextManager::new();
        contexts.set_context("c1", "web", ContextUpdate { workdir: Some("/srv".into()), ..Default::default() });
        let parsed = docker::parse("ls");
        let route = route_docker(&contexts, "c1", &parsed);
        assert_eq!(route, DockerRoute::Command("docker exec -w /srv web ls".into()));
    }

    #[test]
    fn single_docker_exec_routes_direct() {
        let contexts = ContainerContextManager::new();
        let parsed = docker::parse("docker exec -w /srv -u www-data web ls");
        assert_eq!(route_docker(&contexts, "c1", &parsed), DockerRoute::Direct);
    }

    #[test]
    fn compound_needing_context_routes_direct() {
        let contexts = ContainerContextManager::new();
        let parsed = docker::parse("docker exec -w /app api pwd && ls");
        assert_eq!(route_docker(&contexts, "c1", &parsed), DockerRoute::Direct);
    }

    #[test]
    fn docker_run_passes_through_untouched() {
        let contexts = ContainerContextManager::new();
        let parsed = docker::parse("docker run -it ubuntu bash");
        assert_eq!(route_docker(&contexts, "c1", &parsed), DockerRoute::Command("docker run -it ubuntu bash".into()));
    }

    #[test]
    fn render_joins_stdout_and_stderr() {
        let outcome = CommandOutcome { stdout: "out".into(), stderr: "err".into(), exit_code: 0, timed_out: false };
        assert_eq!(render(&outcome), "out\nerr");
    }

    #[test]
    fn render_skips_empty_stderr() {
        let outcome = CommandOutcome { stdout: "out".into(), stderr: String::new(), exit_code: 0, timed_out: false };
        assert_eq!(render(&outcome), "out");
    }

    #[test]
    fn redact_hides_sudo_password_payload() {
        let command = sudo::rewrite_with_password("sudo id", "hunter2");
        let redacted = redact_sudo_payload(&command);
        assert!(!redacted.contains("hunter2"));
    }
}
