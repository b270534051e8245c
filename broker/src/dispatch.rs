//! Tool Dispatcher (§4.J): maps each §6 tool name onto the core operation
//! that implements it, shaping every outcome as `{text, isError, ...}`
//! per §7 ("tool-level failures are returned as a normal response with
//! `isError: true`; transport faults are out of scope for the core").

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use ssh_broker_core::connection::{AuthConfig, ConnectionConfig, ConnectionRegistry, ReconnectPolicy};
use ssh_broker_core::credential::CredentialStore;
use ssh_broker_core::docker::{self, ContainerContextManager};
use ssh_broker_core::errors::BrokerError;
use ssh_broker_core::events::EventBus;
use ssh_broker_core::exec::{ExecuteOptions, ExecutionEngine};
use ssh_broker_core::pty::{PtyManager, PtyOptions, TerminalData};
use ssh_broker_core::sftp::{BatchItem, SftpManager, TransferDirection, TransferEvent};
use ssh_broker_core::tunnel::{TunnelEvent, TunnelForwarder};
use tracing::warn;

use crate::protocol::errors;
use crate::protocol::messages::{JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::tools::*;

/// The result of dispatching one request: either a normal JSON-RPC
/// response (which may itself carry `isError: true` in its result) or a
/// transport-level JSON-RPC error.
pub enum DispatchResponse {
    Ok(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

impl DispatchResponse {
    pub fn to_json(&self) -> Value {
        match self {
            DispatchResponse::Ok(r) => serde_json::to_value(r).expect("JsonRpcResponse always serializes"),
            DispatchResponse::Error(e) => serde_json::to_value(e).expect("JsonRpcErrorResponse always serializes"),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<CredentialStore>,
    contexts: Arc<ContainerContextManager>,
    exec: Arc<ExecutionEngine>,
    sftp: Arc<SftpManager>,
    tunnels: Arc<TunnelForwarder>,
    pty: Arc<PtyManager>,
    default_ssh_port: u16,
    reconnect_attempts: u32,
    connection_timeout_ms: u64,
    notifications: Arc<EventBus<JsonRpcNotification>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        credentials: Arc<CredentialStore>,
        contexts: Arc<ContainerContextManager>,
        exec: Arc<ExecutionEngine>,
        sftp: Arc<SftpManager>,
        tunnels: Arc<TunnelForwarder>,
        pty: Arc<PtyManager>,
        default_ssh_port: u16,
        reconnect_attempts: u32,
        connection_timeout_ms: u64,
    ) -> Self {
        let dispatcher = Self {
            registry,
            credentials,
            contexts,
            exec,
            sftp,
            tunnels,
            pty,
            default_ssh_port,
            reconnect_attempts,
            connection_timeout_ms,
            notifications: Arc::new(EventBus::new()),
        };
        dispatcher.spawn_notification_bridges();
        dispatcher
    }

    pub fn subscribe_notifications(&self) -> tokio::sync::mpsc::UnboundedReceiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    /// Forward the SFTP, tunnel, and PTY event buses onto the single
    /// notification bus the transport loop drains (§9).
    fn spawn_notification_bridges(&self) {
        let mut transfer_rx = self.sftp.subscribe();
        let notifications = self.notifications.clone();
        tokio::spawn(async move {
            while let Some(event) = transfer_rx.recv().await {
                let (method, transfer) = match event {
                    TransferEvent::Progress(t) => ("transfer.progress", t),
                    TransferEvent::Completed(t) => ("transfer.completed", t),
                    TransferEvent::Failed(t) => ("transfer.failed", t),
                };
                notifications.emit(JsonRpcNotification::new(method, serde_json::to_value(transfer).unwrap_or(Value::Null)));
            }
        });

        let mut tunnel_rx = self.tunnels.subscribe();
        let notifications = self.notifications.clone();
        tokio::spawn(async move {
            while let Some(event) = tunnel_rx.recv().await {
                let TunnelEvent::Closed(id) = event;
                notifications.emit(JsonRpcNotification::new("tunnel.closed", json!({"tunnelId": id})));
            }
        });

        let mut terminal_rx = self.pty.subscribe();
        let notifications = self.notifications.clone();
        tokio::spawn(async move {
            while let Some(TerminalData { session_id, data }) = terminal_rx.recv().await {
                notifications.emit(JsonRpcNotification::new(
                    "terminal.data",
                    json!({"sessionId": session_id, "data": BASE64.encode(&data)}),
                ));
            }
        });
    }

    pub async fn dispatch(&self, request: JsonRpcRequest) -> DispatchResponse {
        let id = request.id.clone();
        let result = self.call(&request.method, request.params).await;
        match result {
            Ok(value) => DispatchResponse::Ok(JsonRpcResponse::new(id, value)),
            Err(DispatchError::UnknownMethod) => DispatchResponse::Error(JsonRpcErrorResponse::new(
                id,
                errors::METHOD_NOT_FOUND,
                format!("unknown tool: {}", request.method),
            )),
            Err(DispatchError::InvalidParams(message)) => {
                DispatchResponse::Error(JsonRpcErrorResponse::new(id, errors::INVALID_PARAMS, message))
            }
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, DispatchError> {
        match method {
            "connect" => self.connect(args(params)?).await,
            "disconnect" => Ok(self.disconnect(args(params)?)),
            "getConnection" => Ok(self.get_connection(args(params)?)),
            "deleteConnection" => Ok(self.delete_connection(args(params)?)),
            "listConnections" => Ok(self.list_connections()),
            "executeCommand" => Ok(self.execute_command(args(params)?).await),
            "backgroundExecute" => Ok(self.background_execute(args(params)?).await),
            "stopBackground" => Ok(self.stop_background(args(params)?).await),
            "listActiveSessions" => Ok(self.list_active_sessions()),
            "listBackgroundTasks" => Ok(self.list_background_tasks().await),
            "stopAllBackgroundTasks" => Ok(self.stop_all_background_tasks().await),
            "uploadFile" => Ok(self.upload_file(args(params)?).await),
            "downloadFile" => Ok(self.download_file(args(params)?).await),
            "batchUploadFiles" => Ok(self.batch_transfer(args(params)?, TransferDirection::Upload).await),
            "batchDownloadFiles" => Ok(self.batch_transfer(args(params)?, TransferDirection::Download).await),
            "getFileTransferStatus" => Ok(self.file_transfer_status(args(params)?)),
            "listFileTransfers" => Ok(self.list_file_transfers()),
            "createTunnel" => Ok(self.create_tunnel(args(params)?).await),
            "closeTunnel" => Ok(self.close_tunnel(args(params)?)),
            "listTunnels" => Ok(self.list_tunnels()),
            "createTerminalSession" => Ok(self.create_terminal_session(args(params)?).await),
            "writeToTerminal" => Ok(self.write_to_terminal(args(params)?)),
            "executeCommandInDocker" => Ok(self.execute_command_in_docker(args(params)?).await),
            "diagnoseContainerEnvironment" => Ok(self.diagnose_container_environment(args(params)?).await),
            _ => Err(DispatchError::UnknownMethod),
        }
    }

    async fn connect(&self, args: ConnectArgs) -> Result<Value, DispatchError> {
        let config = ConnectionConfig {
            host: args.host,
            port: args.port.unwrap_or(self.default_ssh_port),
            username: args.username,
            auth: AuthConfig {
                password: args.password,
                private_key: args.private_key,
                passphrase: args.passphrase,
            },
            keep_alive_ms: self.connection_timeout_ms,
            ready_timeout_ms: self.connection_timeout_ms,
            reconnect: ReconnectPolicy {
                enabled: true,
                max_tries: self.reconnect_attempts,
                delay_ms: 2_000,
            },
            name: args.name,
            tags: args.tags,
        };

        match self.registry.connect(config, args.remember_password).await {
            Ok(summary) => Ok(json!({
                "text": format!("connected to {}@{} as connection {}", summary.username, summary.host, summary.id),
                "isError": false,
                "connection": summary,
            })),
            Err(e) => Ok(err_result(e)),
        }
    }

    fn disconnect(&self, args: ConnectionIdArgs) -> Value {
        self.tunnels.close_for_connection(&args.connection_id);
        self.pty.close_for_connection(&args.connection_id);
        let existed = self.registry.disconnect(&args.connection_id);
        tool_text(existed, format!("connection {} disconnected", args.connection_id), "connection not found")
    }

    fn get_connection(&self, args: ConnectionIdArgs) -> Value {
        match self.registry.get(&args.connection_id) {
            Some(summary) => json!({"text": "ok", "isError": false, "connection": summary}),
            None => json!({"text": format!("connection {} not found", args.connection_id), "isError": true}),
        }
    }

    fn delete_connection(&self, args: ConnectionIdArgs) -> Value {
        self.tunnels.close_for_connection(&args.connection_id);
        self.pty.close_for_connection(&args.connection_id);
        let existed = self.registry.delete(&args.connection_id);
        tool_text(existed, format!("connection {} deleted", args.connection_id), "connection not found")
    }

    fn list_connections(&self) -> Value {
        let connections = self.registry.list();
        json!({"text": format!("{} connection(s)", connections.len()), "isError": false, "connections": connections})
    }

    async fn execute_command(&self, args: ExecuteCommandArgs) -> Value {
        let options = ExecuteOptions {
            cwd: args.cwd,
            timeout_ms: args.timeout,
            force: args.force,
        };
        match self.exec.execute_command(&args.connection_id, &args.command, options).await {
            Ok(outcome) => json!({"text": outcome.stdout, "isError": false, "exitCode": outcome.exit_code}),
            Err(e) => err_result(e),
        }
    }

    async fn background_execute(&self, args: BackgroundExecuteArgs) -> Value {
        self.exec
            .background_execute(&args.connection_id, &args.command, args.interval, args.cwd)
            .await;
        json!({"text": format!("background task started on {}", args.connection_id), "isError": false})
    }

    async fn stop_background(&self, args: ConnectionIdArgs) -> Value {
        self.exec.stop_background(&args.connection_id).await;
        json!({"text": format!("background task on {} stopped", args.connection_id), "isError": false})
    }

    fn list_active_sessions(&self) -> Value {
        let sessions: Vec<Value> = self
            .pty
            .list()
            .into_iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "connectionId": s.connection_id,
                    "rows": s.rows,
                    "cols": s.cols,
                    "term": s.term,
                    "isActive": s.is_active,
                    "sudoPasswordPrompt": s.sudo_password_prompt,
                })
            })
            .collect();
        json!({"text": format!("{} active session(s)", sessions.len()), "isError": false, "sessions": sessions})
    }

    async fn list_background_tasks(&self) -> Value {
        let tasks = self.exec.list_background_tasks().await;
        json!({"text": format!("{} background task(s)", tasks.len()), "isError": false, "tasks": tasks.iter().map(|t| json!({
            "connectionId": t.connection_id,
            "command": t.command,
            "intervalMs": t.interval_ms,
            "lastCheck": t.last_check,
            "lastError": t.last_error,
        })).collect::<Vec<_>>()})
    }

    async fn stop_all_background_tasks(&self) -> Value {
        self.exec.stop_all_background_tasks().await;
        json!({"text": "all background tasks stopped", "isError": false})
    }

    async fn upload_file(&self, args: UploadFileArgs) -> Value {
        match self.sftp.upload(&args.connection_id, &args.local_path, &args.remote_path).await {
            Ok(transfer) => json!({"text": format!("uploaded {} bytes", transfer.size), "isError": false, "transferId": transfer.id}),
            Err(e) => err_result(e),
        }
    }

    async fn download_file(&self, args: DownloadFileArgs) -> Value {
        match self.sftp.download(&args.connection_id, &args.remote_path, &args.local_path).await {
            Ok(transfer) => json!({"text": format!("downloaded {} bytes", transfer.size), "isError": false, "transferId": transfer.id}),
            Err(e) => err_result(e),
        }
    }

    async fn batch_transfer(&self, args: BatchTransferArgs, direction: TransferDirection) -> Value {
        let items: Vec<BatchItem> = args
            .files
            .into_iter()
            .map(|f| BatchItem { local_path: f.local_path, remote_path: f.remote_path })
            .collect();
        let result = self.sftp.batch(&args.connection_id, &items, direction).await;
        json!({
            "text": format!("{} succeeded, {} failed", result.succeeded, result.failed),
            "isError": result.failed > 0 && result.succeeded == 0,
            "transferIds": result.transfer_ids,
            "succeeded": result.succeeded,
            "failed": result.failed,
        })
    }

    fn file_transfer_status(&self, args: FileTransferStatusArgs) -> Value {
        match args.transfer_id {
            Some(id) => match self.sftp.get(&id) {
                Some(transfer) => json!({"text": "ok", "isError": false, "transfer": transfer}),
                None => json!({"text": format!("transfer {id} not found"), "isError": true}),
            },
            None => self.list_file_transfers(),
        }
    }

    fn list_file_transfers(&self) -> Value {
        let transfers = self.sftp.list();
        json!({"text": format!("{} transfer(s)", transfers.len()), "isError": false, "transfers": transfers})
    }

    async fn create_tunnel(&self, args: CreateTunnelArgs) -> Value {
        match self
            .tunnels
            .create_tunnel(&args.connection_id, args.local_port, &args.remote_host, args.remote_port, args.description)
            .await
        {
            Ok(id) => json!({"text": format!("tunnel listening on 127.0.0.1:{}", args.local_port), "isError": false, "tunnelId": id}),
            Err(e) => err_result(e),
        }
    }

    fn close_tunnel(&self, args: TunnelIdArgs) -> Value {
        let closed = self.tunnels.close_tunnel(&args.tunnel_id);
        tool_text(closed, format!("tunnel {} closed", args.tunnel_id), "tunnel not found")
    }

    fn list_tunnels(&self) -> Value {
        let tunnels = self.tunnels.list();
        json!({"text": format!("{} tunnel(s)", tunnels.len()), "isError": false, "tunnels": tunnels.iter().map(|t| json!({
            "id": t.id,
            "connectionId": t.connection_id,
            "localPort": t.local_port,
            "remoteHost": t.remote_host,
            "remotePort": t.remote_port,
            "description": t.description,
            "active": t.active,
            "livePairs": t.live_pairs,
        })).collect::<Vec<_>>()})
    }

    async fn create_terminal_session(&self, args: CreateTerminalSessionArgs) -> Value {
        let options = PtyOptions { rows: args.rows, cols: args.cols, term: args.term };
        match self.pty.create(&args.connection_id, options).await {
            Ok(id) => json!({"text": "terminal session created", "isError": false, "sessionId": id}),
            Err(e) => err_result(e),
        }
    }

    fn write_to_terminal(&self, args: WriteToTerminalArgs) -> Value {
        match self.pty.write(&args.session_id, args.data.as_bytes()) {
            Ok(()) => json!({"text": "ok", "isError": false, "success": true}),
            Err(e) => err_result(e),
        }
    }

    async fn execute_command_in_docker(&self, args: ExecuteCommandInDockerArgs) -> Value {
        self.contexts.set_context(
            &args.connection_id,
            &args.container_name,
            docker::ContextUpdate {
                workdir: args.workdir,
                env: Vec::new(),
                user: args.user,
            },
        );
        let active = self.contexts.active_container(&args.connection_id);
        let Some((name, session)) = active else {
            return json!({"text": format!("container {} not found", args.container_name), "isError": true});
        };
        let command = ContainerContextManager::build_exec(&name, &args.command, &session, args.interactive);
        let options = ExecuteOptions { cwd: None, timeout_ms: args.timeout, force: false };
        match self.exec.execute_command(&args.connection_id, &command, options).await {
            Ok(outcome) => json!({"text": outcome.stdout, "isError": false, "exitCode": outcome.exit_code}),
            Err(e) => err_result(e),
        }
    }

    /// Probe a container for the package manager and tooling available,
    /// optionally checking whether `packageName` is installed. Not part
    /// of the core crate: this composes `executeCommand` calls the same
    /// way an orchestrator script would, so it belongs at the dispatch
    /// layer rather than inside the execution engine.
    async fn diagnose_container_environment(&self, args: DiagnoseContainerEnvironmentArgs) -> Value {
        let probe = format!(
            "for pm in apt apt-get apk yum dnf; do command -v $pm >/dev/null 2>&1 && echo \"package_manager=$pm\"; done; \
             uname -a; cat /etc/os-release 2>/dev/null | head -5"
        );
        let command = format!("docker exec {} sh -c '{}'", args.container_name, probe);
        let options = ExecuteOptions { cwd: None, timeout_ms: args.timeout, force: false };

        let probe_result = match self.exec.execute_command(&args.connection_id, &command, options.clone()).await {
            Ok(outcome) => outcome.stdout,
            Err(e) => return err_result(e),
        };

        let mut report = probe_result;
        if let Some(package) = &args.package_name {
            let check = format!(
                "docker exec {} sh -c 'command -v {p} >/dev/null 2>&1 && echo \"{p} found\" || echo \"{p} missing\"'",
                args.container_name,
                p = package
            );
            match self.exec.execute_command(&args.connection_id, &check, options).await {
                Ok(outcome) => {
                    report.push('\n');
                    report.push_str(&outcome.stdout);
                }
                Err(e) => warn!(container = %args.container_name, error = %e, "package check failed during diagnosis"),
            }
        }

        json!({"text": report, "isError": false})
    }

    pub fn sweep(&self) {
        self.sftp.sweep();
        self.pty.sweep();
        self.contexts.sweep_inactive(None);
    }
}

enum DispatchError {
    UnknownMethod,
    InvalidParams(String),
}

fn args<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, DispatchError> {
    serde_json::from_value(params).map_err(|e| DispatchError::InvalidParams(e.to_string()))
}

fn err_result(e: impl Into<BrokerError>) -> Value {
    let broker: BrokerError = e.into();
    json!({"text": broker.to_string(), "isError": true, "errorKind": broker.kind().as_str()})
}

fn tool_text(success: bool, ok_message: String, not_found_message: &str) -> Value {
    if success {
        json!({"text": ok_message, "isError": false})
    } else {
        json!({"text": not_found_message, "isError": true})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tool_text_reports_not_found() {
        let value = tool_text(false, "ok".into(), "missing");
        assert_eq!(value["isError"], true);
        assert_eq!(value["text"], "missing");
    }

    fn test_dispatcher(data_dir: &std::path::Path) -> Dispatcher {
        let credentials = Arc::new(CredentialStore::with_backend(Box::new(NullBackend)));
        let registry = Arc::new(ConnectionRegistry::new(credentials.clone(), data_dir));
        let contexts = Arc::new(ContainerContextManager::new());
        let exec = Arc::new(ExecutionEngine::new(registry.clone(), credentials.clone(), contexts.clone(), 10_000));
        let sftp = Arc::new(SftpManager::new(registry.clone()));
        let tunnels = Arc::new(TunnelForwarder::new(registry.clone()));
        let pty = Arc::new(PtyManager::new(registry.clone(), credentials.clone()));
        Dispatcher::new(registry, credentials, contexts, exec, sftp, tunnels, pty, 22, 3, 10_000)
    }

    struct NullBackend;
    impl ssh_broker_core::credential::CredentialBackend for NullBackend {
        fn save(&self, _: &str, _: &ssh_broker_core::credential::Credential) -> Result<(), ssh_broker_core::errors::CredentialError> {
            Ok(())
        }
        fn load(&self, _: &str) -> Result<ssh_broker_core::credential::Credential, ssh_broker_core::errors::CredentialError> {
            Ok(ssh_broker_core::credential::Credential::default())
        }
        fn delete(&self, _: &str) -> Result<(), ssh_broker_core::errors::CredentialError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_method_is_reported_as_method_not_found() {
        let dir = tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: "frobnicate".into(),
            params: Value::Null,
            id: json!(1),
        };
        match dispatcher.dispatch(request).await {
            DispatchResponse::Error(e) => assert_eq!(e.error.code, errors::METHOD_NOT_FOUND),
            DispatchResponse::Ok(_) => panic!("expected a transport-level error"),
        }
    }

    #[tokio::test]
    async fn malformed_params_are_reported_as_invalid_params() {
        let dir = tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: "executeCommand".into(),
            params: json!({"connectionId": "c1"}),
            id: json!(2),
        };
        match dispatcher.dispatch(request).await {
            DispatchResponse::Error(e) => assert_eq!(e.error.code, errors::INVALID_PARAMS),
            DispatchResponse::Ok(_) => panic!("expected invalid params"),
        }
    }

    #[tokio::test]
    async fn list_connections_on_empty_registry_reports_zero() {
        let dir = tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: "listConnections".into(),
            params: Value::Null,
            id: json!(3),
        };
        match dispatcher.dispatch(request).await {
            DispatchResponse::Ok(r) => {
                assert_eq!(r.result["isError"], false);
                assert_eq!(r.result["connections"].as_array().unwrap().len(), 0);
            }
            DispatchResponse::Error(_) => panic!("expected an ok response"),
        }
    }

    #[tokio::test]
    async fn execute_command_on_unknown_connection_is_not_connected_error() {
        let dir = tempdir().unwrap();
        let dispatcher = test_dispatcher(dir.path());
        let request = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: "executeCommand".into(),
            params: json!({"connectionId": "missing", "command": "echo hi"}),
            id: json!(4),
        };
        match dispatcher.dispatch(request).await {
            DispatchResponse::Ok(r) => {
                assert_eq!(r.result["isError"], true);
                assert_eq!(r.result["errorKind"], "not_connected");
            }
            DispatchResponse::Error(_) => panic!("tool-level failure must not be a transport error"),
        }
    }
}
