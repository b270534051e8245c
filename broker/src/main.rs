mod dispatch;
mod protocol;
mod tools;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use ssh_broker_core::config::BrokerConfig;
use ssh_broker_core::connection::ConnectionRegistry;
use ssh_broker_core::credential::CredentialStore;
use ssh_broker_core::docker::ContainerContextManager;
use ssh_broker_core::exec::ExecutionEngine;
use ssh_broker_core::pty::PtyManager;
use ssh_broker_core::sftp::SftpManager;
use ssh_broker_core::singleton::SingletonGuard;
use ssh_broker_core::tunnel::TunnelForwarder;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dispatch::Dispatcher;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("mcp-ssh-broker {} starting", VERSION);

    let config = BrokerConfig::from_env();
    let data_dir = config.resolve_data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let guard = SingletonGuard::acquire(&config.resolve_lock_path())?;

    let credentials = Arc::new(CredentialStore::auto(&data_dir));
    let registry = Arc::new(ConnectionRegistry::new(credentials.clone(), &data_dir));
    let contexts = Arc::new(ContainerContextManager::new());
    let exec = Arc::new(ExecutionEngine::new(
        registry.clone(),
        credentials.clone(),
        contexts.clone(),
        config.command_timeout_ms,
    ));
    let sftp = Arc::new(SftpManager::new(registry.clone()));
    let tunnels = Arc::new(TunnelForwarder::new(registry.clone()));
    let pty = Arc::new(PtyManager::new(registry.clone(), credentials.clone()));

    let dispatcher = Dispatcher::new(
        registry,
        credentials,
        contexts,
        exec,
        sftp,
        tunnels,
        pty,
        config.default_ssh_port,
        config.reconnect_attempts,
        config.connection_timeout_ms,
    );

    let shutdown = setup_shutdown_signal();
    spawn_sweep_task(dispatcher.clone(), shutdown.clone());

    let result = transport::run_stdio_loop(dispatcher, shutdown).await;
    guard.release();
    result
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn setup_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, initiating shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl+C, initiating shutdown");
        }

        token_clone.cancel();
    });

    token
}

/// Hourly sweep of terminal transfers, idle PTY sessions, and inactive
/// container contexts (§4.G, §4.I, §4.E).
fn spawn_sweep_task(dispatcher: Dispatcher, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => dispatcher.sweep(),
            }
        }
    });
}
