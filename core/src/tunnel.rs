//! Tunnel Forwarder (§4.H): a local TCP listener bridged to a remote peer
//! through the SSH transport's `direct-tcpip` channel type.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConnectionRegistry, SshTransport};
use crate::errors::TunnelError;
use crate::events::EventBus;

/// A local listener forwarding to a remote endpoint (§3 `Tunnel`).
#[derive(Debug, Clone)]
pub struct TunnelSummary {
    pub id: String,
    pub connection_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub description: Option<String>,
    pub active: bool,
    pub live_pairs: u64,
}

/// Closed/torn-down notification for subscribers (§9 event fan-out).
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Closed(String),
}

struct Tunnel {
    connection_id: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    description: Option<String>,
    active: bool,
    live_pairs: Arc<AtomicU64>,
    listener_task: JoinHandle<()>,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

/// Owns every active tunnel, keyed by its generated id.
pub struct TunnelForwarder {
    registry: Arc<ConnectionRegistry>,
    tunnels: Arc<RwLock<HashMap<String, Tunnel>>>,
    events: Arc<EventBus<TunnelEvent>>,
}

impl TunnelForwarder {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Bind `localPort` and bridge every inbound socket to
    /// `(remoteHost, remotePort)` through `connectionId`'s SSH transport.
    pub async fn create_tunnel(
        &self,
        connection_id: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        description: Option<String>,
    ) -> Result<String, TunnelError> {
        if self.binds_port(local_port) {
            return Err(TunnelError::PortInUse(local_port));
        }
        // Touch the transport up front so a bad connection id fails fast,
        // before the listener is bound.
        self.registry.transport(connection_id)?;

        let listener = TcpListener::bind(("127.0.0.1", local_port)).await.map_err(TunnelError::Io)?;

        let id = Uuid::new_v4().to_string();
        let live_pairs = Arc::new(AtomicU64::new(0));

        let task = self.spawn_listener(
            id.clone(),
            listener,
            connection_id.to_string(),
            remote_host.to_string(),
            remote_port,
            live_pairs.clone(),
        );

        let tunnel = Tunnel {
            connection_id: connection_id.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            description,
            active: true,
            live_pairs,
            listener_task: task,
        };
        self.tunnels.write().expect("tunnel lock poisoned").insert(id.clone(), tunnel);
        Ok(id)
    }

    fn spawn_listener(
        &self,
        id: String,
        listener: TcpListener,
        connection_id: String,
        remote_host: String,
        remote_port: u16,
        live_pairs: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(tunnel_id = %id, error = %e, "tunnel accept failed");
                        continue;
                    }
                };
                debug!(tunnel_id = %id, %peer, "accepted tunnel connection");

                let registry = registry.clone();
                let connection_id = connection_id.clone();
                let remote_host = remote_host.clone();
                let live_pairs = live_pairs.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    live_pairs.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = bridge_pair(&registry, &connection_id, socket, &remote_host, remote_port).await {
                        warn!(tunnel_id = %id, error = %e, "tunnel pair torn down");
                    }
                    live_pairs.fetch_sub(1, Ordering::SeqCst);
                });
            }
        })
    }

    /// Close `id`: stops the listener, drops every live pair, and erases
    /// the record. Idempotent.
    pub fn close_tunnel(&self, id: &str) -> bool {
        let removed = self.tunnels.write().expect("tunnel lock poisoned").remove(id);
        if removed.is_some() {
            self.events.emit(TunnelEvent::Closed(id.to_string()));
        }
        removed.is_some()
    }

    /// Tear down every tunnel belonging to `connection_id`. Tunnels do not
    /// survive a reconnect of their parent connection (§4.H).
    pub fn close_for_connection(&self, connection_id: &str) {
        let ids: Vec<String> = {
            let tunnels = self.tunnels.read().expect("tunnel lock poisoned");
            tunnels
                .iter()
                .filter(|(_, t)| t.connection_id == connection_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.close_tunnel(&id);
        }
    }

    pub fn get(&self, id: &str) -> Option<TunnelSummary> {
        self.tunnels.read().expect("tunnel lock poisoned").get(id).map(|t| summarize(id, t))
    }

    pub fn list(&self) -> Vec<TunnelSummary> {
        self.tunnels
            .read()
            .expect("tunnel lock poisoned")
            .iter()
            .map(|(id, t)| summarize(id, t))
            .collect()
    }

    fn binds_port(&self, local_port: u16) -> bool {
        self.tunnels
            .read()
            .expect("tunnel lock poisoned")
            .values()
            .any(|t| t.active && t.local_port == local_port)
    }
}

fn summarize(id: &str, tunnel: &Tunnel) -> TunnelSummary {
    TunnelSummary {
        id: id.to_string(),
        connection_id: tunnel.connection_id.clone(),
        local_port: tunnel.local_port,
        remote_host: tunnel.remote_host.clone(),
        remote_port: tunnel.remote_port,
        description: tunnel.description.clone(),
        active: tunnel.active,
        live_pairs: tunnel.live_pairs.load(Ordering::SeqCst),
    }
}

/// Open a `direct-tcpip` channel for one inbound socket and bridge the two
/// streams until either side closes or errors. Any error on either side
/// tears down just this pair; the listener keeps serving (§4.H).
async fn bridge_pair(
    registry: &ConnectionRegistry,
    connection_id: &str,
    socket: tokio::net::TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), TunnelError> {
    let transport = registry.transport(connection_id)?;
    let remote_host = remote_host.to_string();
    let std_socket = socket.into_std().map_err(TunnelError::Io)?;
    std_socket.set_nonblocking(true).map_err(TunnelError::Io)?;

    tokio::task::spawn_blocking(move || bridge_pair_blocking(&transport, std_socket, &remote_host, remote_port))
        .await
        .map_err(|e| TunnelError::ForwardFailed(e.to_string()))?
}

/// Pump bytes between `local` and a freshly-opened `direct-tcpip` channel.
///
/// Drives both sides with the session in non-blocking mode so the listener
/// and other in-flight tunnel pairs are never starved by one slow peer; see
/// [`crate::connection::SshTransport::exec_lock`] for the analogous
/// exec-channel serialization this deliberately does not share, since a
/// tunnel pair's lifetime is open-ended and must not block one-shot command
/// execution on the same connection.
fn bridge_pair_blocking(
    transport: &SshTransport,
    mut local: std::net::TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), TunnelError> {
    let was_blocking = transport.session.is_blocking();
    transport.session.set_blocking(true);
    let mut channel = transport
        .session
        .channel_direct_tcpip(remote_host, remote_port, None)
        .map_err(|e| TunnelError::ForwardFailed(e.to_string()))?;
    transport.session.set_blocking(false);

    let mut local_buf = [0u8; 16 * 1024];
    let mut remote_buf = [0u8; 16 * 1024];
    let result = loop {
        let mut made_progress = false;

        match local.read(&mut local_buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = channel.write_all(&local_buf[..n]) {
                    break Err(TunnelError::ForwardFailed(e.to_string()));
                }
                made_progress = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => break Err(TunnelError::Io(e)),
        }

        match channel.read(&mut remote_buf) {
            Ok(0) if channel.eof() => break Ok(()),
            Ok(0) => {}
            Ok(n) => {
                if let Err(e) = local.write_all(&remote_buf[..n]) {
                    break Err(TunnelError::Io(e));
                }
                made_progress = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => break Err(TunnelError::ForwardFailed(e.to_string())),
        }

        if !made_progress {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    };

    channel.close().ok();
    transport.session.set_blocking(was_blocking);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summary_reports_live_pair_count() {
        let live_pairs = Arc::new(AtomicU64::new(2));
        let tunnel = Tunnel {
            connection_id: "c1".into(),
            local_port: 18080,
            remote_host: "db".into(),
            remote_port: 5432,
            description: None,
            active: true,
            live_pairs,
            listener_task: tokio::spawn(async {}),
        };
        let summary = summarize("t1", &tunnel);
        assert_eq!(summary.live_pairs, 2);
        assert_eq!(summary.local_port, 18080);
    }

    #[tokio::test]
    async fn close_tunnel_is_idempotent() {
        let credentials = Arc::new(crate::credential::CredentialStore::with_backend(Box::new(NullBackend)));
        let registry = Arc::new(ConnectionRegistry::new(credentials, std::path::Path::new("/tmp/does-not-matter-tunnel")));
        let forwarder = TunnelForwarder::new(registry);
        assert!(!forwarder.close_tunnel("missing"));
        assert!(!forwarder.close_tunnel("missing"));
    }

    struct NullBackend;
    impl crate::credential::CredentialBackend for NullBackend {
        fn save(&self, _: &str, _: &crate::credential::Credential) -> Result<(), crate::errors::CredentialError> {
            Ok(())
        }
        fn load(&self, _: &str) -> Result<crate::credential::Credential, crate::errors::CredentialError> {
            Ok(crate::credential::Credential::default())
        }
        fn delete(&self, _: &str) -> Result<(), crate::errors::CredentialError> {
            Ok(())
        }
    }
}
