//! Connection data model (§3): the logical handle to a remote host and the
//! SSH transport it owns while connected.

mod persistence;
mod registry;

pub use persistence::ConnectionStore;
pub use registry::ConnectionRegistry;

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::id::connection_id;

/// Authentication material supplied by the caller on `connect`.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

/// The reconnect policy attached to a connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_tries: u32,
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tries: 3,
            delay_ms: 2_000,
        }
    }
}

/// Caller-supplied configuration for `connect`.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthConfig,
    pub keep_alive_ms: u64,
    pub ready_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub name: Option<String>,
    pub tags: Vec<String>,
}

impl ConnectionConfig {
    pub fn id(&self) -> String {
        connection_id(&self.username, &self.host, self.port)
    }
}

/// Lifecycle state of a connection, per §3's invariant that
/// `currentDirectory` is only meaningful while `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// The live SSH transport and channel-serialization locks for a connected
/// connection. Two `executeCommand` calls on the same connection never
/// race on this session: the locks below serializes them.
pub struct SshTransport {
    pub session: ssh2::Session,
    /// Serializes individual exec channels on this transport so a single
    /// command's stdout/stderr read is never interleaved with another's
    /// (§5 ordering guarantee). Held only for the lifetime of one blocking
    /// `exec` call, never across an `.await`.
    pub exec_lock: Mutex<()>,
    /// Serializes multi-step logical operations on this transport — a
    /// tmux capture/send/capture sequence, a `cd` followed by its `pwd`
    /// probe, a compound `docker exec` chain — so nothing else on the
    /// same connection interleaves partway through (§5: "a single logical
    /// operation"). Held across `.await` points, so it is a `tokio::sync`
    /// mutex rather than the `std` one above.
    pub op_lock: tokio::sync::Mutex<()>,
}

/// The logical handle to a remote host, as exposed to registry callers.
pub struct Connection {
    pub id: String,
    pub config: ConnectionConfig,
    pub state: ConnectionState,
    pub last_used: SystemTime,
    pub last_error: Option<String>,
    pub current_directory: Option<String>,
    /// `None` unless `state == Connected`.
    pub transport: Option<Arc<SshTransport>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let id = config.id();
        Self {
            id,
            config,
            state: ConnectionState::Disconnected,
            last_used: SystemTime::now(),
            last_error: None,
            current_directory: None,
            transport: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = SystemTime::now();
    }

    /// A lightweight, serializable view of the connection for tool results.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
            current_directory: self.current_directory.clone(),
            tags: self.config.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub current_directory: Option<String>,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(host: &str, user: &str, port: u16) -> ConnectionConfig {
        ConnectionConfig {
            host: host.into(),
            port,
            username: user.into(),
            auth: AuthConfig::default(),
            keep_alive_ms: 30_000,
            ready_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            name: None,
            tags: vec![],
        }
    }

    #[test]
    fn id_is_deterministic_for_same_triple() {
        let a = cfg("h", "u", 22).id();
        let b = cfg("h", "u", 22).id();
        assert_eq!(a, b);
    }

    #[test]
    fn current_directory_defaults_to_none() {
        let conn = Connection::new(cfg("h", "u", 22));
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert!(conn.current_directory.is_none());
    }
}
