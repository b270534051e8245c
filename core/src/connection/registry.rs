//! Connection Registry (§4.C): identity, state, and reconnection policy for
//! SSH clients. Owns every live [`ssh2::Session`] and drives reconnection
//! attempts after a connect failure.

use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use super::persistence::{self, ConnectionStore, PersistedConnection};
use super::{AuthConfig, Connection, ConnectionConfig, ConnectionState, ConnectionSummary, SshTransport};
use crate::credential::{Credential, CredentialStore};
use crate::errors::ConnectionError;

/// Owns every connection, keyed by its deterministic id.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    credentials: Arc<CredentialStore>,
    store: Arc<ConnectionStore>,
}

impl ConnectionRegistry {
    pub fn new(credentials: Arc<CredentialStore>, data_dir: &std::path::Path) -> Self {
        let store = Arc::new(ConnectionStore::open(persistence::default_path(data_dir)));
        Self {
            connections: RwLock::new(HashMap::new()),
            credentials,
            store,
        }
    }

    /// Establish (or return the existing) connection for `config`.
    ///
    /// Runs the blocking SSH handshake on a dedicated thread so the async
    /// runtime is never stalled by it.
    pub async fn connect(
        self: &Arc<Self>,
        mut config: ConnectionConfig,
        remember_password: bool,
    ) -> Result<ConnectionSummary, ConnectionError> {
        let id = config.id();

        if let Some(summary) = self.connected_summary(&id) {
            return Ok(summary);
        }

        if config.auth.password.is_none() && config.auth.passphrase.is_none() {
            let cred = self.credentials.load(&id);
            config.auth.password = cred.password;
            config.auth.passphrase = config.auth.passphrase.or(cred.passphrase);
        }

        {
            let mut connections = self.connections.write().expect("registry lock poisoned");
            let entry = connections
                .entry(id.clone())
                .or_insert_with(|| Connection::new(config.clone()));
            entry.config = config.clone();
            entry.state = ConnectionState::Connecting;
        }

        match establish(&config).await {
            Ok(transport) => {
                let current_directory = probe_pwd(&transport).ok();
                let mut connections = self.connections.write().expect("registry lock poisoned");
                let entry = connections.get_mut(&id).expect("just inserted above");
                entry.transport = Some(Arc::new(transport));
                entry.state = ConnectionState::Connected;
                entry.last_error = None;
                entry.current_directory = current_directory;
                entry.touch();
                let summary = entry.summary();
                drop(connections);

                self.persist_non_secret(&config, &id);
                if remember_password {
                    let _ = self.credentials.save(
                        &id,
                        &Credential {
                            password: config.auth.password.clone(),
                            passphrase: config.auth.passphrase.clone(),
                        },
                    );
                }
                info!(connection_id = %id, host = %config.host, "ssh connection established");
                Ok(summary)
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut connections = self.connections.write().expect("registry lock poisoned");
                    if let Some(entry) = connections.get_mut(&id) {
                        entry.state = ConnectionState::Error;
                        entry.last_error = Some(message.clone());
                    }
                }
                warn!(connection_id = %id, error = %message, "ssh connect failed");
                if config.reconnect.enabled {
                    self.clone().spawn_reconnect_loop(id.clone(), config.clone());
                }
                Err(e)
            }
        }
    }

    fn spawn_reconnect_loop(self: Arc<Self>, id: String, config: ConnectionConfig) {
        tokio::spawn(async move {
            for attempt in 1..=config.reconnect.max_tries {
                tokio::time::sleep(Duration::from_millis(config.reconnect.delay_ms)).await;

                {
                    let mut connections = self.connections.write().expect("registry lock poisoned");
                    match connections.get_mut(&id) {
                        Some(entry) if entry.state != ConnectionState::Error => return,
                        Some(entry) => entry.state = ConnectionState::Reconnecting,
                        None => return,
                    }
                }

                match establish(&config).await {
                    Ok(transport) => {
                        let current_directory = probe_pwd(&transport).ok();
                        let mut connections = self.connections.write().expect("registry lock poisoned");
                        if let Some(entry) = connections.get_mut(&id) {
                            entry.transport = Some(Arc::new(transport));
                            entry.state = ConnectionState::Connected;
                            entry.last_error = None;
                            entry.current_directory = current_directory;
                        }
                        info!(connection_id = %id, attempt, "reconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(connection_id = %id, attempt, error = %e, "reconnect attempt failed");
                        let mut connections = self.connections.write().expect("registry lock poisoned");
                        if let Some(entry) = connections.get_mut(&id) {
                            entry.state = ConnectionState::Error;
                            entry.last_error = Some(e.to_string());
                        }
                    }
                }
            }
        });
    }

    pub fn disconnect(&self, id: &str) -> bool {
        let mut connections = self.connections.write().expect("registry lock poisoned");
        match connections.get_mut(id) {
            Some(entry) => {
                entry.transport = None;
                entry.state = ConnectionState::Disconnected;
                entry.current_directory = None;
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, id: &str) -> bool {
        self.disconnect(id);
        let existed = {
            let mut connections = self.connections.write().expect("registry lock poisoned");
            connections.remove(id).is_some()
        };
        if existed {
            let _ = self.store.remove(id);
            let _ = self.credentials.delete(id);
        }
        existed
    }

    pub fn get(&self, id: &str) -> Option<ConnectionSummary> {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .map(Connection::summary)
    }

    pub fn list(&self) -> Vec<ConnectionSummary> {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(Connection::summary)
            .collect()
    }

    /// Clone of the live transport for a connected connection, for use by
    /// the execution engine, SFTP manager, tunnel forwarder and PTY manager.
    pub fn transport(&self, id: &str) -> Result<Arc<SshTransport>, ConnectionError> {
        let connections = self.connections.read().expect("registry lock poisoned");
        let entry = connections.get(id).ok_or_else(|| ConnectionError::NotFound(id.to_string()))?;
        if entry.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(id.to_string()));
        }
        entry
            .transport
            .clone()
            .ok_or_else(|| ConnectionError::NotConnected(id.to_string()))
    }

    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.connections.write().expect("registry lock poisoned").get_mut(id) {
            entry.touch();
        }
    }

    pub fn set_current_directory(&self, id: &str, dir: String) {
        if let Some(entry) = self.connections.write().expect("registry lock poisoned").get_mut(id) {
            entry.current_directory = Some(dir);
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .map(|c| c.state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    fn connected_summary(&self, id: &str) -> Option<ConnectionSummary> {
        let connections = self.connections.read().expect("registry lock poisoned");
        connections
            .get(id)
            .filter(|c| c.state == ConnectionState::Connected)
            .map(Connection::summary)
    }

    fn persist_non_secret(&self, config: &ConnectionConfig, id: &str) {
        let record = PersistedConnection {
            id: id.to_string(),
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            private_key: config.auth.private_key.clone(),
            last_used: chrono::Utc::now().timestamp(),
            tags: config.tags.clone(),
        };
        if let Err(e) = self.store.upsert(record) {
            warn!(connection_id = %id, error = %e, "failed to persist connection record");
        }
    }
}

async fn establish(config: &ConnectionConfig) -> Result<SshTransport, ConnectionError> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || establish_blocking(&config))
        .await
        .map_err(|e| ConnectionError::ConnectFailed {
            host: String::new(),
            port: 0,
            message: format!("connect task panicked: {e}"),
        })?
}

fn establish_blocking(config: &ConnectionConfig) -> Result<SshTransport, ConnectionError> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = TcpStream::connect(&addr).map_err(|e| ConnectionError::ConnectFailed {
        host: config.host.clone(),
        port: config.port,
        message: e.to_string(),
    })?;
    tcp.set_read_timeout(Some(Duration::from_millis(config.ready_timeout_ms.max(1))))
        .ok();

    let mut session = ssh2::Session::new().map_err(|e| ConnectionError::ConnectFailed {
        host: config.host.clone(),
        port: config.port,
        message: e.to_string(),
    })?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.ready_timeout_ms as u32);
    session.handshake().map_err(|e| ConnectionError::ConnectFailed {
        host: config.host.clone(),
        port: config.port,
        message: format!("handshake failed: {e}"),
    })?;

    authenticate(&session, &config.username, &config.auth)?;

    session.set_keepalive(true, (config.keep_alive_ms / 1000).max(1) as u32);
    session.set_blocking(true);

    Ok(SshTransport {
        session,
        exec_lock: Mutex::new(()),
        op_lock: tokio::sync::Mutex::new(()),
    })
}

fn authenticate(session: &ssh2::Session, username: &str, auth: &AuthConfig) -> Result<(), ConnectionError> {
    let auth_result = if let Some(key) = &auth.private_key {
        session.userauth_pubkey_memory(username, None, key, auth.passphrase.as_deref())
    } else if let Some(password) = &auth.password {
        session.userauth_password(username, password)
    } else {
        session.userauth_agent(username)
    };
    auth_result.map_err(|e| ConnectionError::AuthFailed(e.to_string()))?;

    if !session.authenticated() {
        return Err(ConnectionError::AuthFailed("server rejected credentials".into()));
    }
    Ok(())
}

fn probe_pwd(transport: &SshTransport) -> Result<String, ConnectionError> {
    let _guard = transport.exec_lock.lock().expect("exec lock poisoned");
    let mut channel = transport.session.channel_session()?;
    channel.exec("pwd")?;
    let mut output = String::new();
    channel.read_to_string(&mut output)?;
    channel.wait_close().ok();
    Ok(output.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_summary_none_when_absent() {
        let credentials = Arc::new(CredentialStore::with_backend(Box::new(NullBackend)));
        let registry = ConnectionRegistry::new(credentials, std::path::Path::new("/tmp/does-not-matter"));
        assert!(registry.connected_summary("missing").is_none());
        assert!(!registry.is_connected("missing"));
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
