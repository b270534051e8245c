//! PTY Session Manager (§4.I): interactive shell channels with a pseudo
//! terminal allocated, automatic sudo-password autofill, and a
//! `terminal_data` event fan-out for the data pump.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConnectionRegistry, SshTransport};
use crate::credential::CredentialStore;
use crate::errors::PtySessionError;
use crate::events::EventBus;

const DEFAULT_ROWS: u32 = 24;
const DEFAULT_COLS: u32 = 80;
const DEFAULT_TERM: &str = "xterm-256color";
const SWEEP_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Substrings that mark an incoming chunk as a sudo password prompt,
/// including the localized Chinese variant the upstream tool surface names.
const SUDO_PROMPT_MARKERS: &[&str] = &["[sudo] password for", "Password:", "密码："];

/// Options accepted by [`PtyManager::create`].
#[derive(Debug, Clone, Default)]
pub struct PtyOptions {
    pub rows: Option<u32>,
    pub cols: Option<u32>,
    pub term: Option<String>,
}

/// A chunk of terminal output, tagged with its session (§4.I data pump).
#[derive(Debug, Clone)]
pub struct TerminalData {
    pub session_id: String,
    pub data: Vec<u8>,
}

/// Terminal session summary (§3 `TerminalSession`).
#[derive(Debug, Clone)]
pub struct TerminalSessionSummary {
    pub id: String,
    pub connection_id: String,
    pub rows: u32,
    pub cols: u32,
    pub term: String,
    pub is_active: bool,
    pub start_time: SystemTime,
    pub last_activity: SystemTime,
    pub sudo_password_prompt: bool,
}

struct TerminalSession {
    connection_id: String,
    rows: u32,
    cols: u32,
    term: String,
    is_active: bool,
    start_time: SystemTime,
    last_activity: SystemTime,
    /// One-shot flag: set when a sudo prompt is detected and the stored
    /// password has just been auto-injected, consumed by the next explicit
    /// write from the orchestrator.
    sudo_password_prompt: bool,
    channel: Arc<std::sync::Mutex<ssh2::Channel>>,
    pump_task: JoinHandle<()>,
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

/// Owns every live PTY session, keyed by its generated id.
pub struct PtyManager {
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<CredentialStore>,
    sessions: Arc<RwLock<HashMap<String, TerminalSession>>>,
    events: Arc<EventBus<TerminalData>>,
}

impl PtyManager {
    pub fn new(registry: Arc<ConnectionRegistry>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            registry,
            credentials,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TerminalData> {
        self.events.subscribe()
    }

    /// Open an SSH `pty-req` + `shell` channel sized `rows x cols` (default
    /// 24x80, `xterm-256color`) and start the data pump.
    pub async fn create(&self, connection_id: &str, options: PtyOptions) -> Result<String, PtySessionError> {
        let transport = self.registry.transport(connection_id)?;
        let rows = options.rows.unwrap_or(DEFAULT_ROWS);
        let cols = options.cols.unwrap_or(DEFAULT_COLS);
        let term = options.term.unwrap_or_else(|| DEFAULT_TERM.to_string());

        let channel = open_shell(&transport, rows, cols, &term).await?;
        let channel = Arc::new(std::sync::Mutex::new(channel));

        let id = Uuid::new_v4().to_string();
        let pump_task = self.spawn_pump(id.clone(), connection_id.to_string(), channel.clone());

        let now = SystemTime::now();
        let session = TerminalSession {
            connection_id: connection_id.to_string(),
            rows,
            cols,
            term,
            is_active: true,
            start_time: now,
            last_activity: now,
            sudo_password_prompt: false,
            channel,
            pump_task,
        };
        self.sessions.write().expect("pty lock poisoned").insert(id.clone(), session);
        Ok(id)
    }

    fn spawn_pump(&self, id: String, connection_id: String, channel: Arc<std::sync::Mutex<ssh2::Channel>>) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let events = self.events.clone();
        let credentials = self.credentials.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                let read = {
                    let mut channel = channel.lock().expect("pty channel lock poisoned");
                    channel.read(&mut buf)
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = buf[..n].to_vec();
                        events.emit(TerminalData { session_id: id.clone(), data: chunk.clone() });
                        maybe_autofill_sudo(&id, &connection_id, &chunk, &sessions, &events, &credentials, &channel);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "pty read failed, ending pump");
                        break;
                    }
                }
            }
            if let Some(session) = sessions.write().expect("pty lock poisoned").get_mut(&id) {
                session.is_active = false;
            }
        })
    }

    /// Forward bytes to the channel and update `lastActivity`. If a sudo
    /// autofill has just happened, this explicit write clears the one-shot
    /// flag unconditionally (§4.I).
    pub fn write(&self, session_id: &str, data: &[u8]) -> Result<(), PtySessionError> {
        let channel = {
            let mut sessions = self.sessions.write().expect("pty lock poisoned");
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| PtySessionError::NotFound(session_id.to_string()))?;
            if !session.is_active {
                return Err(PtySessionError::Closed(session_id.to_string()));
            }
            session.last_activity = SystemTime::now();
            session.sudo_password_prompt = false;
            session.channel.clone()
        };
        let mut channel = channel.lock().expect("pty channel lock poisoned");
        channel.write_all(data).map_err(PtySessionError::Io)?;
        channel.flush().map_err(PtySessionError::Io)?;
        Ok(())
    }

    /// Send a window-change request and update the stored dimensions.
    pub fn resize(&self, session_id: &str, rows: u32, cols: u32) -> Result<(), PtySessionError> {
        let channel = {
            let mut sessions = self.sessions.write().expect("pty lock poisoned");
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| PtySessionError::NotFound(session_id.to_string()))?;
            session.rows = rows;
            session.cols = cols;
            session.channel.clone()
        };
        let channel = channel.lock().expect("pty channel lock poisoned");
        channel
            .request_pty_size(cols, rows, None, None)
            .map_err(PtySessionError::Ssh)?;
        Ok(())
    }

    /// End the channel, stop the pump, and erase the record. Idempotent.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().expect("pty lock poisoned").remove(session_id);
        if let Some(session) = &removed {
            if let Ok(mut channel) = session.channel.lock() {
                channel.close().ok();
            }
        }
        removed.is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<TerminalSessionSummary> {
        self.sessions.read().expect("pty lock poisoned").get(session_id).map(|s| summarize(session_id, s))
    }

    pub fn list(&self) -> Vec<TerminalSessionSummary> {
        self.sessions
            .read()
            .expect("pty lock poisoned")
            .iter()
            .map(|(id, s)| summarize(id, s))
            .collect()
    }

    /// Auto-close sessions idle longer than 24 hours.
    pub fn sweep(&self) {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().expect("pty lock poisoned");
            sessions
                .iter()
                .filter(|(_, s)| {
                    s.last_activity.elapsed().map(|elapsed| elapsed > SWEEP_AFTER).unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in stale {
            self.close(&id);
        }
    }

    /// Close every session bound to `connection_id` (disconnect/delete).
    pub fn close_for_connection(&self, connection_id: &str) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().expect("pty lock poisoned");
            sessions
                .iter()
                .filter(|(_, s)| s.connection_id == connection_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.close(&id);
        }
    }
}

fn summarize(id: &str, session: &TerminalSession) -> TerminalSessionSummary {
    TerminalSessionSummary {
        id: id.to_string(),
        connection_id: session.connection_id.clone(),
        rows: session.rows,
        cols: session.cols,
        term: session.term.clone(),
        is_active: session.is_active,
        start_time: session.start_time,
        last_activity: session.last_activity,
        sudo_password_prompt: session.sudo_password_prompt,
    }
}

/// Scan an incoming chunk for a sudo password prompt; on first match, write
/// the stored password followed by a newline exactly once, falling back to
/// the Credential Store when the in-memory config has no password.
fn maybe_autofill_sudo(
    id: &str,
    connection_id: &str,
    chunk: &[u8],
    sessions: &RwLock<HashMap<String, TerminalSession>>,
    events: &EventBus<TerminalData>,
    credentials: &CredentialStore,
    channel: &Arc<std::sync::Mutex<ssh2::Channel>>,
) {
    let text = String::from_utf8_lossy(chunk);
    if !SUDO_PROMPT_MARKERS.iter().any(|marker| text.contains(marker)) {
        return;
    }

    let already_prompted = {
        let sessions = sessions.read().expect("pty lock poisoned");
        sessions.get(id).map(|s| s.sudo_password_prompt).unwrap_or(true)
    };
    if already_prompted {
        return;
    }

    {
        let mut sessions = sessions.write().expect("pty lock poisoned");
        if let Some(session) = sessions.get_mut(id) {
            session.sudo_password_prompt = true;
        }
    }

    let credential = credentials.load(connection_id);
    let Some(password) = credential.password else {
        warn!(session_id = %id, "sudo prompt detected but no stored password available");
        return;
    };

    let mut payload = password.into_bytes();
    payload.push(b'\n');
    let mut channel = channel.lock().expect("pty channel lock poisoned");
    if let Err(e) = channel.write_all(&payload) {
        warn!(session_id = %id, error = %e, "sudo autofill write failed");
        return;
    }
    let _ = channel.flush();
    debug!(session_id = %id, "sudo password auto-filled");
    events.emit(TerminalData { session_id: id.to_string(), data: Vec::new() });
}

async fn open_shell(transport: &Arc<SshTransport>, rows: u32, cols: u32, term: &str) -> Result<ssh2::Channel, PtySessionError> {
    let transport = transport.clone();
    let term = term.to_string();
    tokio::task::spawn_blocking(move || {
        let _guard = transport.exec_lock.lock().expect("exec lock poisoned");
        let mut channel = transport.session.channel_session()?;
        channel.request_pty(&term, None, Some((cols, rows, 0, 0)))?;
        channel.shell()?;
        transport.session.set_blocking(false);
        Ok(channel)
    })
    .await
    .map_err(|e| PtySessionError::Io(std::io::Error::other(e.to_string())))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_prompt_markers_match_expected_strings() {
        let text = "[sudo] password for alice: ";
        assert!(SUDO_PROMPT_MARKERS.iter().any(|m| text.contains(m)));
        let text = "Password: ";
        assert!(SUDO_PROMPT_MARKERS.iter().any(|m| text.contains(m)));
        let text = "请输入密码：";
        assert!(SUDO_PROMPT_MARKERS.iter().any(|m| text.contains(m)));
    }

    #[test]
    fn plain_output_does_not_match_sudo_markers() {
        let text = "total 24\ndrwxr-xr-x 5 root root 4096 Jan 1 00:00 .\n";
        assert!(!SUDO_PROMPT_MARKERS.iter().any(|m| text.contains(m)));
    }

    #[test]
    fn default_dimensions_match_spec() {
        assert_eq!(DEFAULT_ROWS, 24);
        assert_eq!(DEFAULT_COLS, 80);
        assert_eq!(DEFAULT_TERM, "xterm-256color");
    }
}
