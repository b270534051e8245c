//! Container Context Manager (§4.E): tracks the active Docker container per
//! connection and a short-lived cache of `docker ps -a` output.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Per `(connectionId, containerName)` session state.
#[derive(Debug, Clone, Default)]
pub struct ContainerSession {
    pub working_directory: Option<String>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub last_activity: Option<Instant>,
    pub is_active: bool,
}

/// Options accepted by [`ContainerContextManager::set_context`].
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
}

/// A single row of `docker ps -a` output.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub status: String,
}

struct PsCache {
    fetched_at: Instant,
    containers: Vec<ContainerInfo>,
}

const PS_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_INACTIVITY_SWEEP: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
pub struct ContainerContextManager {
    sessions: RwLock<HashMap<(String, String), ContainerSession>>,
    ps_cache: RwLock<HashMap<String, PsCache>>,
}

impl ContainerContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the session for `(connection_id, name)` and mark it active.
    pub fn set_context(&self, connection_id: &str, name: &str, update: ContextUpdate) {
        let mut sessions = self.sessions.write().expect("container context lock poisoned");
        let entry = sessions
            .entry((connection_id.to_string(), name.to_string()))
            .or_default();
        if update.workdir.is_some() {
            entry.working_directory = update.workdir;
        }
        if !update.env.is_empty() {
            entry.env = update.env;
        }
        if update.user.is_some() {
            entry.user = update.user;
        }
        entry.last_activity = Some(Instant::now());
        entry.is_active = true;
    }

    /// The most-recently-active, still-active container for a connection.
    pub fn active_container(&self, connection_id: &str) -> Option<(String, ContainerSession)> {
        let sessions = self.sessions.read().expect("container context lock poisoned");
        sessions
            .iter()
            .filter(|((conn, _), session)| conn == connection_id && session.is_active)
            .max_by_key(|(_, session)| session.last_activity)
            .map(|((_, name), session)| (name.clone(), session.clone()))
    }

    /// Explicitly return a connection to host context without erasing
    /// container history, so long-lived connections can't silently wrap
    /// later, unrelated commands into a stale container.
    pub fn exit_container(&self, connection_id: &str) {
        let mut sessions = self.sessions.write().expect("container context lock poisoned");
        for ((conn, _), session) in sessions.iter_mut() {
            if conn == connection_id {
                session.is_active = false;
            }
        }
    }

    /// Reassemble a `docker exec` invocation for `name` using the session's
    /// stored workdir/user/env. Non-interactive by default.
    pub fn build_exec(name: &str, inner_command: &str, session: &ContainerSession, interactive: bool) -> String {
        let mut parts = vec!["docker".to_string(), "exec".to_string()];
        if interactive {
            parts.push("-it".to_string());
        }
        if let Some(workdir) = &session.working_directory {
            parts.push("-w".to_string());
            parts.push(workdir.clone());
        }
        if let Some(user) = &session.user {
            parts.push("-u".to_string());
            parts.push(user.clone());
        }
        for (k, v) in &session.env {
            parts.push("-e".to_string());
            parts.push(format!("{k}={v}"));
        }
        parts.push(name.to_string());
        parts.push(inner_command.to_string());
        parts.join(" ")
    }

    /// Sweep sessions idle longer than `max_idle` (default 30 minutes) to
    /// inactive. Never removes them from history.
    pub fn sweep_inactive(&self, max_idle: Option<Duration>) {
        let max_idle = max_idle.unwrap_or(DEFAULT_INACTIVITY_SWEEP);
        let mut sessions = self.sessions.write().expect("container context lock poisoned");
        for session in sessions.values_mut() {
            if let Some(last) = session.last_activity {
                if session.is_active && last.elapsed() > max_idle {
                    session.is_active = false;
                }
            }
        }
    }

    /// Cached `docker ps -a` parse for a connection, unless expired or
    /// `force_refresh` is set.
    pub fn cached_containers(&self, connection_id: &str, force_refresh: bool) -> Option<Vec<ContainerInfo>> {
        if force_refresh {
            return None;
        }
        let cache = self.ps_cache.read().expect("ps cache lock poisoned");
        cache.get(connection_id).and_then(|entry| {
            if entry.fetched_at.elapsed() < PS_CACHE_TTL {
                Some(entry.containers.clone())
            } else {
                None
            }
        })
    }

    pub fn store_containers(&self, connection_id: &str, containers: Vec<ContainerInfo>) {
        let mut cache = self.ps_cache.write().expect("ps cache lock poisoned");
        cache.insert(
            connection_id.to_string(),
            PsCache {
                fetched_at: Instant::now(),
                containers,
            },
        );
    }
}

/// Parse `docker ps -a` output (`docker ps -a --format "{{.Names}}\t{{.Image}}\t{{.Status}}"`).
pub fn parse_ps_output(output: &str) -> Vec<ContainerInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let name = fields.next()?.trim().to_string();
            let image = fields.next().unwrap_or_default().trim().to_string();
            let status = fields.next().unwrap_or_default().trim().to_string();
            if name.is_empty() {
                return None;
            }
            Some(ContainerInfo { name, image, status })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_container_is_the_most_recently_touched() {
        let ctx = ContainerContextManager::new();
        ctx.set_context("c1", "web", ContextUpdate { workdir: Some("/app".into()), ..Default::default() });
        std::thread::sleep(Duration::from_millis(5));
        ctx.set_context("c1", "db", ContextUpdate::default());
        let (name, _) = ctx.active_container("c1").unwrap();
        assert_eq!(name, "db");
    }

    #[test]
    fn no_active_container_when_none_set() {
        let ctx = ContainerContextManager::new();
        assert!(ctx.active_container("c2").is_none());
    }

    #[test]
    fn exit_container_clears_active_without_erasing_history() {
        let ctx = ContainerContextManager::new();
        ctx.set_context("c1", "web", ContextUpdate::default());
        ctx.exit_container("c1");
        assert!(ctx.active_container("c1").is_none());
        // still present in the session map, just inactive
        let sessions = ctx.sessions.read().unwrap();
        assert!(sessions.contains_key(&("c1".to_string(), "web".to_string())));
    }

    #[test]
    fn build_exec_includes_workdir_user_and_env() {
        let session = ContainerSession {
            working_directory: Some("/srv".into()),
            user: Some("www-data".into()),
            env: vec![("FOO".into(), "bar".into())],
            last_activity: Some(Instant::now()),
            is_active: true,
        };
        let cmd = ContainerContextManager::build_exec("web", "ls", &session, false);
        assert_eq!(cmd, "docker exec -w /srv -u www-data -e FOO=bar web ls");
    }

    #[test]
    fn build_exec_interactive_adds_it_flag() {
        let session = ContainerSession::default();
        let cmd = ContainerContextManager::build_exec("web", "bash", &session, true);
        assert_eq!(cmd, "docker exec -it web bash");
    }

    #[test]
    fn parses_ps_output_rows() {
        let output = "web\tnginx:latest\tUp 2 hours\ndb\tpostgres:15\tExited (0) 1 day ago";
        let containers = parse_ps_output(output);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[1].status, "Exited (0) 1 day ago");
    }

    #[test]
    fn ps_cache_expires_after_ttl() {
        let ctx = ContainerContextManager::new();
        ctx.store_containers("c1", vec![]);
        assert!(ctx.cached_containers("c1", false).is_some());
        assert!(ctx.cached_containers("c1", true).is_none());
    }
}
