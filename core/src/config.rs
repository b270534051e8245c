//! Broker-wide tunables, read once at startup from the environment.
//!
//! Mirrors the `DaemonConfig::from_env()` convention of the rest of the
//! stack: typed fields populated from `std::env::var` in one place rather
//! than scattered lookups at the point of use.

/// Process-wide configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Default SSH port used when a `connect` call omits one.
    pub default_ssh_port: u16,
    /// Default SSH `readyTimeout`, and the `connect` keep-alive baseline.
    pub connection_timeout_ms: u64,
    /// Default `maxTries` for a connection's reconnect policy.
    pub reconnect_attempts: u32,
    /// Default `timeoutMs` for `executeCommand` when the caller omits one.
    pub command_timeout_ms: u64,
    /// Explicit lockfile path, overriding the per-user data directory default.
    pub lock_path: Option<std::path::PathBuf>,
    /// Explicit per-user data directory, overriding the OS-conventional default.
    pub data_dir: Option<std::path::PathBuf>,
}

impl BrokerConfig {
    /// Read configuration from environment variables, falling back to the
    /// spec-mandated defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            default_ssh_port: env_parse("DEFAULT_SSH_PORT", 22),
            connection_timeout_ms: env_parse("CONNECTION_TIMEOUT", 10_000),
            reconnect_attempts: env_parse("RECONNECT_ATTEMPTS", 3),
            command_timeout_ms: env_parse("COMMAND_TIMEOUT", 10_000),
            lock_path: std::env::var("MCP_SSH_LOCK_PATH").ok().map(Into::into),
            data_dir: std::env::var("MCP_SSH_DATA_DIR").ok().map(Into::into),
        }
    }

    /// Resolve the per-user data directory: the explicit override, or the
    /// OS-conventional data directory under a `mcp-ssh` subdirectory.
    pub fn resolve_data_dir(&self) -> std::path::PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("mcp-ssh")
        })
    }

    /// Resolve the lockfile path: the explicit override, or
    /// `<data_dir>/broker.lock`.
    pub fn resolve_lock_path(&self) -> std::path::PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| self.resolve_data_dir().join("broker.lock"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // SAFETY: tests run single-threaded within this module's scope via `cargo test`
        // defaults; we don't set these vars elsewhere.
        let cfg = BrokerConfig {
            default_ssh_port: 22,
            connection_timeout_ms: 10_000,
            reconnect_attempts: 3,
            command_timeout_ms: 10_000,
            lock_path: None,
            data_dir: None,
        };
        assert_eq!(cfg.default_ssh_port, 22);
        assert!(cfg.resolve_data_dir().ends_with("mcp-ssh"));
        assert!(cfg.resolve_lock_path().ends_with("broker.lock"));
    }

    #[test]
    fn explicit_overrides_win() {
        let cfg = BrokerConfig {
            default_ssh_port: 22,
            connection_timeout_ms: 10_000,
            reconnect_attempts: 3,
            command_timeout_ms: 10_000,
            lock_path: Some("/tmp/custom.lock".into()),
            data_dir: Some("/tmp/custom-data".into()),
        };
        assert_eq!(cfg.resolve_lock_path(), std::path::PathBuf::from("/tmp/custom.lock"));
        assert_eq!(cfg.resolve_data_dir(), std::path::PathBuf::from("/tmp/custom-data"));
    }
}
