//! Unified error types for the broker core crate.
//!
//! Each subsystem defines its own `thiserror`-derived error enum; all of
//! them convert via `#[from]` into [`BrokerError`], which additionally
//! exposes a stable machine-readable [`BrokerError::kind`] string for the
//! tool dispatcher's `isError` responses.

use thiserror::Error;

/// Errors raised by the connection registry and SSH transport lifecycle.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection {0} not connected")]
    NotConnected(String),

    #[error("connection {0} not found")]
    NotFound(String),

    #[error("failed to connect to {host}:{port}: {message}")]
    ConnectFailed {
        host: String,
        port: u16,
        message: String,
    },

    #[error("authentication failed for {0}")]
    AuthFailed(String),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh protocol error: {0}")]
    Ssh(#[from] ssh2::Error),
}

/// Errors raised by the Docker command parser and container context manager.
#[derive(Error, Debug)]
pub enum DockerError {
    #[error("unknown container {0}")]
    UnknownContainer(String),

    #[error("docker command failed: {0}")]
    CommandFailed(String),
}

/// Errors raised by the command execution engine.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("command failed with exit code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("tmux target blocked: {0}")]
    TmuxBlocked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the SFTP transfer manager.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("transfer failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sftp error: {0}")]
    Sftp(#[from] ssh2::Error),
}

/// Errors raised by the local TCP tunnel forwarder.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel {0} not found")]
    NotFound(String),

    #[error("local port {0} is already bound by an active tunnel")]
    PortInUse(u16),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("forward failed: {0}")]
    ForwardFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the PTY session manager.
#[derive(Error, Debug)]
pub enum PtySessionError {
    #[error("terminal session {0} not found")]
    NotFound(String),

    #[error("terminal session {0} is closed")]
    Closed(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh protocol error: {0}")]
    Ssh(#[from] ssh2::Error),
}

/// Errors raised by the credential store.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("keyring backend unavailable: {0}")]
    KeyringUnavailable(String),

    #[error("encrypted store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single machine-readable error kind, mirroring the taxonomy the tool
/// dispatcher surfaces to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConnected,
    ConnectFailed,
    AuthFailed,
    Timeout,
    CommandFailed,
    TmuxBlocked,
    TransferFailed,
    TunnelPortInUse,
    TunnelForwardFailed,
    SessionClosed,
    UnknownContainer,
    DockerFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::TmuxBlocked => "tmux_blocked",
            ErrorKind::TransferFailed => "transfer_failed",
            ErrorKind::TunnelPortInUse => "tunnel_port_in_use",
            ErrorKind::TunnelForwardFailed => "tunnel_forward_failed",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::UnknownContainer => "unknown_container",
            ErrorKind::DockerFailed => "docker_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Crate-wide error carrying a stable [`ErrorKind`] alongside a
/// human-readable message, as returned by every public core operation.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct BrokerError {
    kind: ErrorKind,
    message: String,
}

impl BrokerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

macro_rules! impl_from_subsystem {
    ($err:ty, $default_kind:expr) => {
        impl From<$err> for BrokerError {
            fn from(e: $err) -> Self {
                BrokerError::new($default_kind, e.to_string())
            }
        }
    };
}

impl From<ConnectionError> for BrokerError {
    fn from(e: ConnectionError) -> Self {
        let kind = match &e {
            ConnectionError::NotConnected(_) => ErrorKind::NotConnected,
            ConnectionError::NotFound(_) => ErrorKind::NotConnected,
            ConnectionError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            ConnectionError::AuthFailed(_) => ErrorKind::AuthFailed,
            ConnectionError::Timeout(_) => ErrorKind::Timeout,
            ConnectionError::Io(_) | ConnectionError::Ssh(_) => ErrorKind::Internal,
        };
        BrokerError::new(kind, e.to_string())
    }
}

impl From<DockerError> for BrokerError {
    fn from(e: DockerError) -> Self {
        let kind = match &e {
            DockerError::UnknownContainer(_) => ErrorKind::UnknownContainer,
            DockerError::CommandFailed(_) => ErrorKind::DockerFailed,
        };
        BrokerError::new(kind, e.to_string())
    }
}

impl From<ExecError> for BrokerError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Connection(inner) => inner.into(),
            ExecError::Docker(inner) => inner.into(),
            ExecError::CommandFailed { ref stderr, code } => BrokerError::new(
                ErrorKind::CommandFailed,
                format!("command failed with exit code {code}: {stderr}"),
            ),
            ExecError::TmuxBlocked(ref msg) => BrokerError::new(ErrorKind::TmuxBlocked, msg.clone()),
            ExecError::Io(ref e) => BrokerError::new(ErrorKind::Internal, e.to_string()),
        }
    }
}

impl_from_subsystem!(TransferError, ErrorKind::TransferFailed);
impl_from_subsystem!(PtySessionError, ErrorKind::SessionClosed);
impl_from_subsystem!(CredentialError, ErrorKind::Internal);

impl From<TunnelError> for BrokerError {
    fn from(e: TunnelError) -> Self {
        let kind = match &e {
            TunnelError::PortInUse(_) => ErrorKind::TunnelPortInUse,
            _ => ErrorKind::TunnelForwardFailed,
        };
        BrokerError::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_maps_to_not_connected() {
        let e = ConnectionError::NotConnected("abc".into());
        let broker: BrokerError = e.into();
        assert_eq!(broker.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn docker_error_maps_to_unknown_container() {
        let e = DockerError::UnknownContainer("web".into());
        let broker: BrokerError = e.into();
        assert_eq!(broker.kind(), ErrorKind::UnknownContainer);
        assert!(broker.to_string().contains("web"));
    }

    #[test]
    fn exec_error_tmux_blocked_kind() {
        let e = ExecError::TmuxBlocked("pane busy".into());
        let broker: BrokerError = e.into();
        assert_eq!(broker.kind(), ErrorKind::TmuxBlocked);
    }

    #[test]
    fn error_kind_as_str_matches_taxonomy() {
        assert_eq!(ErrorKind::NotConnected.as_str(), "not_connected");
        assert_eq!(ErrorKind::TmuxBlocked.as_str(), "tmux_blocked");
        assert_eq!(ErrorKind::DockerFailed.as_str(), "docker_failed");
    }
}
