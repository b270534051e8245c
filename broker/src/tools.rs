//! Typed argument structs for the §6 tool surface.
//!
//! Every tool call's `params` is deserialized into one of these before it
//! touches dispatch logic (§12: "typed structs per tool call, never raw
//! `serde_json::Value` at point of use").

use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_background_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectArgs {
    pub host: String,
    pub username: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub remember_password: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdArgs {
    pub connection_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandArgs {
    pub connection_id: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundExecuteArgs {
    pub connection_id: String,
    pub command: String,
    #[serde(default = "default_background_interval_ms")]
    pub interval: u64,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileArgs {
    pub connection_id: String,
    pub local_path: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileArgs {
    pub connection_id: String,
    pub remote_path: String,
    pub local_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFileEntry {
    pub local_path: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransferArgs {
    pub connection_id: String,
    pub files: Vec<BatchFileEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferStatusArgs {
    #[serde(default)]
    pub transfer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnelArgs {
    pub connection_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelIdArgs {
    pub tunnel_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalSessionArgs {
    pub connection_id: String,
    #[serde(default)]
    pub rows: Option<u32>,
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub term: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteToTerminalArgs {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandInDockerArgs {
    pub connection_id: String,
    pub container_name: String,
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseContainerEnvironmentArgs {
    pub connection_id: String,
    pub container_name: String,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_args_default_remember_password_true() {
        let args: ConnectArgs = serde_json::from_str(r#"{"host":"h","username":"u"}"#).unwrap();
        assert!(args.remember_password);
        assert_eq!(args.port, None);
    }

    #[test]
    fn background_execute_defaults_interval_to_ten_seconds() {
        let args: BackgroundExecuteArgs = serde_json::from_str(r#"{"connectionId":"c1","command":"uptime"}"#).unwrap();
        assert_eq!(args.interval, 10_000);
    }

    #[test]
    fn file_transfer_status_args_allow_missing_transfer_id() {
        let args: FileTransferStatusArgs = serde_json::from_str("{}").unwrap();
        assert!(args.transfer_id.is_none());
    }
}
