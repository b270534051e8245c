//! SFTP Transfer Manager (§4.G): single and batch uploads/downloads with
//! progress accounting, backed by the connection's already-open SSH session.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::connection::ConnectionRegistry;
use crate::errors::TransferError;
use crate::events::EventBus;

const PROGRESS_STEP: u32 = 5;
const SWEEP_AFTER: Duration = Duration::from_secs(60 * 60);
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// A single SFTP upload or download (§3 `Transfer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub connection_id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub size: u64,
    pub bytes_transferred: u64,
    pub progress: u32,
    pub status: TransferStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Transfer {
    fn new(connection_id: &str, direction: TransferDirection, local: &str, remote: &str, size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            direction,
            local_path: local.to_string(),
            remote_path: remote.to_string(),
            size,
            bytes_transferred: 0,
            progress: 0,
            status: TransferStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }

    fn set_progress(&mut self, bytes: u64) {
        self.bytes_transferred = bytes;
        self.progress = if self.size == 0 { 100 } else { ((bytes * 100) / self.size).min(100) as u32 };
    }
}

/// Progress/completion events fired for a transfer.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(Transfer),
    Completed(Transfer),
    Failed(Transfer),
}

/// A request in a batch upload/download.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub local_path: String,
    pub remote_path: String,
}

/// The outcome of a batch transfer.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub transfer_ids: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct SftpManager {
    registry: Arc<ConnectionRegistry>,
    transfers: Arc<RwLock<HashMap<String, Transfer>>>,
    events: Arc<EventBus<TransferEvent>>,
}

impl SftpManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            transfers: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TransferEvent> {
        self.events.subscribe()
    }

    pub async fn upload(&self, connection_id: &str, local: &str, remote: &str) -> Result<Transfer, TransferError> {
        let transport = self.registry.transport(connection_id)?;
        let metadata = std::fs::metadata(local).map_err(TransferError::Io)?;
        let size = metadata.len();

        let transfer = Transfer::new(connection_id, TransferDirection::Upload, local, remote, size);
        self.insert(transfer.clone());
        self.set_status(&transfer.id, TransferStatus::InProgress);

        let local_path = PathBuf::from(local);
        let remote_path = remote.to_string();
        let id = transfer.id.clone();
        let transfers = self.transfers.clone();
        let events = self.events.clone();

        let result = tokio::task::spawn_blocking(move || {
            run_upload(&transport, &local_path, &remote_path, size, &id, &transfers, &events)
        })
        .await
        .map_err(|e| TransferError::Failed(e.to_string()))?;

        match result {
            Ok(()) => {
                self.mark_completed(&transfer.id);
                Ok(self.get(&transfer.id).expect("transfer was just inserted"))
            }
            Err(e) => {
                self.mark_failed(&transfer.id, &e.to_string());
                Err(e)
            }
        }
    }

    pub async fn download(&self, connection_id: &str, remote: &str, local: &str) -> Result<Transfer, TransferError> {
        let transport = self.registry.transport(connection_id)?;
        let sftp = transport.session.sftp().map_err(TransferError::Sftp)?;
        let stat = sftp.stat(Path::new(remote)).map_err(TransferError::Sftp)?;
        let size = stat.size.unwrap_or(0);

        let transfer = Transfer::new(connection_id, TransferDirection::Download, local, remote, size);
        self.insert(transfer.clone());
        self.set_status(&transfer.id, TransferStatus::InProgress);

        let local_path = PathBuf::from(local);
        let remote_path = remote.to_string();
        let id = transfer.id.clone();
        let transfers = self.transfers.clone();
        let events = self.events.clone();

        let result = tokio::task::spawn_blocking(move || {
            run_download(&transport, &remote_path, &local_path, size, &id, &transfers, &events)
        })
        .await
        .map_err(|e| TransferError::Failed(e.to_string()))?;

        match result {
            Ok(()) => {
                self.mark_completed(&transfer.id);
                Ok(self.get(&transfer.id).expect("transfer was just inserted"))
            }
            Err(e) => {
                self.mark_failed(&transfer.id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Upload or download every item sequentially, returning the created
    /// transfer ids and a success/failure count (§4.G: partial success is
    /// reported rather than treated as total failure).
    pub async fn batch(&self, connection_id: &str, items: &[BatchItem], direction: TransferDirection) -> BatchResult {
        let mut transfer_ids = Vec::with_capacity(items.len());
        let mut succeeded = 0;
        let mut failed = 0;

        for item in items {
            let outcome = match direction {
                TransferDirection::Upload => self.upload(connection_id, &item.local_path, &item.remote_path).await,
                TransferDirection::Download => self.download(connection_id, &item.remote_path, &item.local_path).await,
            };
            match outcome {
                Ok(transfer) => {
                    transfer_ids.push(transfer.id);
                    succeeded += 1;
                }
                Err(e) => {
                    warn!(connection_id, error = %e, "batch transfer item failed");
                    failed += 1;
                }
            }
        }

        BatchResult { transfer_ids, succeeded, failed }
    }

    pub fn get(&self, transfer_id: &str) -> Option<Transfer> {
        self.transfers.read().expect("transfer lock poisoned").get(transfer_id).cloned()
    }

    pub fn list(&self) -> Vec<Transfer> {
        self.transfers.read().expect("transfer lock poisoned").values().cloned().collect()
    }

    /// Delete terminal transfers whose `end_time` is older than one hour.
    pub fn sweep(&self) {
        let mut transfers = self.transfers.write().expect("transfer lock poisoned");
        transfers.retain(|_, t| {
            !(t.status.is_terminal() && t.end_time.map(|end| (Utc::now() - end).to_std().unwrap_or_default() > SWEEP_AFTER).unwrap_or(false))
        });
    }

    fn insert(&self, transfer: Transfer) {
        self.transfers.write().expect("transfer lock poisoned").insert(transfer.id.clone(), transfer);
    }

    fn set_status(&self, id: &str, status: TransferStatus) {
        if let Some(t) = self.transfers.write().expect("transfer lock poisoned").get_mut(id) {
            t.status = status;
        }
    }

    fn mark_failed(&self, id: &str, message: &str) {
        let mut transfers = self.transfers.write().expect("transfer lock poisoned");
        if let Some(t) = transfers.get_mut(id) {
            t.status = TransferStatus::Failed;
            t.error = Some(message.to_string());
            t.end_time = Some(Utc::now());
            self.events.emit(TransferEvent::Failed(t.clone()));
        }
    }

    fn mark_completed(&self, id: &str) {
        let mut transfers = self.transfers.write().expect("transfer lock poisoned");
        if let Some(t) = transfers.get_mut(id) {
            t.set_progress(t.size);
            t.status = TransferStatus::Completed;
            t.end_time = Some(Utc::now());
            self.events.emit(TransferEvent::Completed(t.clone()));
        }
    }
}

/// Update `id`'s byte count and emit a [`TransferEvent::Progress`] whenever
/// the rounded percentage crosses a 5% boundary (§4.G).
fn report_progress(
    transfers: &RwLock<HashMap<String, Transfer>>,
    events: &EventBus<TransferEvent>,
    id: &str,
    bytes: u64,
) {
    let mut transfers = transfers.write().expect("transfer lock poisoned");
    if let Some(t) = transfers.get_mut(id) {
        let previous_progress = t.progress;
        t.set_progress(bytes);
        if t.progress / PROGRESS_STEP > previous_progress / PROGRESS_STEP {
            events.emit(TransferEvent::Progress(t.clone()));
        }
    }
}

fn run_upload(
    transport: &crate::connection::SshTransport,
    local: &Path,
    remote: &str,
    size: u64,
    id: &str,
    transfers: &RwLock<HashMap<String, Transfer>>,
    events: &EventBus<TransferEvent>,
) -> Result<(), TransferError> {
    let sftp = transport.session.sftp().map_err(TransferError::Sftp)?;
    let mut remote_file = sftp.create(Path::new(remote)).map_err(TransferError::Sftp)?;
    let mut local_file = std::fs::File::open(local).map_err(TransferError::Io)?;

    let mut buf = [0u8; READ_CHUNK];
    let mut transferred: u64 = 0;
    loop {
        let n = local_file.read(&mut buf).map_err(TransferError::Io)?;
        if n == 0 {
            break;
        }
        remote_file.write_all(&buf[..n]).map_err(TransferError::Io)?;
        transferred += n as u64;
        report_progress(transfers, events, id, transferred);
    }
    let _ = size;
    Ok(())
}

fn run_download(
    transport: &crate::connection::SshTransport,
    remote: &str,
    local: &Path,
    size: u64,
    id: &str,
    transfers: &RwLock<HashMap<String, Transfer>>,
    events: &EventBus<TransferEvent>,
) -> Result<(), TransferError> {
    let sftp = transport.session.sftp().map_err(TransferError::Sftp)?;
    let mut remote_file = sftp.open(Path::new(remote)).map_err(TransferError::Sftp)?;
    let mut local_file = std::fs::File::create(local).map_err(TransferError::Io)?;

    let mut buf = [0u8; READ_CHUNK];
    let mut transferred: u64 = 0;
    loop {
        let n = remote_file.read(&mut buf).map_err(TransferError::Io)?;
        if n == 0 {
            break;
        }
        local_file.write_all(&buf[..n]).map_err(TransferError::Io)?;
        transferred += n as u64;
        report_progress(transfers, events, id, transferred);
    }
    let _ = size;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotone_and_bounded() {
        let mut transfer = Transfer::new("c1", TransferDirection::Upload, "/a", "/b", 200);
        transfer.set_progress(0);
        assert_eq!(transfer.progress, 0);
        transfer.set_progress(100);
        assert_eq!(transfer.progress, 50);
        transfer.set_progress(200);
        assert_eq!(transfer.progress, 100);
    }

    #[test]
    fn zero_size_file_is_complete_immediately() {
        let mut transfer = Transfer::new("c1", TransferDirection::Upload, "/a", "/b", 0);
        transfer.set_progress(0);
        assert_eq!(transfer.progress, 100);
    }

    #[test]
    fn progress_step_crosses_five_percent_boundaries() {
        let crossed = |prev: u32, next: u32| (next / PROGRESS_STEP) > (prev / PROGRESS_STEP);
        assert!(crossed(4, 5));
        assert!(!crossed(5, 6));
        assert!(crossed(9, 10));
    }

    #[test]
    fn report_progress_emits_only_on_boundary_crossing() {
        let transfer = Transfer::new("c1", TransferDirection::Upload, "/a", "/b", 1000);
        let id = transfer.id.clone();
        let transfers = RwLock::new(HashMap::from([(id.clone(), transfer)]));
        let events: EventBus<TransferEvent> = EventBus::new();
        let mut rx = events.subscribe();

        report_progress(&transfers, &events, &id, 10); // 1%, no boundary crossed from 0
        report_progress(&transfers, &events, &id, 60); // 6%, crosses the first 5% boundary
        report_progress(&transfers, &events, &id, 65); // 6%, same boundary, no event

        rx.close();
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            TransferEvent::Progress(t) => assert_eq!(t.progress, 6),
            other => panic!("expected a progress event, got {other:?}"),
        }
    }

    #[test]
    fn batch_result_reports_partial_success() {
        let result = BatchResult { transfer_ids: vec!["a".into()], succeeded: 1, failed: 1 };
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
    }
}
