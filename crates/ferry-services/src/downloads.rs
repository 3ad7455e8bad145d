//! Download ledger: what this node has asked for and how far each file got.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use ferry_core::FileId;

/// Progress report when nothing was ever requested.
pub const NO_TRANSFERS_MESSAGE: &str = "You have no active or past file transfers.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Requested,
    Receiving,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DownloadStatus::Requested => "Requested",
            DownloadStatus::Receiving => "Receiving",
            DownloadStatus::Completed => "Completed",
            DownloadStatus::Failed => "Failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub file_id: FileId,
    pub name: String,
    pub size: Option<u64>,
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub status: DownloadStatus,
    pub output: Option<PathBuf>,
    pub requested_at: Instant,
}

#[derive(Clone, Default)]
pub struct DownloadLedger {
    records: Arc<DashMap<FileId, DownloadRecord>>,
}

impl DownloadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a download. A repeat request for the same id resets it.
    pub fn record_request(&self, file_id: FileId, name: impl Into<String>, size: Option<u64>) {
        self.records.insert(
            file_id,
            DownloadRecord {
                file_id,
                name: name.into(),
                size,
                chunks_received: 0,
                total_chunks: 0,
                status: DownloadStatus::Requested,
                output: None,
                requested_at: Instant::now(),
            },
        );
    }

    /// Display name the download was requested under.
    pub fn name_for(&self, file_id: FileId) -> Option<String> {
        self.records.get(&file_id).map(|r| r.name.clone())
    }

    pub fn get(&self, file_id: FileId) -> Option<DownloadRecord> {
        self.records.get(&file_id).map(|r| r.clone())
    }

    /// Record how many chunks are staged. The count never goes backwards,
    /// and a finished download, completed or failed, stays finished until it
    /// is requested again.
    pub fn record_progress(&self, file_id: FileId, received: u32, total_chunks: u32) {
        if let Some(mut r) = self.records.get_mut(&file_id) {
            if r.status.is_finished() {
                return;
            }
            if r.total_chunks != total_chunks {
                r.total_chunks = total_chunks;
                r.chunks_received = received;
            } else {
                r.chunks_received = r.chunks_received.max(received);
            }
            r.status = DownloadStatus::Receiving;
        }
    }

    pub fn complete(&self, file_id: FileId, output: PathBuf) {
        if let Some(mut r) = self.records.get_mut(&file_id) {
            r.chunks_received = r.total_chunks;
            r.status = DownloadStatus::Completed;
            r.output = Some(output);
        }
    }

    pub fn fail(&self, file_id: FileId) {
        if let Some(mut r) = self.records.get_mut(&file_id) {
            r.status = DownloadStatus::Failed;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One `\t<name>\t<status>\r\n` line per download, oldest id first.
    pub fn progress_report(&self) -> String {
        if self.records.is_empty() {
            return NO_TRANSFERS_MESSAGE.to_string();
        }
        let mut records: Vec<DownloadRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.file_id);
        records
            .iter()
            .map(|r| format!("\t{}\t{}\r\n", r.name, r.status))
            .collect()
    }
}
