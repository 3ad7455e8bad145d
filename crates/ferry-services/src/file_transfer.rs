//! File transfer: chunking on the sending side, staging and reassembly on
//! the receiving side.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use ferry_core::wire::{encode_chunk, truncate_filename, ChunkHeader, MAX_FILENAME_LENGTH};
use ferry_core::{FileId, WireError};

use crate::connection::SocketWriter;

/// In-flight assemblies untouched for this long are discarded.
const ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of chunks a file of `size` bytes is sent as. Never zero: an empty
/// file still travels as one empty chunk so the receiver creates it.
pub fn chunk_count(size: u64, capacity: usize) -> u64 {
    let capacity = capacity.max(1) as u64;
    size.div_ceil(capacity).max(1)
}

// ── Sending ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub chunks: u32,
    pub bytes: u64,
}

/// Stream the file at `path` to `writer` as chunk frames.
///
/// Each frame is written whole under the writer lock, so control messages
/// sent to the same socket from other tasks land between frames, never
/// inside one.
pub async fn send_file(
    path: &Path,
    file_id: FileId,
    capacity: usize,
    writer: &SocketWriter,
) -> Result<SendSummary, TransferError> {
    let io_err = |source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).await.map_err(io_err)?;
    let size = file.metadata().await.map_err(io_err)?.len();
    let total = u32::try_from(chunk_count(size, capacity))
        .map_err(|_| TransferError::TooManyChunks(chunk_count(size, capacity)))?;

    let mut buf = vec![0u8; capacity.max(1)];
    let mut sent = 0u64;
    for index in 1..=total {
        let n = read_up_to(&mut file, &mut buf).await.map_err(io_err)?;
        let payload = &buf[..n];
        let header = ChunkHeader::for_payload(file_id, total, index, payload);
        let frame = encode_chunk(&header, payload)?;

        let mut w = writer.lock().await;
        w.write_all(&frame).await.map_err(TransferError::Socket)?;
        drop(w);

        sent += n as u64;
        tracing::trace!(file_id, index, total, bytes = n, "chunk sent");
    }
    writer
        .lock()
        .await
        .flush()
        .await
        .map_err(TransferError::Socket)?;

    tracing::debug!(file_id, chunks = total, bytes = sent, path = %path.display(), "file sent");
    Ok(SendSummary {
        chunks: total,
        bytes: sent,
    })
}

/// Fill `buf` as far as the file allows. Short only at end of file.
async fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ── Receiving ─────────────────────────────────────────────────────────────────

/// Result of handing one chunk to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Staged { received: u32, total: u32 },
    /// Already had this index; nothing written.
    Duplicate,
    /// Last missing chunk arrived; the merged file is at this path.
    Completed(PathBuf),
}

struct Assembly {
    total: u32,
    /// `received[i]` is set once part `i + 1` is on disk.
    received: Vec<bool>,
    count: u32,
    last_chunk_at: Instant,
    /// Set once the assembly has left the map. Whoever retires it owns the
    /// cleanup; tasks still waiting on its lock must look the name up again.
    retired: bool,
}

impl Assembly {
    fn new(total: u32) -> Self {
        Self {
            total,
            received: vec![false; total as usize],
            count: 0,
            last_chunk_at: Instant::now(),
            retired: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.count == self.total
    }
}

type AssemblySlot = Arc<Mutex<Assembly>>;

/// Tracks files being reassembled from incoming chunks.
#[derive(Clone)]
pub struct Reassembler {
    /// In-progress assemblies, keyed by truncated display name. Two downloads
    /// that share a name and a chunk total land in the same assembly, so the
    /// caller must not run them at the same time. Disk I/O happens under the
    /// per-assembly lock only.
    active: Arc<DashMap<String, AssemblySlot>>,
    staging_dir: PathBuf,
    output_dir: PathBuf,
}

impl Reassembler {
    pub fn new(staging_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            staging_dir,
            output_dir,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Stage one chunk of the file called `name`.
    pub async fn add_chunk(
        &self,
        name: &str,
        header: &ChunkHeader,
        payload: &[u8],
    ) -> Result<ChunkOutcome, TransferError> {
        if header.payload_len as usize != payload.len() {
            return Err(TransferError::LengthMismatch {
                declared: header.payload_len,
                actual: payload.len(),
            });
        }
        header.check_position()?;
        let key = storage_name(name)?;
        if !header.verify(payload) {
            return Err(TransferError::ChecksumMismatch {
                name: key,
                index: header.index,
            });
        }

        self.cleanup_stale().await;
        self.ensure_staging_dir().await?;

        loop {
            let slot = Arc::clone(
                self.active
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Assembly::new(header.total_chunks))))
                    .value(),
            );
            let mut assembly = slot.lock().await;
            if assembly.retired {
                continue;
            }

            if assembly.total != header.total_chunks {
                tracing::warn!(
                    name = %key,
                    old_total = assembly.total,
                    new_total = header.total_chunks,
                    "chunk count changed, restarting assembly"
                );
                self.retire(&key, &slot, &mut assembly);
                self.remove_parts(&key, &assembly).await;
                continue;
            }

            let index = (header.index - 1) as usize;
            if assembly.received[index] {
                tracing::debug!(name = %key, index = header.index, "duplicate chunk ignored");
                return Ok(ChunkOutcome::Duplicate);
            }

            let part = self.part_path(&key, header.index, assembly.total);
            fs::write(&part, payload).await.map_err(|source| TransferError::Io {
                path: part.clone(),
                source,
            })?;
            assembly.received[index] = true;
            assembly.count += 1;
            assembly.last_chunk_at = Instant::now();
            tracing::trace!(name = %key, index = header.index, total = assembly.total, "chunk staged");

            if !assembly.is_complete() {
                return Ok(ChunkOutcome::Staged {
                    received: assembly.count,
                    total: assembly.total,
                });
            }

            self.retire(&key, &slot, &mut assembly);
            let merged = self.merge(&key, &assembly).await;
            if merged.is_err() {
                self.remove_parts(&key, &assembly).await;
            }
            let output = merged?;
            tracing::info!(
                name = %key,
                chunks = assembly.total,
                path = %output.display(),
                "file received and reassembled"
            );
            return Ok(ChunkOutcome::Completed(output));
        }
    }

    /// Names of files currently being received.
    pub fn in_progress(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop an assembly and its staged parts. Returns whether there was one.
    pub async fn abandon(&self, name: &str) -> bool {
        let Ok(key) = storage_name(name) else {
            return false;
        };
        let Some((_, slot)) = self.active.remove(&key) else {
            return false;
        };
        let mut assembly = slot.lock().await;
        if assembly.retired {
            return false;
        }
        assembly.retired = true;
        self.remove_parts(&key, &assembly).await;
        tracing::warn!(name = %key, staged = assembly.count, "file assembly abandoned");
        true
    }

    /// Take `slot` out of the map if it is still the live entry for `key`.
    fn retire(&self, key: &str, slot: &AssemblySlot, assembly: &mut Assembly) {
        assembly.retired = true;
        self.active.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    async fn cleanup_stale(&self) {
        let candidates: Vec<(String, AssemblySlot)> = self
            .active
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for (key, slot) in candidates {
            // A locked assembly is being written to, so it is not stale.
            let Ok(mut assembly) = slot.try_lock() else {
                continue;
            };
            if assembly.retired || assembly.last_chunk_at.elapsed() <= ASSEMBLY_TIMEOUT {
                continue;
            }
            tracing::warn!(name = %key, "removing stale file assembly (timed out)");
            self.retire(&key, &slot, &mut assembly);
            self.remove_parts(&key, &assembly).await;
        }
    }

    async fn ensure_staging_dir(&self) -> Result<(), TransferError> {
        let io_err = |source| TransferError::Io {
            path: self.staging_dir.clone(),
            source,
        };
        fs::create_dir_all(&self.staging_dir).await.map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.staging_dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(io_err)?;
        }
        Ok(())
    }

    /// `<name>.pt.<index>.of.<total>.p2pft`, with the name shortened so the
    /// whole part name still fits a filename field.
    fn part_path(&self, key: &str, index: u32, total: u32) -> PathBuf {
        let suffix = format!(".pt.{index}.of.{total}.p2pft");
        let stem = truncate_filename(key, MAX_FILENAME_LENGTH.saturating_sub(suffix.len()));
        self.staging_dir.join(format!("{stem}{suffix}"))
    }

    async fn remove_parts(&self, key: &str, assembly: &Assembly) {
        for (i, present) in assembly.received.iter().enumerate() {
            if *present {
                let _ = fs::remove_file(self.part_path(key, i as u32 + 1, assembly.total)).await;
            }
        }
    }

    /// Concatenate parts 1..=N into a fresh output file, then delete them.
    async fn merge(&self, key: &str, assembly: &Assembly) -> Result<PathBuf, TransferError> {
        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| TransferError::Io {
                path: self.output_dir.clone(),
                source,
            })?;
        let (output, mut out) = create_unique(&self.output_dir, key).await?;

        for index in 1..=assembly.total {
            let part = self.part_path(key, index, assembly.total);
            let data = fs::read(&part).await.map_err(|source| TransferError::Io {
                path: part.clone(),
                source,
            })?;
            out.write_all(&data).await.map_err(|source| TransferError::Io {
                path: output.clone(),
                source,
            })?;
        }
        out.flush().await.map_err(|source| TransferError::Io {
            path: output.clone(),
            source,
        })?;

        self.remove_parts(key, assembly).await;
        Ok(output)
    }
}

/// Strip any directory components a sender may have put in the name and fit
/// it to the filename field.
fn storage_name(name: &str) -> Result<String, TransferError> {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .ok_or_else(|| TransferError::InvalidName(name.to_string()))?;
    Ok(truncate_filename(base, MAX_FILENAME_LENGTH))
}

/// `dir/name`, or `dir/name (1).ext`, `dir/name (2).ext`, ... for the first
/// name not already taken. Opened with create-new so nothing is clobbered.
async fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File), TransferError> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 0u32.. {
        let candidate = match (n, ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{stem} ({n}).{ext}"),
            (n, None) => format!("{stem} ({n})"),
        };
        let path = dir.join(candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(TransferError::Io { path, source }),
        }
    }
    Err(TransferError::InvalidName(name.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("socket write failed: {0}")]
    Socket(#[source] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("checksum mismatch on chunk {index} of {name}")]
    ChecksumMismatch { name: String, index: u32 },
    #[error("header declares {declared} bytes but payload has {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("file needs {0} chunks, more than the header can count")]
    TooManyChunks(u64),
    #[error("unusable file name {0:?}")]
    InvalidName(String),
}
