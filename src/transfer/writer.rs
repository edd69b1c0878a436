//! Disk writer for one inbound file transfer.
//!
//! Chunks may arrive out of order: they are buffered by index and the
//! contiguous prefix is appended to disk as it forms. The transfer
//! completes when the on-disk size reaches the advertised size. After
//! `file_end`, the writer polls the size up to 20 times (~1 s apart)
//! while still accepting stragglers; a stall unlinks the partial file
//! and fails the transfer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::constants::{FILE_STALL_POLLS, FILE_STALL_POLL_INTERVAL};
use crate::error::TransferError;

/// Commands accepted by the writer task.
enum WriterCmd {
    Chunk { index: u32, data: Vec<u8> },
    /// `file_end` was received from the sender.
    End,
    /// Abort immediately (owner disconnected, coordinator reset).
    Abort,
}

/// Handle to the writer task of one active inbound transfer.
pub struct FileWriter {
    path: PathBuf,
    tx: UnboundedSender<WriterCmd>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Pick a non-clobbering target path: existing files get a timestamp
/// suffix inserted before the extension.
pub fn resolve_collision(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let renamed = match path.extension() {
        Some(ext) => format!("{stem}_{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{stamp}"),
    };
    path.with_file_name(renamed)
}

impl FileWriter {
    /// Open the target file (with collision renaming) and start the task.
    ///
    /// `processing` is cleared when the transfer completes or fails, so
    /// the coordinator's one-inbound-transfer rule releases itself.
    pub async fn create(
        requested_path: &Path,
        expected_size: u64,
        processing: Arc<AtomicBool>,
    ) -> Result<Self, TransferError> {
        let path = resolve_collision(requested_path);
        let file = File::create(&path).await?;
        log::info!(
            "[Transfer] Receiving {} ({expected_size} bytes)",
            path.display()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            let result = write_loop(file, &task_path, expected_size, rx).await;
            match result {
                Ok(()) => log::info!("[Transfer] Completed {}", task_path.display()),
                Err(e) => {
                    log::error!("[Transfer] Failed {}: {e}", task_path.display());
                    let _ = tokio::fs::remove_file(&task_path).await;
                }
            }
            processing.store(false, Ordering::SeqCst);
        });

        Ok(Self { path, tx, task })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Feed one decoded (decompressed) chunk.
    pub fn push_chunk(&self, index: u32, data: Vec<u8>) {
        let _ = self.tx.send(WriterCmd::Chunk { index, data });
    }

    /// Signal that the sender finished (`file_end`).
    pub fn finish(&self) {
        let _ = self.tx.send(WriterCmd::End);
    }

    /// Drop the transfer and unlink the partial file.
    pub fn abort(&self) {
        if self.tx.send(WriterCmd::Abort).is_err() {
            // Task already gone; nothing to abort.
            self.task.abort();
        }
    }
}

async fn write_loop(
    mut file: File,
    path: &Path,
    expected_size: u64,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) -> Result<(), TransferError> {
    let mut out_of_order: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut next_index: u32 = 0;
    let mut written: u64 = 0;
    let mut ended = false;
    let mut polls_left = FILE_STALL_POLLS;

    loop {
        if written >= expected_size {
            file.flush().await?;
            return Ok(());
        }

        let cmd = if ended {
            // After file_end keep accepting stragglers, but poll the size
            // on a fixed cadence and give up once the polls run out.
            match tokio::time::timeout(FILE_STALL_POLL_INTERVAL, rx.recv()).await {
                Ok(cmd) => cmd,
                Err(_) => {
                    polls_left = polls_left.saturating_sub(1);
                    if polls_left == 0 {
                        return Err(TransferError::SizeStall {
                            expected: expected_size,
                            got: written,
                        });
                    }
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match cmd {
            Some(WriterCmd::Chunk { index, data }) => {
                if index < next_index {
                    log::warn!("[Transfer] Duplicate chunk {index} for {}", path.display());
                    continue;
                }
                out_of_order.insert(index, data);
                // Flush the contiguous prefix.
                while let Some(data) = out_of_order.remove(&next_index) {
                    file.write_all(&data).await?;
                    written += data.len() as u64;
                    next_index += 1;
                }
            }
            Some(WriterCmd::End) => {
                ended = true;
            }
            Some(WriterCmd::Abort) | None => {
                return Err(TransferError::SizeStall {
                    expected: expected_size,
                    got: written,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_clear(flag: &Arc<AtomicBool>) {
        for _ in 0..100 {
            if !flag.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("processing flag never cleared");
    }

    #[tokio::test]
    async fn test_in_order_chunks_complete() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("data.bin");
        let processing = Arc::new(AtomicBool::new(true));

        let payload = b"hello world, hello disk".to_vec();
        let writer = FileWriter::create(&target, payload.len() as u64, Arc::clone(&processing))
            .await
            .unwrap();

        writer.push_chunk(0, payload[..10].to_vec());
        writer.push_chunk(1, payload[10..].to_vec());
        writer.finish();

        wait_clear(&processing).await;
        assert_eq!(std::fs::read(&target).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_reassemble() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("data.bin");
        let processing = Arc::new(AtomicBool::new(true));

        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let writer = FileWriter::create(&target, payload.len() as u64, Arc::clone(&processing))
            .await
            .unwrap();

        // Deliver chunks in reverse.
        let chunks: Vec<&[u8]> = payload.chunks(1000).collect();
        for (i, chunk) in chunks.iter().enumerate().rev() {
            writer.push_chunk(i as u32, chunk.to_vec());
        }
        writer.finish();

        wait_clear(&processing).await;
        assert_eq!(std::fs::read(&target).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_abort_unlinks_partial_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("data.bin");
        let processing = Arc::new(AtomicBool::new(true));

        let writer = FileWriter::create(&target, 1000, Arc::clone(&processing))
            .await
            .unwrap();
        writer.push_chunk(0, vec![1, 2, 3]);
        // Give the task a beat to write the prefix, then abort.
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.abort();

        wait_clear(&processing).await;
        assert!(!target.exists(), "partial file must be unlinked");
    }

    #[tokio::test]
    async fn test_collision_naming_keeps_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("report.pdf");
        std::fs::write(&target, b"existing").unwrap();

        let resolved = resolve_collision(&target);
        assert_ne!(resolved, target);
        let name = resolved.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("report_"), "got {name}");
        assert!(name.ends_with(".pdf"), "got {name}");
    }

    #[tokio::test]
    async fn test_no_collision_keeps_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("fresh.txt");
        assert_eq!(resolve_collision(&target), target);
    }
}
