/*!
Serial disk worker.

All file writes of the node go through one queue so disk latency never
stalls crypto or the logic tasks. Files are written next to their final
location and renamed into place, so readers never observe a half-written
file.
*/

use std::path::PathBuf;

use futures::channel::mpsc;
use futures::StreamExt;

/// One unit of disk work.
#[derive(Debug)]
enum DiskJob {
    Write { path: PathBuf, bytes: Vec<u8> },
    Remove { path: PathBuf },
}

/// Handle to the serial disk worker task.
#[derive(Clone, Debug)]
pub struct DiskWorker {
    tx: mpsc::UnboundedSender<DiskJob>,
}

impl DiskWorker {
    /// Create the worker handle and the task that drains it. The caller
    /// spawns the returned future on its runtime.
    pub fn new() -> (DiskWorker, impl std::future::Future<Output = ()>) {
        let (tx, rx) = mpsc::unbounded();
        (DiskWorker { tx }, run(rx))
    }

    /// Queue an atomic write of `bytes` to `path`.
    pub fn write_file(&self, path: PathBuf, bytes: Vec<u8>) {
        if self.tx.unbounded_send(DiskJob::Write { path, bytes }).is_err() {
            warn!("disk worker is gone, dropping write");
        }
    }

    /// Queue removal of `path`.
    pub fn remove_file(&self, path: PathBuf) {
        if self.tx.unbounded_send(DiskJob::Remove { path }).is_err() {
            warn!("disk worker is gone, dropping removal");
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<DiskJob>) {
    while let Some(job) = rx.next().await {
        match job {
            DiskJob::Write { path, bytes } => {
                if let Err(e) = write_atomic(&path, &bytes).await {
                    error!("failed to write {}: {}", path.display(), e);
                }
            }
            DiskJob::Remove { path } => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!("failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

async fn write_atomic(path: &PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.clone();
    tmp.set_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, task) = DiskWorker::new();
        let handle = tokio::spawn(task);

        let path = dir.path().join("a").join("file.signed");
        worker.write_file(path.clone(), b"payload".to_vec());

        // the worker drains jobs in order, so a second job acts as a fence
        let fence = dir.path().join("fence");
        worker.write_file(fence.clone(), Vec::new());
        while !fence.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        worker.remove_file(path.clone());
        drop(worker);
        handle.await.unwrap();
        assert!(!path.exists());
    }
}
