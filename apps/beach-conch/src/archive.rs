use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use crate::registry::now_millis;

/// Writes each relayed media frame verbatim to `<dir>/audio_<millis>.<ext>`.
///
/// Stamps are strictly increasing even when frames arrive within the same
/// millisecond, so no file is ever overwritten.
#[derive(Clone)]
pub struct FrameArchive {
    inner: Arc<ArchiveInner>,
}

struct ArchiveInner {
    dir: PathBuf,
    extension: String,
    last_stamp: AtomicU64,
}

impl FrameArchive {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ArchiveInner {
                dir: dir.into(),
                extension: extension.into().trim_start_matches('.').to_string(),
                last_stamp: AtomicU64::new(0),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn next_path(&self) -> PathBuf {
        let stamp = self.next_stamp(now_millis());
        self.inner
            .dir
            .join(format!("audio_{}.{}", stamp, self.inner.extension))
    }

    fn next_stamp(&self, now: u64) -> u64 {
        let mut current = self.inner.last_stamp.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.inner.last_stamp.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    pub async fn store(&self, frame: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.inner.dir).await?;
        let path = self.next_path();
        tokio::fs::write(&path, frame).await?;
        Ok(path)
    }

    /// Writes in the background; failures are logged and never reach the relay path.
    pub fn spawn_store(&self, frame: Bytes) {
        let archive = self.clone();
        tokio::spawn(async move {
            match archive.store(&frame).await {
                Ok(path) => debug!(path = %path.display(), bytes = frame.len(), "frame archived"),
                Err(err) => {
                    counter!("beach_conch_archive_failures_total", 1);
                    warn!(error = %err, dir = %archive.dir().display(), "failed to archive frame");
                }
            }
        });
    }
}
