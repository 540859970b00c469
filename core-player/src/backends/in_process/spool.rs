//! Spool-file downloader for the in-process engine.
//!
//! The track's bytes are streamed into a file in the cache directory while a
//! second handle on the same file feeds the decoder, so playback starts long
//! before the download finishes. The spool exposes three observable facts:
//! bytes written so far, completion, and failure.
//!
//! Transient stream errors are retried with a fixed backoff, resuming from
//! the current offset. When the attempt budget is exhausted the spool is
//! marked failed and the session ends.

use crate::error::{PlayerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Poll cadence of the prebuffer gate.
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Gate polls before giving up on the source.
const GATE_POLL_ATTEMPTS: u32 = 50;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Where track bytes come from. The real source speaks HTTP (and reads
/// local files); tests inject scripted sources.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Open the source starting `offset` bytes in.
    async fn open(&self, url: &str, offset: u64) -> Result<ByteStream>;
}

/// HTTP (range-resumable) and local-file source.
pub struct DefaultByteSource {
    client: reqwest::Client,
}

impl DefaultByteSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DefaultByteSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ByteSource for DefaultByteSource {
    async fn open(&self, url: &str, offset: u64) -> Result<ByteStream> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let mut request = self.client.get(url);
            if offset > 0 {
                request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
            }
            let response = request
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|err| PlayerError::Http(err.to_string()))?;
            Ok(response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|err| PlayerError::Http(err.to_string())))
                .boxed())
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            let mut file = tokio::fs::File::open(path).await?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset)).await?;
            }
            Ok(tokio_util::io::ReaderStream::new(file)
                .map(|chunk| chunk.map_err(PlayerError::Io))
                .boxed())
        }
    }
}

/// A spool file being filled by a background download task.
pub struct Spool {
    path: PathBuf,
    written: Arc<AtomicU64>,
    complete: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl Spool {
    /// Create the spool file and launch the download task. The task runs
    /// until completion, failure, or cancellation.
    pub async fn start(
        source: Arc<dyn ByteSource>,
        url: String,
        dir: PathBuf,
        retry_attempts: u32,
        retry_backoff: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        static SPOOL_SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SPOOL_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("tunecore-spool-{}-{seq}", std::process::id()));

        let file = tokio::fs::File::create(&path).await?;

        let written = Arc::new(AtomicU64::new(0));
        let complete = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        tokio::spawn(download_task(
            source,
            url,
            file,
            Arc::clone(&written),
            Arc::clone(&complete),
            Arc::clone(&failed),
            retry_attempts.max(1),
            retry_backoff,
            cancel,
        ));

        Ok(Self {
            path,
            written,
            complete,
            failed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Prebuffer gate: wait until at least `bytes` are spooled (or the
    /// download finished with less). Polls at a fixed cadence with a bounded
    /// attempt count; a failed spool aborts the wait immediately.
    pub async fn wait_for_bytes(&self, bytes: u64) -> Result<()> {
        for _ in 0..GATE_POLL_ATTEMPTS {
            if self.is_failed() {
                return Err(PlayerError::Source("download failed".to_string()));
            }
            if self.written() >= bytes || self.is_complete() {
                return Ok(());
            }
            tokio::time::sleep(GATE_POLL_INTERVAL).await;
        }
        Err(PlayerError::Timeout(format!(
            "waiting for {bytes} spooled bytes"
        )))
    }

    /// Best-effort removal of the spool file. Called on session teardown.
    pub async fn remove(&self) {
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!(path = %self.path.display(), %err, "spool cleanup failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn download_task(
    source: Arc<dyn ByteSource>,
    url: String,
    mut file: tokio::fs::File,
    written: Arc<AtomicU64>,
    complete: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    retry_attempts: u32,
    retry_backoff: Duration,
    cancel: CancellationToken,
) {
    for attempt in 1..=retry_attempts {
        let offset = written.load(Ordering::Acquire);
        let mut stream = match source.open(&url, offset).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%url, attempt, %err, "source open failed");
                if !backoff_or_cancel(retry_backoff, &cancel, attempt, retry_attempts).await {
                    break;
                }
                continue;
            }
        };

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if let Err(err) = file.write_all(&bytes).await {
                        tracing::error!(%url, %err, "spool write failed");
                        failed.store(true, Ordering::Release);
                        return;
                    }
                    written.fetch_add(bytes.len() as u64, Ordering::Release);
                }
                Some(Err(err)) => {
                    tracing::warn!(%url, attempt, %err, "download interrupted");
                    break;
                }
                None => {
                    if let Err(err) = file.flush().await {
                        tracing::error!(%url, %err, "spool flush failed");
                        failed.store(true, Ordering::Release);
                        return;
                    }
                    complete.store(true, Ordering::Release);
                    tracing::debug!(%url, bytes = written.load(Ordering::Acquire), "download complete");
                    return;
                }
            }
        }

        if !backoff_or_cancel(retry_backoff, &cancel, attempt, retry_attempts).await {
            break;
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    tracing::error!(%url, attempts = retry_attempts, "download attempts exhausted");
    failed.store(true, Ordering::Release);
}

/// Sleep out the backoff between attempts. Returns false when the budget is
/// spent or the session was cancelled.
async fn backoff_or_cancel(
    backoff: Duration,
    cancel: &CancellationToken,
    attempt: u32,
    budget: u32,
) -> bool {
    if attempt >= budget {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scripted source: serves `chunks` then either ends or errors.
    struct ScriptedSource {
        chunks: Vec<Vec<u8>>,
        fail_after: bool,
        opens: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(chunks: Vec<Vec<u8>>, fail_after: bool) -> Self {
            Self {
                chunks,
                fail_after,
                opens: AtomicUsize::new(0),
            }
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ByteSource for ScriptedSource {
        async fn open(&self, _url: &str, offset: u64) -> Result<ByteStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let mut items: Vec<Result<Bytes>> = Vec::new();
            let mut skip = offset as usize;
            for chunk in &self.chunks {
                if skip >= chunk.len() {
                    skip -= chunk.len();
                    continue;
                }
                items.push(Ok(Bytes::copy_from_slice(&chunk[skip..])));
                skip = 0;
            }
            if self.fail_after {
                items.push(Err(PlayerError::Http("connection reset".to_string())));
            }
            Ok(futures_util::stream::iter(items).boxed())
        }
    }

    async fn wait_until(spool: &Spool, pred: impl Fn(&Spool) -> bool) {
        for _ in 0..100 {
            if pred(spool) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_spool_completes_and_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(
            vec![vec![1u8; 300], vec![2u8; 300]],
            false,
        ));
        let spool = Spool::start(
            source,
            "http://example.test/a.mp3".to_string(),
            dir.path().to_path_buf(),
            4,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        spool.wait_for_bytes(512).await.unwrap();
        wait_until(&spool, |s| s.is_complete()).await;
        assert_eq!(spool.written(), 600);
        assert_eq!(tokio::fs::metadata(spool.path()).await.unwrap().len(), 600);
    }

    #[tokio::test]
    async fn test_gate_passes_on_short_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![vec![7u8; 100]], false));
        let spool = Spool::start(
            source,
            "http://example.test/tiny.mp3".to_string(),
            dir.path().to_path_buf(),
            4,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // Fewer bytes than the gate asks for, but the download is complete.
        spool.wait_for_bytes(512).await.unwrap();
        assert!(spool.is_complete());
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![], true));
        let spool = Spool::start(
            Arc::clone(&source) as Arc<dyn ByteSource>,
            "http://example.test/broken.mp3".to_string(),
            dir.path().to_path_buf(),
            4,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        wait_until(&spool, |s| s.is_failed()).await;
        assert_eq!(source.open_count(), 4);
        assert!(spool.wait_for_bytes(512).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        // Every open serves 200 bytes then errors; resumption via offset
        // keeps the total correct across attempts.
        let source = Arc::new(ScriptedSource::new(vec![vec![9u8; 200]], true));
        let spool = Spool::start(
            Arc::clone(&source) as Arc<dyn ByteSource>,
            "http://example.test/flaky.mp3".to_string(),
            dir.path().to_path_buf(),
            4,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        wait_until(&spool, |s| s.is_failed()).await;
        // First attempt wrote 200 bytes; later attempts resumed past the end
        // of the scripted data and added nothing.
        assert_eq!(spool.written(), 200);
    }

    #[tokio::test]
    async fn test_cancellation_stops_download() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![], true));
        let cancel = CancellationToken::new();
        let spool = Spool::start(
            Arc::clone(&source) as Arc<dyn ByteSource>,
            "http://example.test/x.mp3".to_string(),
            dir.path().to_path_buf(),
            1000,
            Duration::from_millis(50),
            cancel.clone(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(75)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let opens = source.open_count();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // No further attempts after cancellation.
        assert_eq!(source.open_count(), opens);
        assert!(!spool.is_complete());
    }
}
