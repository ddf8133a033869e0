//! Resumable multi-worker range download.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::info;

use crate::credentials::{CredentialProvider, authorized};
use crate::digest::file_md5;
use crate::metadata::{self, MetadataStore, metadata_path, remove_if_exists};
use crate::plan::{ByteRange, plan_download};
use crate::pool::{WorkerPool, attempt_chunk};
use crate::progress::ProgressReporter;
use crate::remote::RangeSource;
use crate::retry::RetryPolicy;
use crate::session::{Direction, SessionState, TransferReport, TransferSession};
use crate::validation::validate_remote_path;
use crate::{MIB, SessionError, TransferError};

/// Smallest and largest accepted download block, in MiB.
pub const BLOCK_SIZE_MIB_RANGE: std::ops::RangeInclusive<u64> = 1..=100;

/// What to download and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Direct download URL of the remote file.
    pub url: String,
    /// Remote logical path, used for validation and reporting.
    pub resource_path: String,
    pub local_path: PathBuf,
    /// Size in bytes if already known; looked up from the source otherwise.
    pub total_size: Option<u64>,
    /// Raw md5 of the remote file; enables the final verification.
    pub expected_md5: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub block_size_mib: u64,
    /// Pool size; `None` picks one less than the available parallelism.
    pub workers: Option<usize>,
    /// Delete an existing local file and its metadata before starting.
    pub overwrite: bool,
    /// Ignore `Done` records in existing metadata and fetch everything again.
    pub recheck: bool,
    pub retry: RetryPolicy,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            block_size_mib: 10,
            workers: None,
            overwrite: false,
            recheck: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadOptions {
    /// Block size in bytes.
    pub fn block_size(&self) -> Result<u64, TransferError> {
        if !BLOCK_SIZE_MIB_RANGE.contains(&self.block_size_mib) {
            return Err(TransferError::Config(format!(
                "block size must be between 1 and 100 MiB, got {}",
                self.block_size_mib
            )));
        }
        Ok(self.block_size_mib * MIB)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed(TransferReport),
    /// The local file already existed without resume metadata and
    /// `overwrite` was off, so nothing was transferred.
    SkippedExisting { local_path: PathBuf },
}

/// Coordinates one download at a time against a [`RangeSource`].
pub struct Downloader {
    source: Arc<dyn RangeSource>,
    credentials: Arc<dyn CredentialProvider>,
    progress: Option<Arc<ProgressReporter>>,
}

struct ChunkContext {
    source: Arc<dyn RangeSource>,
    credentials: Arc<dyn CredentialProvider>,
    store: MetadataStore,
    progress: Option<Arc<ProgressReporter>>,
    retry: RetryPolicy,
    url: String,
    local_path: PathBuf,
}

impl Downloader {
    pub fn new(source: Arc<dyn RangeSource>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            source,
            credentials,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Downloads `request.url` into `request.local_path`.
    ///
    /// Progress is checkpointed in `<local_path>.meta`; calling again with
    /// the same arguments after a [`SessionError::Resumable`] continues
    /// where the previous run stopped.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        options: &DownloadOptions,
    ) -> Result<DownloadOutcome, SessionError> {
        let block_size = options.block_size().map_err(SessionError::from_setup)?;
        validate_remote_path(&request.resource_path).map_err(SessionError::from_setup)?;
        if request.url.is_empty() {
            return Err(SessionError::Config("empty download URL".into()));
        }
        if request.total_size == Some(0) {
            return Err(SessionError::Config("cannot download an empty file".into()));
        }

        let local = request.local_path.as_path();
        let meta_path = metadata_path(local);
        if options.overwrite {
            remove_if_exists(local).await.map_err(SessionError::from_setup)?;
            remove_if_exists(&meta_path).await.map_err(SessionError::from_setup)?;
        } else if path_exists(local).await && !path_exists(&meta_path).await {
            info!(path = %local.display(), "local file exists without resume metadata, skipping");
            return Ok(DownloadOutcome::SkippedExisting {
                local_path: request.local_path.clone(),
            });
        }

        let session = TransferSession::new(
            Direction::Download,
            &request.resource_path,
            request.local_path.clone(),
        );
        match self.run(&session, request, options, block_size, meta_path).await {
            Ok(report) => {
                session.complete();
                Ok(DownloadOutcome::Completed(report))
            }
            Err(e) => {
                session.fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        session: &TransferSession,
        request: &DownloadRequest,
        options: &DownloadOptions,
        block_size: u64,
        meta_path: PathBuf,
    ) -> Result<TransferReport, SessionError> {
        let total_size = match request.total_size {
            Some(size) => size,
            None => self
                .lookup_size(&request.url, &options.retry)
                .await
                .map_err(SessionError::from_setup)?,
        };
        let ranges = plan_download(total_size, block_size);
        session.set_plan(total_size, block_size);

        session.advance(SessionState::Resuming);
        let existing = metadata::load(&meta_path).await.map_err(SessionError::Resumable)?;
        if options.recheck && existing.is_some() {
            info!(path = %meta_path.display(), "recheck requested, refetching completed chunks");
        }
        let existing = existing.filter(|_| !options.recheck);
        let local_len = local_file_len(&request.local_path).await;
        let existing = existing.and_then(|map| metadata::backed_by_local_file(map, local_len));
        prepare_local_file(&request.local_path, total_size)
            .await
            .map_err(SessionError::Resumable)?;
        let store = MetadataStore::new(meta_path, metadata::merge(&ranges, existing.as_ref()));
        store.persist().await.map_err(SessionError::Resumable)?;

        let (resumed_bytes, resumed_chunks) = store.completed().await;
        if let Some(progress) = &self.progress {
            progress.begin(total_size, ranges.len());
            progress.record_resumed(resumed_bytes, resumed_chunks);
        }
        let pending = store.pending().await;

        session.advance(SessionState::Transferring);
        let pool = WorkerPool::new(options.workers, pending.len());
        info!(
            path = %request.resource_path,
            size = total_size,
            chunks = ranges.len(),
            pending = pending.len(),
            workers = pool.workers(),
            "starting download"
        );
        let ctx = Arc::new(ChunkContext {
            source: Arc::clone(&self.source),
            credentials: Arc::clone(&self.credentials),
            store,
            progress: self.progress.clone(),
            retry: options.retry.clone(),
            url: request.url.clone(),
            local_path: request.local_path.clone(),
        });
        let task_ctx = Arc::clone(&ctx);
        pool.run(pending, move |worker, range| {
            let ctx = Arc::clone(&task_ctx);
            async move { ctx.transfer_chunk(worker, range).await }
        })
        .await
        .map_err(SessionError::Resumable)?;

        if let Some(expected) = &request.expected_md5 {
            session.advance(SessionState::Verifying);
            let path = request.local_path.clone();
            let actual = tokio::task::spawn_blocking(move || file_md5(&path))
                .await
                .map_err(|e| SessionError::Resumable(TransferError::Worker(e.to_string())))?
                .map_err(SessionError::Resumable)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SessionError::Terminal(TransferError::IntegrityMismatch(
                    format!("file digest {actual} does not match expected {expected}"),
                )));
            }
        }

        ctx.store.remove().await.map_err(SessionError::Resumable)?;
        Ok(session.report(
            total_size - resumed_bytes,
            ranges.len(),
            resumed_chunks,
        ))
    }

    async fn lookup_size(&self, url: &str, retry: &RetryPolicy) -> Result<u64, TransferError> {
        let size = retry
            .run("size lookup", |_| {
                authorized(self.credentials.as_ref(), |token| async move {
                    self.source.content_length(url, &token).await
                })
            })
            .await?;
        if size == 0 {
            return Err(TransferError::Config("remote file is empty".into()));
        }
        Ok(size)
    }
}

impl ChunkContext {
    async fn transfer_chunk(&self, worker: usize, range: ByteRange) -> Result<(), TransferError> {
        let bytes = attempt_chunk(&self.store, &self.retry, worker, range, || {
            self.fetch_chunk(range)
        })
        .await?;
        if let Some(progress) = &self.progress {
            progress.record(bytes, 1);
        }
        Ok(())
    }

    /// One attempt: request the range, check what came back and write it
    /// at its offset.
    async fn fetch_chunk(&self, range: ByteRange) -> Result<u64, TransferError> {
        let response = match authorized(self.credentials.as_ref(), |token| async move {
            self.source.fetch_range(&self.url, &token, range).await
        })
        .await
        {
            Ok(response) => response,
            Err(e) => {
                if let TransferError::Http { status } = e {
                    self.store.record_status(range, status).await;
                }
                return Err(e);
            }
        };
        self.store.record_status(range, response.status).await;
        if response.status != 200 && response.status != 206 {
            return Err(TransferError::Http {
                status: response.status,
            });
        }
        check_content_range(response.content_range.as_deref(), range)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.local_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(range.start)).await?;

        let expected = range.len();
        let mut written = 0u64;
        let mut body = response.body;
        while let Some(piece) = body.next().await {
            let piece = piece?;
            if written + piece.len() as u64 > expected {
                return Err(TransferError::IntegrityMismatch(format!(
                    "body for range {range} is longer than {expected} bytes"
                )));
            }
            file.write_all(&piece).await?;
            written += piece.len() as u64;
        }
        file.flush().await?;
        file.sync_data().await?;

        if written < expected {
            return Err(TransferError::Transport(format!(
                "body for range {range} ended after {written} of {expected} bytes"
            )));
        }
        Ok(written)
    }
}

/// Requires `Content-Range` to declare exactly `bytes {start}-{end}`,
/// optionally followed by `/total`.
pub fn check_content_range(header: Option<&str>, range: ByteRange) -> Result<(), TransferError> {
    let declared = header.unwrap_or("").trim();
    let wanted = format!("bytes {}-{}", range.start, range.end);
    let exact = declared
        .strip_prefix(&wanted)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
    if exact {
        Ok(())
    } else {
        Err(TransferError::IntegrityMismatch(format!(
            "requested bytes={range}, server declared {:?}",
            header.unwrap_or("<none>")
        )))
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn local_file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// Creates the local file (and its directory) and sizes it to `total_size`.
async fn prepare_local_file(path: &Path, total_size: u64) -> Result<(), TransferError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await?;
    file.set_len(total_size).await?;
    Ok(())
}
