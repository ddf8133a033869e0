//! Block-split upload with per-block digest verification.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

use crate::credentials::{CredentialProvider, authorized};
use crate::digest::obfuscate;
use crate::metadata::{
    self, ChunkMap, ChunkRecord, ChunkStatus, MetadataStore, load_json, merge, remove_if_exists, save_json,
};
use crate::plan::{ByteRange, plan_download, plan_upload};
use crate::pool::{WorkerPool, attempt_chunk};
use crate::progress::ProgressReporter;
use crate::remote::{BlockTarget, CommitRequest, PrecreateRequest, RemoteFile, UploadRemote};
use crate::retry::RetryPolicy;
use crate::session::{Direction, SessionState, TransferReport, TransferSession};
use crate::validation::validate_remote_path;
use crate::{SessionError, TransferError, UPLOAD_BLOCK_SIZE};

/// Everything needed to commit an upload whose blocks were all accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPlan {
    pub remote_path: String,
    pub size: u64,
    pub block_digests: Vec<String>,
    pub upload_id: String,
    pub server: String,
    pub rename_policy: u8,
}

impl UploadPlan {
    /// Whether a saved plan describes the same local content and target.
    fn resumes(&self, remote_path: &str, size: u64, block_digests: &[String], rename_policy: u8) -> bool {
        self.remote_path == remote_path
            && self.size == size
            && self.block_digests == block_digests
            && self.rename_policy == rename_policy
    }
}

/// Returns the path of the saved upload plan: `<local>.upload`.
pub fn upload_plan_path(local: &Path) -> PathBuf {
    let mut name = OsString::from(local.as_os_str());
    name.push(".upload");
    PathBuf::from(name)
}

/// Returns the path of the per-block records: `<local>.upload.meta`.
pub fn upload_metadata_path(local: &Path) -> PathBuf {
    metadata::metadata_path(&upload_plan_path(local))
}

/// Deletes the checkpoint kept for an interrupted upload of `local`.
pub async fn discard_checkpoint(local: &Path) -> Result<(), TransferError> {
    remove_if_exists(&upload_metadata_path(local)).await?;
    remove_if_exists(&upload_plan_path(local)).await
}

/// Loads the checkpoint of an earlier attempt at the same upload.
async fn load_checkpoint(
    local: &Path,
    remote_path: &str,
    size: u64,
    block_digests: &[String],
    rename_policy: u8,
) -> Result<Option<(UploadPlan, Option<ChunkMap>)>, TransferError> {
    let Some(plan) = load_json::<UploadPlan>(&upload_plan_path(local)).await? else {
        return Ok(None);
    };
    if !plan.resumes(remote_path, size, block_digests, rename_policy) {
        info!(path = %local.display(), "local file or target changed, starting a new upload session");
        discard_checkpoint(local).await?;
        return Ok(None);
    }
    let records = metadata::load(&upload_metadata_path(local)).await?;
    Ok(Some((plan, records)))
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    /// Absolute remote destination.
    pub remote_path: String,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Pool size; `None` picks one less than the available parallelism.
    pub workers: Option<usize>,
    /// Naming-conflict policy sent as `rtype` (0 to 3).
    pub rename_policy: u8,
    pub retry: RetryPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            workers: None,
            rename_policy: 1,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub file: RemoteFile,
    pub report: TransferReport,
}

/// Coordinates uploads against an [`UploadRemote`].
pub struct Uploader {
    remote: Arc<dyn UploadRemote>,
    credentials: Arc<dyn CredentialProvider>,
    progress: Option<Arc<ProgressReporter>>,
}

struct BlockContext {
    remote: Arc<dyn UploadRemote>,
    credentials: Arc<dyn CredentialProvider>,
    store: MetadataStore,
    progress: Option<Arc<ProgressReporter>>,
    retry: RetryPolicy,
    target: BlockTarget,
    block_digests: Vec<String>,
    local_path: PathBuf,
}

impl Uploader {
    pub fn new(remote: Arc<dyn UploadRemote>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            remote,
            credentials,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Uploads `request.local_path` to `request.remote_path`.
    pub async fn upload(
        &self,
        request: &UploadRequest,
        options: &UploadOptions,
    ) -> Result<UploadOutcome, SessionError> {
        validate_remote_path(&request.remote_path).map_err(SessionError::from_setup)?;
        if options.rename_policy > 3 {
            return Err(SessionError::Config(format!(
                "rename policy must be between 0 and 3, got {}",
                options.rename_policy
            )));
        }
        let size = local_size(&request.local_path).await?;

        let session = TransferSession::new(
            Direction::Upload,
            &request.remote_path,
            request.local_path.clone(),
        );
        session.set_plan(size, UPLOAD_BLOCK_SIZE);
        match self.run(&session, request, options).await {
            Ok(outcome) => {
                session.complete();
                Ok(outcome)
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
        request: &UploadRequest,
        options: &UploadOptions,
    ) -> Result<UploadOutcome, SessionError> {
        let path = request.local_path.clone();
        let digests = tokio::task::spawn_blocking(move || plan_upload(&path, UPLOAD_BLOCK_SIZE))
            .await
            .map_err(|e| SessionError::Resumable(TransferError::Worker(e.to_string())))?
            .map_err(SessionError::from_setup)?;
        if digests.size == 0 {
            return Err(SessionError::Config("cannot upload an empty file".into()));
        }
        session.set_plan(digests.size, UPLOAD_BLOCK_SIZE);

        let saved = load_checkpoint(
            &request.local_path,
            &request.remote_path,
            digests.size,
            &digests.block_digests,
            options.rename_policy,
        )
        .await
        .map_err(SessionError::from_setup)?;

        let precreate = PrecreateRequest {
            remote_path: request.remote_path.clone(),
            size: digests.size,
            block_digests: digests.block_digests.clone(),
            content_md5: obfuscate(&digests.content_md5),
            slice_md5: digests.slice_md5.clone(),
            rename_policy: options.rename_policy,
            upload_id: saved.as_ref().map(|(plan, _)| plan.upload_id.clone()),
        };
        let prepared = options
            .retry
            .run("precreate", |_| {
                authorized(self.credentials.as_ref(), |token| {
                    let precreate = &precreate;
                    async move { self.remote.precreate(&token, precreate).await }
                })
            })
            .await
            .map_err(SessionError::Resumable)?;
        // Block records only carry over while the remote keeps the session.
        let resumed = saved
            .filter(|(plan, _)| plan.upload_id == prepared.upload_id)
            .and_then(|(_, records)| records);
        let upload_id = prepared.upload_id.as_str();
        let server = options
            .retry
            .run("locate upload server", |_| {
                authorized(self.credentials.as_ref(), |token| async move {
                    self.remote
                        .locate(&token, &request.remote_path, upload_id)
                        .await
                })
            })
            .await
            .map_err(SessionError::Resumable)?;

        let plan = UploadPlan {
            remote_path: request.remote_path.clone(),
            size: digests.size,
            block_digests: digests.block_digests,
            upload_id: prepared.upload_id.clone(),
            server,
            rename_policy: options.rename_policy,
        };
        info!(
            path = %plan.remote_path,
            upload_id = %plan.upload_id,
            server = %plan.server,
            blocks = plan.block_digests.len(),
            resumed = resumed.is_some(),
            "upload session prepared"
        );

        session.advance(SessionState::Resuming);
        let ranges = plan_download(plan.size, UPLOAD_BLOCK_SIZE);
        let records = block_records(&ranges, resumed.as_ref(), &prepared.pending_blocks);
        save_json(&upload_plan_path(&request.local_path), &plan)
            .await
            .map_err(SessionError::from_setup)?;
        let store = MetadataStore::new(upload_metadata_path(&request.local_path), records);
        store.persist().await.map_err(SessionError::from_setup)?;
        let (held_bytes, held_blocks) = store.completed().await;
        if held_blocks > 0 {
            info!(held_blocks, "skipping blocks the remote already holds");
        }
        if let Some(progress) = &self.progress {
            progress.begin(plan.size, ranges.len());
            progress.record_resumed(held_bytes, held_blocks);
        }

        session.advance(SessionState::Transferring);
        let pending = store.pending().await;
        let pool = WorkerPool::new(options.workers, pending.len());
        let ctx = Arc::new(BlockContext {
            remote: Arc::clone(&self.remote),
            credentials: Arc::clone(&self.credentials),
            store,
            progress: self.progress.clone(),
            retry: options.retry.clone(),
            target: BlockTarget {
                server: plan.server.clone(),
                remote_path: plan.remote_path.clone(),
                upload_id: plan.upload_id.clone(),
            },
            block_digests: plan.block_digests.clone(),
            local_path: request.local_path.clone(),
        });
        let task_ctx = Arc::clone(&ctx);
        pool.run(pending, move |worker, range| {
            let ctx = Arc::clone(&task_ctx);
            async move { ctx.transfer_block(worker, range).await }
        })
        .await
        .map_err(SessionError::Resumable)?;

        let file = self.commit(&plan, &options.retry).await?;
        if let Err(e) = discard_checkpoint(&request.local_path).await {
            warn!(error = %e, "could not remove upload checkpoint");
        }
        Ok(UploadOutcome {
            file,
            report: session.report(plan.size - held_bytes, ranges.len(), held_blocks),
        })
    }

    /// Materializes the remote file from an upload whose blocks were all
    /// accepted. Also used to retry after [`SessionError::CommitFailed`].
    pub async fn commit(
        &self,
        plan: &UploadPlan,
        retry: &RetryPolicy,
    ) -> Result<RemoteFile, SessionError> {
        let request = CommitRequest {
            remote_path: plan.remote_path.clone(),
            size: plan.size,
            block_digests: plan.block_digests.clone(),
            upload_id: plan.upload_id.clone(),
            rename_policy: plan.rename_policy,
        };
        let result = retry
            .run("commit", |_| {
                authorized(self.credentials.as_ref(), |token| {
                    let request = &request;
                    async move { self.remote.commit(&token, request).await }
                })
            })
            .await;
        match result {
            Ok(file) => {
                info!(path = %file.path, fs_id = file.fs_id, size = file.size, "upload committed");
                Ok(file)
            }
            Err(source) => {
                warn!(upload_id = %plan.upload_id, error = %source, "commit failed, blocks kept on remote");
                Err(SessionError::CommitFailed {
                    plan: Box::new(plan.clone()),
                    source,
                })
            }
        }
    }
}

impl BlockContext {
    async fn transfer_block(&self, worker: usize, range: ByteRange) -> Result<(), TransferError> {
        let bytes = attempt_chunk(&self.store, &self.retry, worker, range, || {
            self.send_block(range)
        })
        .await?;
        if let Some(progress) = &self.progress {
            progress.record(bytes, 1);
        }
        Ok(())
    }

    /// One attempt: read the block, send it and compare the digest the
    /// remote computed with the local one.
    async fn send_block(&self, range: ByteRange) -> Result<u64, TransferError> {
        let index = (range.start / UPLOAD_BLOCK_SIZE) as usize;
        let expected = self.block_digests.get(index).ok_or_else(|| {
            TransferError::Config(format!("no digest planned for block {index}"))
        })?;
        let data = read_block(&self.local_path, range).await?;

        let observed = authorized(self.credentials.as_ref(), |token| {
            let data = data.clone();
            async move {
                self.remote
                    .put_block(&token, &self.target, index, data)
                    .await
            }
        })
        .await?;
        if !observed.eq_ignore_ascii_case(expected) {
            return Err(TransferError::IntegrityMismatch(format!(
                "block {index} digest: sent {expected}, remote received {observed}"
            )));
        }
        Ok(range.len())
    }
}

/// Builds the block records for a session.
///
/// A non-empty `pending_blocks` from precreate is authoritative: listed
/// blocks are sent again and every other block is already held remotely.
fn block_records(
    ranges: &[ByteRange],
    resumed: Option<&ChunkMap>,
    pending_blocks: &[usize],
) -> ChunkMap {
    let mut records = merge(ranges, resumed);
    if pending_blocks.is_empty() {
        return records;
    }
    for (index, range) in ranges.iter().enumerate() {
        let record = if pending_blocks.contains(&index) {
            ChunkRecord::pending(*range)
        } else {
            let mut held = ChunkRecord::pending(*range);
            held.status = ChunkStatus::Done;
            held
        };
        records.insert(range.key(), record);
    }
    records
}

async fn local_size(path: &Path) -> Result<u64, SessionError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(meta) if meta.is_file() => Err(SessionError::Config(format!(
            "cannot upload an empty file: {}",
            path.display()
        ))),
        Ok(_) => Err(SessionError::Config(format!(
            "not a regular file: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SessionError::Config(format!(
            "local file not found: {}",
            path.display()
        ))),
        Err(e) => Err(SessionError::Resumable(e.into())),
    }
}

async fn read_block(path: &Path, range: ByteRange) -> Result<Bytes, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
