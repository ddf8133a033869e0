//! Concurrent chunked transfer engine: resumable range downloads and
//! block-split uploads with per-block digest checks.

pub mod credentials;
pub mod digest;
pub mod download;
mod error;
pub mod metadata;
pub mod plan;
pub mod pool;
mod progress;
pub mod remote;
mod retry;
mod session;
pub mod upload;
mod validation;

use std::future::Future;
use std::pin::Pin;

pub use credentials::{
    CachedCredentials, CredentialProvider, StaticCredentials, TokenGrant, TokenRefresher,
};
pub use digest::{deobfuscate, obfuscate};
pub use download::{DownloadOptions, DownloadOutcome, DownloadRequest, Downloader};
pub use error::{SessionError, TransferError};
pub use metadata::{ChunkRecord, ChunkStatus, MetadataStore};
pub use plan::{ByteRange, UploadDigests, plan_download, plan_upload};
pub use pool::WorkerPool;
pub use progress::{ProgressCallback, ProgressReporter, SpeedCalculator, TransferProgress};
pub use remote::{
    BlockTarget, BodyStream, CommitRequest, PrecreateRequest, PrecreateResponse, RangeResponse,
    RangeSource, RemoteFile, UploadRemote,
};
pub use retry::RetryPolicy;
pub use session::{Direction, SessionState, TransferReport, TransferSession};
pub use upload::{UploadOptions, UploadOutcome, UploadPlan, UploadRequest, Uploader};
pub use validation::{app_scoped_path, validate_remote_path};

/// Boxed future returned by the object-safe remote and credential traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Upload block size fixed by the remote: 4 MiB.
pub const UPLOAD_BLOCK_SIZE: u64 = 4 * MIB;
