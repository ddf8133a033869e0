//! Seams between the transfer engine and a concrete remote API.
//!
//! The engine only ever talks to these traits; `panbd-client` implements
//! them over HTTP and tests implement them in memory.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::plan::ByteRange;
use crate::{BoxFuture, TransferError};

/// Body of a range response, delivered incrementally.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// Response headers of a range request plus its streaming body.
pub struct RangeResponse {
    pub status: u16,
    /// Raw `Content-Range` header, if present.
    pub content_range: Option<String>,
    pub body: BodyStream,
}

/// A server that answers HTTP byte-range requests.
pub trait RangeSource: Send + Sync {
    /// Returns the full size of the resource at `url`.
    fn content_length<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<u64, TransferError>>;

    /// Requests `Range: bytes={start}-{end}` of `url`.
    ///
    /// Implementations map a transport failure or a non-success status to
    /// an error; any 2xx response is returned for the caller to validate.
    fn fetch_range<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
        range: ByteRange,
    ) -> BoxFuture<'a, Result<RangeResponse, TransferError>>;
}

/// Declares an upload before any block is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecreateRequest {
    pub remote_path: String,
    pub size: u64,
    pub block_digests: Vec<String>,
    /// Obfuscated whole-file digest.
    pub content_md5: String,
    /// Digest of the first 256 KiB.
    pub slice_md5: String,
    /// Naming-conflict policy (`rtype`).
    pub rename_policy: u8,
    /// Session to continue, from an earlier interrupted upload.
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecreateResponse {
    pub upload_id: String,
    /// Block indices the remote still needs. Empty means all of them.
    pub pending_blocks: Vec<usize>,
}

/// Where blocks of one upload session are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTarget {
    pub server: String,
    pub remote_path: String,
    pub upload_id: String,
}

/// Finalizes an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub remote_path: String,
    pub size: u64,
    pub block_digests: Vec<String>,
    pub upload_id: String,
    pub rename_policy: u8,
}

/// A file as materialized by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub fs_id: u64,
    pub path: String,
    pub size: u64,
    pub md5: String,
}

/// The vendor's multi-step upload protocol.
pub trait UploadRemote: Send + Sync {
    fn precreate<'a>(
        &'a self,
        token: &'a str,
        request: &'a PrecreateRequest,
    ) -> BoxFuture<'a, Result<PrecreateResponse, TransferError>>;

    /// Returns the base URL of the server that accepts blocks.
    fn locate<'a>(
        &'a self,
        token: &'a str,
        remote_path: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<String, TransferError>>;

    /// Sends block `index` and returns the md5 the server computed for it.
    fn put_block<'a>(
        &'a self,
        token: &'a str,
        target: &'a BlockTarget,
        index: usize,
        data: Bytes,
    ) -> BoxFuture<'a, Result<String, TransferError>>;

    fn commit<'a>(
        &'a self,
        token: &'a str,
        request: &'a CommitRequest,
    ) -> BoxFuture<'a, Result<RemoteFile, TransferError>>;
}
