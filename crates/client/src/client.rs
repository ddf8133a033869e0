//! Netdisk API client.
//!
//! Async HTTP client using `reqwest`; the access token travels as the
//! `access_token` query parameter on every call.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use serde::de::DeserializeOwned;
use tracing::debug;

use panbd_transfer::{
    BlockTarget, BoxFuture, ByteRange, CommitRequest, PrecreateRequest, PrecreateResponse,
    RangeResponse, RangeSource, RemoteFile, TransferError, UploadRemote, deobfuscate,
    validate_remote_path,
};

use crate::error::ClientError;
use crate::types::{
    BlockReply, CreateReply, DownloadTarget, Errno, FileEntry, FileMeta, FileMetasResponse,
    ListAllResponse, ListResponse, LocateReply, PrecreateReply,
};

const PAN_BASE_URL: &str = "https://pan.baidu.com";
const PCS_BASE_URL: &str = "https://d.pcs.baidu.com";
const OAUTH_BASE_URL: &str = "https://openapi.baidu.com";

/// The download hosts reject requests without this user agent.
pub const USER_AGENT: &str = "pan.baidu.com";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const API_TIMEOUT: Duration = Duration::from_secs(60);
/// Longest silence tolerated between reads on any connection, including
/// range bodies and block uploads that have no overall deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
const LIST_PAGE_SIZE: usize = 1000;
/// Application id the `pcs` hosts expect for upload calls.
const PCS_APP_ID: &str = "250528";

/// Base URLs of the three API hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// File management (`xpan`) API.
    pub pan: String,
    /// Upload server locator.
    pub pcs: String,
    /// OAuth token endpoint.
    pub oauth: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            pan: PAN_BASE_URL.to_string(),
            pcs: PCS_BASE_URL.to_string(),
            oauth: OAUTH_BASE_URL.to_string(),
        }
    }
}

impl Endpoints {
    /// Points every host at `base` (for testing against one mock server).
    pub fn single(base: &str) -> Self {
        Self {
            pan: base.to_string(),
            pcs: base.to_string(),
            oauth: base.to_string(),
        }
    }
}

/// Netdisk API client.
#[derive(Clone)]
pub struct PanClient {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl PanClient {
    /// Creates a client against the production hosts.
    pub fn new() -> Result<Self, ClientError> {
        Self::with_endpoints(Endpoints::default())
    }

    pub fn with_endpoints(endpoints: Endpoints) -> Result<Self, ClientError> {
        Self::with_read_timeout(endpoints, READ_TIMEOUT)
    }

    /// Creates a client whose connections fail after `read_timeout` without
    /// receiving data.
    pub fn with_read_timeout(
        endpoints: Endpoints,
        read_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self { http, endpoints })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Lists a directory, following pagination.
    pub async fn list_dir(&self, token: &str, dir: &str) -> Result<Vec<FileEntry>, ClientError> {
        let url = format!("{}/rest/2.0/xpan/file", self.endpoints.pan);
        let mut entries = Vec::new();
        loop {
            let start = entries.len().to_string();
            let limit = LIST_PAGE_SIZE.to_string();
            let resp = self
                .http
                .get(&url)
                .query(&[
                    ("method", "list"),
                    ("access_token", token),
                    ("dir", dir),
                    ("web", "0"),
                    ("start", start.as_str()),
                    ("limit", limit.as_str()),
                ])
                .timeout(API_TIMEOUT)
                .send()
                .await?;
            let page: ListResponse = read_json(resp).await?;
            let page = page.check()?;
            let count = page.list.len();
            entries.extend(page.list);
            if count < LIST_PAGE_SIZE {
                return Ok(entries);
            }
        }
    }

    /// Lists every entry below `dir`, subdirectories included, following
    /// the `has_more`/`cursor` pages.
    pub async fn list_all(&self, token: &str, dir: &str) -> Result<Vec<FileEntry>, ClientError> {
        validate_remote_path(dir).map_err(|e| ClientError::Config(e.to_string()))?;
        let url = format!("{}/rest/2.0/xpan/multimedia", self.endpoints.pan);
        let limit = LIST_PAGE_SIZE.to_string();
        let mut entries = Vec::new();
        let mut cursor = 0u64;
        loop {
            let start = cursor.to_string();
            let resp = self
                .http
                .get(&url)
                .query(&[
                    ("method", "listall"),
                    ("access_token", token),
                    ("path", dir),
                    ("recursion", "1"),
                    ("web", "0"),
                    ("start", start.as_str()),
                    ("limit", limit.as_str()),
                ])
                .timeout(API_TIMEOUT)
                .send()
                .await?;
            let page: ListAllResponse = read_json(resp).await?;
            let page = page.check()?;
            entries.extend(page.list);
            if page.has_more == 0 {
                debug!(dir, entries = entries.len(), "recursive listing complete");
                return Ok(entries);
            }
            if page.cursor <= cursor {
                return Err(ClientError::InvalidResponse(format!(
                    "listall cursor did not advance past {cursor}"
                )));
            }
            cursor = page.cursor;
        }
    }

    /// Fetches metadata, including download links, for `fs_ids`.
    pub async fn file_metas(&self, token: &str, fs_ids: &[u64]) -> Result<Vec<FileMeta>, ClientError> {
        let url = format!("{}/rest/2.0/xpan/multimedia", self.endpoints.pan);
        let fsids = serde_json::to_string(fs_ids)?;
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("method", "filemetas"),
                ("access_token", token),
                ("fsids", fsids.as_str()),
                ("dlink", "1"),
            ])
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        let metas: FileMetasResponse = read_json(resp).await?;
        Ok(metas.check()?.list)
    }

    /// Resolves an absolute remote file path to its download link, size and
    /// raw content digest.
    pub async fn resolve_download(
        &self,
        token: &str,
        remote_path: &str,
    ) -> Result<DownloadTarget, ClientError> {
        validate_remote_path(remote_path).map_err(|e| ClientError::Config(e.to_string()))?;
        let parent = match remote_path.rsplit_once('/') {
            Some(("", _)) | None => "/",
            Some((parent, _)) => parent,
        };

        let entry = self
            .list_dir(token, parent)
            .await?
            .into_iter()
            .find(|e| e.path == remote_path && !e.is_dir())
            .ok_or_else(|| ClientError::NotFound(remote_path.to_string()))?;
        self.download_target(token, &entry).await
    }

    /// Fetches a fresh download link for a listed file.
    pub async fn download_target(
        &self,
        token: &str,
        entry: &FileEntry,
    ) -> Result<DownloadTarget, ClientError> {
        let meta = self
            .file_metas(token, &[entry.fs_id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::InvalidResponse(format!("no metadata for fs_id {}", entry.fs_id)))?;
        let dlink = meta
            .dlink
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ClientError::InvalidResponse(format!("no download link for {}", entry.path)))?;

        debug!(path = %entry.path, fs_id = entry.fs_id, size = meta.size, "resolved download target");
        Ok(DownloadTarget {
            remote_path: entry.path.clone(),
            dlink,
            size: meta.size,
            md5: deobfuscate(&meta.md5),
        })
    }

    async fn head_length(&self, url: &str, token: &str) -> Result<u64, ClientError> {
        let resp = self
            .http
            .head(url)
            .query(&[("access_token", token)])
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ClientError::InvalidResponse("missing Content-Length".into()))
    }

    async fn get_range(
        &self,
        url: &str,
        token: &str,
        range: ByteRange,
    ) -> Result<RangeResponse, ClientError> {
        let resp = self
            .http
            .get(url)
            .query(&[("access_token", token)])
            .header(RANGE, format!("bytes={}-{}", range.start, range.end))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &body));
        }
        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes_stream()
            .map(|piece| piece.map_err(|e| TransferError::Transport(e.to_string())));
        Ok(RangeResponse {
            status: status.as_u16(),
            content_range,
            body: Box::pin(body),
        })
    }

    async fn precreate_file(
        &self,
        token: &str,
        request: &PrecreateRequest,
    ) -> Result<PrecreateResponse, ClientError> {
        let url = format!("{}/rest/2.0/xpan/file", self.endpoints.pan);
        let block_list = serde_json::to_string(&request.block_digests)?;
        let mut form = vec![
            ("path", request.remote_path.clone()),
            ("size", request.size.to_string()),
            ("isdir", "0".to_string()),
            ("autoinit", "1".to_string()),
            ("rtype", request.rename_policy.to_string()),
            ("block_list", block_list),
            ("content-md5", request.content_md5.clone()),
            ("slice-md5", request.slice_md5.clone()),
        ];
        if let Some(upload_id) = &request.upload_id {
            form.push(("uploadid", upload_id.clone()));
        }
        let resp = self
            .http
            .post(&url)
            .query(&[("method", "precreate"), ("access_token", token)])
            .form(&form)
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        let reply: PrecreateReply = read_json(resp).await?;
        let reply = reply.check()?;
        if reply.uploadid.is_empty() {
            return Err(ClientError::InvalidResponse("precreate returned no uploadid".into()));
        }
        Ok(PrecreateResponse {
            upload_id: reply.uploadid,
            pending_blocks: reply.block_list,
        })
    }

    async fn locate_server(
        &self,
        token: &str,
        remote_path: &str,
        upload_id: &str,
    ) -> Result<String, ClientError> {
        let url = format!("{}/rest/2.0/pcs/file", self.endpoints.pcs);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("method", "locateupload"),
                ("appid", PCS_APP_ID),
                ("access_token", token),
                ("path", remote_path),
                ("uploadid", upload_id),
                ("upload_version", "2.0"),
            ])
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        let reply: LocateReply = read_json(resp).await?;
        if reply.error_code != 0 {
            return Err(ClientError::api(reply.error_code, reply.error_msg));
        }
        reply
            .servers
            .iter()
            .find(|s| s.server.starts_with("https://"))
            .or_else(|| reply.servers.first())
            .map(|s| s.server.trim_end_matches('/').to_string())
            .ok_or_else(|| ClientError::InvalidResponse("no upload servers returned".into()))
    }

    async fn upload_block(
        &self,
        token: &str,
        target: &BlockTarget,
        index: usize,
        data: Bytes,
    ) -> Result<String, ClientError> {
        let url = format!("{}/rest/2.0/pcs/superfile2", target.server);
        let partseq = index.to_string();
        let length = data.len() as u64;
        let part = reqwest::multipart::Part::stream_with_length(data, length).file_name("part");
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(&url)
            .query(&[
                ("method", "upload"),
                ("access_token", token),
                ("type", "tmpfile"),
                ("path", target.remote_path.as_str()),
                ("uploadid", target.upload_id.as_str()),
                ("partseq", partseq.as_str()),
            ])
            .multipart(form)
            .send()
            .await?;
        let reply: BlockReply = read_json(resp).await?;
        if reply.error_code != 0 {
            return Err(ClientError::api(reply.error_code, reply.error_msg));
        }
        reply
            .md5
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ClientError::InvalidResponse(format!("no md5 returned for block {index}")))
    }

    async fn create_file(
        &self,
        token: &str,
        request: &CommitRequest,
    ) -> Result<RemoteFile, ClientError> {
        let url = format!("{}/rest/2.0/xpan/file", self.endpoints.pan);
        let block_list = serde_json::to_string(&request.block_digests)?;
        let mut form = vec![
            ("path", request.remote_path.clone()),
            ("size", request.size.to_string()),
            ("isdir", "0".to_string()),
            ("block_list", block_list),
            ("uploadid", request.upload_id.clone()),
            ("rtype", request.rename_policy.to_string()),
        ];
        let resp = self
            .http
            .post(&url)
            .query(&[("method", "create"), ("access_token", token)])
            .form(&form)
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        let reply: CreateReply = read_json(resp).await?;
        let reply = reply.check()?;
        Ok(RemoteFile {
            fs_id: reply.fs_id,
            path: reply.path,
            size: reply.size,
            md5: reply.md5,
        })
    }
}

/// Reads a JSON body, turning HTTP failures into errors.
pub(crate) async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(error_from_body(status.as_u16(), &body));
    }
    let body = resp.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Error for a non-success response. Vendor error codes in the body take
/// precedence over the HTTP status.
fn error_from_body(status: u16, body: &str) -> ClientError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|v| {
        v.get("errno")
            .or_else(|| v.get("error_code"))
            .and_then(serde_json::Value::as_i64)
    });
    match code {
        Some(errno) if errno != 0 => {
            let message = parsed.as_ref().and_then(|v| {
                v.get("errmsg")
                    .or_else(|| v.get("error_msg"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            });
            ClientError::api(errno, message)
        }
        _ => ClientError::Status {
            status,
            body: body.to_string(),
        },
    }
}

impl RangeSource for PanClient {
    fn content_length<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<u64, TransferError>> {
        Box::pin(async move { Ok(self.head_length(url, token).await?) })
    }

    fn fetch_range<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
        range: ByteRange,
    ) -> BoxFuture<'a, Result<RangeResponse, TransferError>> {
        Box::pin(async move { Ok(self.get_range(url, token, range).await?) })
    }
}

impl UploadRemote for PanClient {
    fn precreate<'a>(
        &'a self,
        token: &'a str,
        request: &'a PrecreateRequest,
    ) -> BoxFuture<'a, Result<PrecreateResponse, TransferError>> {
        Box::pin(async move { Ok(self.precreate_file(token, request).await?) })
    }

    fn locate<'a>(
        &'a self,
        token: &'a str,
        remote_path: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async move { Ok(self.locate_server(token, remote_path, upload_id).await?) })
    }

    fn put_block<'a>(
        &'a self,
        token: &'a str,
        target: &'a BlockTarget,
        index: usize,
        data: Bytes,
    ) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async move { Ok(self.upload_block(token, target, index, data).await?) })
    }

    fn commit<'a>(
        &'a self,
        token: &'a str,
        request: &'a CommitRequest,
    ) -> BoxFuture<'a, Result<RemoteFile, TransferError>> {
        Box::pin(async move { Ok(self.create_file(token, request).await?) })
    }
}
