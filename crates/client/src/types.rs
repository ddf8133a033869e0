//! Response types of the Netdisk file API.

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Fields every `xpan` response carries.
pub(crate) trait Errno {
    fn errno(&self) -> i64;
    fn errmsg(&self) -> Option<String>;

    /// Turns a non-zero `errno` into an error.
    fn check(self) -> Result<Self, ClientError>
    where
        Self: Sized,
    {
        match self.errno() {
            0 => Ok(self),
            errno => Err(ClientError::api(errno, self.errmsg())),
        }
    }
}

macro_rules! impl_errno {
    ($($ty:ty),* $(,)?) => {
        $(impl Errno for $ty {
            fn errno(&self) -> i64 {
                self.errno
            }

            fn errmsg(&self) -> Option<String> {
                self.errmsg.clone()
            }
        })*
    };
}

/// An entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub fs_id: u64,
    pub path: String,
    #[serde(default)]
    pub server_filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub isdir: u8,
    /// Obfuscated content digest; only present for files.
    #[serde(default)]
    pub md5: Option<String>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.isdir != 0
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub list: Vec<FileEntry>,
}

/// One page of a recursive listing.
#[derive(Debug, Deserialize)]
pub(crate) struct ListAllResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    /// `1` when another page follows at `cursor`.
    #[serde(default)]
    pub has_more: u8,
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub list: Vec<FileEntry>,
}

/// File metadata including the short-lived download link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub fs_id: u64,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub md5: String,
    #[serde(default)]
    pub dlink: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileMetasResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub list: Vec<FileMeta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PrecreateReply {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub uploadid: String,
    #[serde(default)]
    pub block_list: Vec<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadServer {
    pub server: String,
}

/// Replies from the `pcs` hosts use `error_code`/`error_msg`.
#[derive(Debug, Deserialize)]
pub(crate) struct LocateReply {
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub servers: Vec<UploadServer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlockReply {
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateReply {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub fs_id: u64,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub md5: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenReply {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl_errno!(
    ListResponse,
    ListAllResponse,
    FileMetasResponse,
    PrecreateReply,
    CreateReply,
);

/// Where and what to download for a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub remote_path: String,
    pub dlink: String,
    pub size: u64,
    /// Raw (de-obfuscated) content digest.
    pub md5: String,
}
