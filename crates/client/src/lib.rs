//! Baidu Netdisk HTTP client.
//!
//! Implements the transfer engine's `RangeSource` and `UploadRemote` seams
//! and the OAuth refresh grant.

mod auth;
mod client;
mod error;
mod types;

pub use auth::RefreshTokenGrant;
pub use client::{Endpoints, PanClient, USER_AGENT};
pub use error::{ClientError, EXPIRED_ERRNOS, RATE_LIMITED_ERRNO};
pub use types::{DownloadTarget, FileEntry, FileMeta};
