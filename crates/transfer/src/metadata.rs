//! Per-chunk transfer state and its side-car persistence.
//!
//! The side-car lives next to the local file as `<local>.meta` and holds a
//! JSON object keyed by `"{start}-{end}"`. Every status transition rewrites
//! it through a temp file and a rename, so a reader sees either the previous
//! or the next complete state.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::TransferError;
use crate::plan::ByteRange;

/// State of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

/// Persisted state of one byte range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub status: ChunkStatus,
    pub size: u64,
    pub start: u64,
    pub end: u64,
    /// Last worker that attempted the chunk.
    #[serde(default)]
    pub thread_id: Option<usize>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_status_code: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ChunkRecord {
    /// A fresh, never attempted record for `range`.
    pub fn pending(range: ByteRange) -> Self {
        Self {
            status: ChunkStatus::Pending,
            size: range.len(),
            start: range.start,
            end: range.end,
            thread_id: None,
            retry_count: 0,
            last_status_code: None,
            error: None,
        }
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }

    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Done
    }
}

/// Chunk records keyed by `"{start}-{end}"`.
pub type ChunkMap = BTreeMap<String, ChunkRecord>;

/// Returns the side-car path for a local file: `<local>.meta`.
pub fn metadata_path(local: &Path) -> PathBuf {
    let mut name = OsString::from(local.as_os_str());
    name.push(".meta");
    PathBuf::from(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Reads a side-car file.
///
/// Returns `Ok(None)` when the file does not exist. A file that cannot be
/// parsed is logged and treated as absent.
pub async fn load(path: &Path) -> Result<Option<ChunkMap>, TransferError> {
    load_json(path).await
}

/// Writes a side-car file atomically (temp file, then rename).
pub async fn save(path: &Path, records: &ChunkMap) -> Result<(), TransferError> {
    save_json(path, records).await
}

/// Reads any JSON side-car with the same rules as [`load`].
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, TransferError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable transfer metadata");
            Ok(None)
        }
    }
}

/// Writes any JSON side-car atomically.
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TransferError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Deletes `path`; a missing file is not an error.
pub async fn remove_if_exists(path: &Path) -> Result<(), TransferError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Keeps persisted records only while the local file still holds every
/// `Done` range. `local_len` is `None` when the local file is missing.
pub fn backed_by_local_file(records: ChunkMap, local_len: Option<u64>) -> Option<ChunkMap> {
    let needed = records
        .values()
        .filter(|r| r.is_done())
        .map(|r| r.end + 1)
        .max()
        .unwrap_or(0);
    if needed == 0 || local_len.is_some_and(|len| len >= needed) {
        return Some(records);
    }
    warn!(
        needed,
        local_len = ?local_len,
        "local file no longer holds completed chunks, discarding transfer metadata"
    );
    None
}

/// Combines a fresh plan with previously persisted records.
///
/// Planned ranges whose existing record is `Done` keep that record; every
/// other range starts over as `Pending`. Existing records for ranges that
/// are no longer planned are dropped.
pub fn merge(planned: &[ByteRange], existing: Option<&ChunkMap>) -> ChunkMap {
    planned
        .iter()
        .map(|range| {
            let key = range.key();
            let record = existing
                .and_then(|map| map.get(&key))
                .filter(|r| r.is_done() && r.range() == *range)
                .cloned()
                .unwrap_or_else(|| ChunkRecord::pending(*range));
            (key, record)
        })
        .collect()
}

/// Applies `f` to the record for `range`, creating it if needed, and
/// returns the record's attempt count.
fn apply<F>(records: &mut ChunkMap, range: ByteRange, f: F) -> u32
where
    F: FnOnce(&mut ChunkRecord),
{
    let record = records
        .entry(range.key())
        .or_insert_with(|| ChunkRecord::pending(range));
    f(record);
    record.retry_count
}

/// Synchronized owner of a session's chunk records.
///
/// Workers never touch the map directly: each update is a read-modify-write
/// under one lock, followed by a persist while the lock is still held.
pub struct MetadataStore {
    path: Option<PathBuf>,
    records: Mutex<ChunkMap>,
}

impl MetadataStore {
    /// A store persisted to `path` on every status transition.
    pub fn new(path: PathBuf, records: ChunkMap) -> Self {
        Self {
            path: Some(path),
            records: Mutex::new(records),
        }
    }

    /// A store that only keeps records in memory.
    pub fn in_memory(records: ChunkMap) -> Self {
        Self {
            path: None,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the current records to the side-car.
    pub async fn persist(&self) -> Result<(), TransferError> {
        let records = self.records.lock().await;
        self.write(&records).await
    }

    async fn write(&self, records: &ChunkMap) -> Result<(), TransferError> {
        match &self.path {
            Some(path) => save(path, records).await,
            None => Ok(()),
        }
    }

    async fn update<F>(&self, range: ByteRange, f: F) -> Result<u32, TransferError>
    where
        F: FnOnce(&mut ChunkRecord),
    {
        let mut records = self.records.lock().await;
        let attempts = apply(&mut records, range, f);
        self.write(&records).await?;
        Ok(attempts)
    }

    /// Starts a new attempt on `range` by `worker` and returns the attempt
    /// number (1-based).
    pub async fn begin_attempt(&self, range: ByteRange, worker: usize) -> Result<u32, TransferError> {
        let attempt = self
            .update(range, |r| {
                r.status = ChunkStatus::InProgress;
                r.retry_count += 1;
                r.thread_id = Some(worker);
                r.last_status_code = None;
            })
            .await?;
        debug!(start = range.start, end = range.end, worker, attempt, "chunk attempt started");
        Ok(attempt)
    }

    /// Records the transport status observed by the current attempt. The
    /// status reaches the side-car with the attempt's outcome.
    pub async fn record_status(&self, range: ByteRange, status: u16) {
        let mut records = self.records.lock().await;
        apply(&mut records, range, |r| r.last_status_code = Some(status));
    }

    /// Marks `range` as transferred with `bytes` observed.
    pub async fn mark_done(&self, range: ByteRange, bytes: u64) -> Result<(), TransferError> {
        self.update(range, |r| {
            r.status = ChunkStatus::Done;
            r.size = bytes;
            r.error = None;
        })
        .await?;
        Ok(())
    }

    /// Marks `range` as failed with a description of the last error.
    pub async fn mark_error(&self, range: ByteRange, error: &str) -> Result<(), TransferError> {
        self.update(range, |r| {
            r.status = ChunkStatus::Error;
            r.error = Some(error.to_string());
        })
        .await?;
        Ok(())
    }

    /// Ranges that are not `Done`, ordered by start offset.
    pub async fn pending(&self) -> Vec<ByteRange> {
        let records = self.records.lock().await;
        let mut ranges: Vec<ByteRange> = records
            .values()
            .filter(|r| !r.is_done())
            .map(ChunkRecord::range)
            .collect();
        ranges.sort();
        ranges
    }

    /// Total bytes and number of chunks already `Done`.
    pub async fn completed(&self) -> (u64, usize) {
        let records = self.records.lock().await;
        records
            .values()
            .filter(|r| r.is_done())
            .fold((0, 0), |(bytes, chunks), r| (bytes + r.size, chunks + 1))
    }

    pub async fn all_done(&self) -> bool {
        self.records.lock().await.values().all(ChunkRecord::is_done)
    }

    pub async fn get(&self, range: ByteRange) -> Option<ChunkRecord> {
        self.records.lock().await.get(&range.key()).cloned()
    }

    /// A copy of every record.
    pub async fn snapshot(&self) -> ChunkMap {
        self.records.lock().await.clone()
    }

    /// Deletes the side-car file, if any.
    pub async fn remove(&self) -> Result<(), TransferError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.records.lock().await;
        remove_if_exists(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan_download;

    #[test]
    fn metadata_path_appends_suffix() {
        assert_eq!(
            metadata_path(Path::new("/tmp/movie.mkv")),
            PathBuf::from("/tmp/movie.mkv.meta")
        );
    }

    #[test]
    fn record_serializes_with_side_car_field_names() {
        let record = ChunkRecord::pending(ByteRange::new(0, 99));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["size"], 100);
        assert_eq!(json["start"], 0);
        assert_eq!(json["end"], 99);
        assert!(json["thread_id"].is_null());
        assert_eq!(json["retry_count"], 0);
        assert!(json["last_status_code"].is_null());
        assert!(json["error"].is_null());
    }

    #[test]
    fn merge_keeps_only_done_records() {
        let planned = plan_download(300, 100);
        let mut existing = merge(&planned, None);
        existing.get_mut("0-99").unwrap().status = ChunkStatus::Done;
        existing.get_mut("0-99").unwrap().retry_count = 2;
        let errored = existing.get_mut("100-199").unwrap();
        errored.status = ChunkStatus::Error;
        errored.retry_count = 10;
        errored.error = Some("reset".into());
        existing.get_mut("200-299").unwrap().status = ChunkStatus::InProgress;

        let merged = merge(&planned, Some(&existing));
        assert_eq!(merged["0-99"].status, ChunkStatus::Done);
        assert_eq!(merged["0-99"].retry_count, 2);
        assert_eq!(merged["100-199"], ChunkRecord::pending(planned[1]));
        assert_eq!(merged["200-299"], ChunkRecord::pending(planned[2]));
    }

    #[test]
    fn merge_drops_ranges_from_a_different_plan() {
        let old = merge(&plan_download(300, 100), None);
        let mut done = old.clone();
        for r in done.values_mut() {
            r.status = ChunkStatus::Done;
        }
        let planned = plan_download(300, 150);
        let merged = merge(&planned, Some(&done));
        assert_eq!(merged.len(), 2);
        assert!(merged.values().all(|r| r.status == ChunkStatus::Pending));
    }

    #[tokio::test]
    async fn save_then_load_restores_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("file.bin.meta");
        let records = merge(&plan_download(1000, 400), None);

        save(&path, &records).await.unwrap();
        assert!(!temp_path(&path).exists());
        assert_eq!(load(&path).await.unwrap(), Some(records));
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(load(&dir.path().join("nope.meta")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_corrupt_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.meta");
        std::fs::write(&path, b"{\"0-9\": {\"status\": ").unwrap();
        assert!(load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attempts_are_counted_and_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.meta");
        let planned = plan_download(200, 100);
        let store = MetadataStore::new(path.clone(), merge(&planned, None));

        assert_eq!(store.begin_attempt(planned[0], 3).await.unwrap(), 1);
        store.record_status(planned[0], 503).await;
        store.mark_error(planned[0], "HTTP status 503").await.unwrap();
        assert_eq!(store.begin_attempt(planned[0], 1).await.unwrap(), 2);
        store.record_status(planned[0], 206).await;
        store.mark_done(planned[0], 100).await.unwrap();

        let on_disk = load(&path).await.unwrap().unwrap();
        let record = &on_disk["0-99"];
        assert_eq!(record.status, ChunkStatus::Done);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.thread_id, Some(1));
        assert_eq!(record.last_status_code, Some(206));
        assert_eq!(record.error, None);
        assert_eq!(on_disk["100-199"].status, ChunkStatus::Pending);

        assert_eq!(store.pending().await, vec![planned[1]]);
        assert_eq!(store.completed().await, (100, 1));
        assert!(!store.all_done().await);
    }

    #[tokio::test]
    async fn status_reaches_disk_with_the_outcome() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.meta");
        let planned = plan_download(100, 100);
        let store = MetadataStore::new(path.clone(), merge(&planned, None));
        store.begin_attempt(planned[0], 0).await.unwrap();

        store.record_status(planned[0], 500).await;
        assert_eq!(store.get(planned[0]).await.unwrap().last_status_code, Some(500));
        let on_disk = load(&path).await.unwrap().unwrap();
        assert_eq!(on_disk["0-99"].last_status_code, None);

        store.mark_error(planned[0], "HTTP status 500").await.unwrap();
        let on_disk = load(&path).await.unwrap().unwrap();
        assert_eq!(on_disk["0-99"].last_status_code, Some(500));
    }

    #[test]
    fn done_records_need_local_bytes_behind_them() {
        let planned = plan_download(300, 100);
        let mut records = merge(&planned, None);
        records.get_mut("100-199").unwrap().status = ChunkStatus::Done;

        assert!(backed_by_local_file(records.clone(), None).is_none());
        assert!(backed_by_local_file(records.clone(), Some(150)).is_none());
        assert!(backed_by_local_file(records.clone(), Some(200)).is_some());
        assert!(backed_by_local_file(records.clone(), Some(300)).is_some());

        // Nothing done yet: nothing to lose.
        let fresh = merge(&planned, None);
        assert!(backed_by_local_file(fresh, None).is_some());
    }

    #[tokio::test]
    async fn pending_is_ordered_by_offset() {
        // String keys sort "1000-..." before "200-..."; pending() must not.
        let planned = plan_download(1200, 200);
        let store = MetadataStore::in_memory(merge(&planned, None));
        assert_eq!(store.pending().await, planned);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let planned = plan_download(6400, 100);
        let store = std::sync::Arc::new(MetadataStore::in_memory(merge(&planned, None)));
        let mut handles = Vec::new();
        for (i, range) in planned.iter().copied().enumerate() {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.begin_attempt(range, i % 4).await.unwrap();
                store.mark_done(range, range.len()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(store.all_done().await);
        assert_eq!(store.completed().await, (6400, 64));
    }

    #[tokio::test]
    async fn remove_deletes_side_car() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.meta");
        let store = MetadataStore::new(path.clone(), merge(&plan_download(10, 10), None));
        store.persist().await.unwrap();
        assert!(path.exists());
        store.remove().await.unwrap();
        assert!(!path.exists());
        // Removing twice is fine.
        store.remove().await.unwrap();
    }
}
