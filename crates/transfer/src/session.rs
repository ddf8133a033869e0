use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{error, info};

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Planning,
    Resuming,
    Transferring,
    Verifying,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// State of one file transfer, shared between the coordinator and
/// observers (thread-safe).
pub struct TransferSession {
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    direction: Direction,
    resource_path: String,
    local_path: PathBuf,
    state: SessionState,
    total_size: u64,
    block_size: u64,
    started_at: Instant,
    finished_at: Option<Instant>,
    error: Option<String>,
}

impl TransferSession {
    /// Creates a session in the `Planning` state.
    pub fn new(direction: Direction, resource_path: &str, local_path: PathBuf) -> Self {
        Self {
            inner: RwLock::new(SessionInner {
                direction,
                resource_path: resource_path.to_string(),
                local_path,
                state: SessionState::Planning,
                total_size: 0,
                block_size: 0,
                started_at: Instant::now(),
                finished_at: None,
                error: None,
            }),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the planned size and block size.
    pub fn set_plan(&self, total_size: u64, block_size: u64) {
        let mut s = self.write();
        s.total_size = total_size;
        s.block_size = block_size;
    }

    /// Moves to `next`. Terminal states are final and ignore further moves.
    pub fn advance(&self, next: SessionState) {
        let mut s = self.write();
        if s.state.is_terminal() {
            return;
        }
        info!(
            direction = ?s.direction,
            path = %s.resource_path,
            from = ?s.state,
            to = ?next,
            "transfer state changed"
        );
        s.state = next;
        if next.is_terminal() {
            s.finished_at = Some(Instant::now());
        }
    }

    pub fn complete(&self) {
        self.advance(SessionState::Completed);
    }

    /// Moves to `Failed`, recording the error.
    pub fn fail(&self, err: &str) {
        {
            let mut s = self.write();
            if s.state.is_terminal() {
                return;
            }
            error!(direction = ?s.direction, path = %s.resource_path, error = err, "transfer failed");
            s.error = Some(err.to_string());
        }
        self.advance(SessionState::Failed);
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    /// Summary of the session as it stands.
    pub fn report(&self, transferred_bytes: u64, chunks: usize, resumed_chunks: usize) -> TransferReport {
        let s = self.read();
        TransferReport {
            direction: s.direction,
            resource_path: s.resource_path.clone(),
            local_path: s.local_path.clone(),
            total_size: s.total_size,
            block_size: s.block_size,
            chunks,
            resumed_chunks,
            transferred_bytes,
            elapsed: s.finished_at.unwrap_or_else(Instant::now) - s.started_at,
        }
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub direction: Direction,
    pub resource_path: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub block_size: u64,
    /// Number of chunks in the plan.
    pub chunks: usize,
    /// Chunks already done before this run (resume or remote dedup).
    pub resumed_chunks: usize,
    /// Bytes moved by this run.
    pub transferred_bytes: u64,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session() -> TransferSession {
        TransferSession::new(Direction::Download, "/apps/demo/a.bin", PathBuf::from("/tmp/a.bin"))
    }

    #[test]
    fn new_session_is_planning() {
        let s = session();
        assert_eq!(s.state(), SessionState::Planning);
        assert!(s.error().is_none());
    }

    #[test]
    fn advances_through_states() {
        let s = session();
        for state in [
            SessionState::Resuming,
            SessionState::Transferring,
            SessionState::Verifying,
        ] {
            s.advance(state);
            assert_eq!(s.state(), state);
        }
        s.complete();
        assert_eq!(s.state(), SessionState::Completed);
    }

    #[test]
    fn fail_records_error_and_is_final() {
        let s = session();
        s.advance(SessionState::Transferring);
        s.fail("chunk 0-99 failed");
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.error().as_deref(), Some("chunk 0-99 failed"));

        s.complete();
        s.fail("again");
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.error().as_deref(), Some("chunk 0-99 failed"));
    }

    #[test]
    fn report_carries_plan() {
        let s = session();
        s.set_plan(10, 4);
        s.complete();
        let r = s.report(6, 3, 1);
        assert_eq!(r.total_size, 10);
        assert_eq!(r.block_size, 4);
        assert_eq!(r.chunks, 3);
        assert_eq!(r.resumed_chunks, 1);
        assert_eq!(r.transferred_bytes, 6);
        assert_eq!(r.direction, Direction::Download);
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let s = Arc::new(session());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if i == 0 {
                            s.advance(SessionState::Transferring);
                        }
                        let _ = s.state();
                        let _ = s.report(0, 0, 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.state(), SessionState::Transferring);
    }
}
