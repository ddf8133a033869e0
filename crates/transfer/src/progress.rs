use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Aggregate progress of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    /// 0.0 to 100.0; never decreases within one transfer.
    pub percent: f64,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

/// Callback invoked with each progress update.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Observes completed bytes and chunks and notifies callbacks.
///
/// Purely observational: the engine ignores anything that happens here.
pub struct ProgressReporter {
    callbacks: RwLock<Vec<ProgressCallback>>,
    totals: Mutex<Totals>,
    speed: SpeedCalculator,
    /// Serializes notifications so callbacks see percentages in order.
    emit: Mutex<()>,
}

#[derive(Default)]
struct Totals {
    completed_bytes: u64,
    total_bytes: u64,
    completed_chunks: usize,
    total_chunks: usize,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            totals: Mutex::new(Totals::default()),
            speed: SpeedCalculator::new(None, None),
            emit: Mutex::new(()),
        }
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Resets the counters for a new transfer.
    pub fn begin(&self, total_bytes: u64, total_chunks: usize) {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner) = Totals {
            total_bytes,
            total_chunks,
            ..Totals::default()
        };
        self.speed.reset();
    }

    /// Accounts for chunks finished by an earlier session. They count
    /// towards completion but not towards the measured speed.
    pub fn record_resumed(&self, bytes: u64, chunks: usize) {
        self.add(bytes, chunks);
        self.notify();
    }

    /// Records newly completed work.
    pub fn record(&self, bytes: u64, chunks: usize) {
        self.add(bytes, chunks);
        self.speed.add_sample(bytes);
        self.notify();
    }

    fn add(&self, bytes: u64, chunks: usize) {
        let mut t = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        t.completed_bytes = t.completed_bytes.saturating_add(bytes);
        t.completed_chunks = t.completed_chunks.saturating_add(chunks);
    }

    /// Returns the current progress.
    pub fn snapshot(&self) -> TransferProgress {
        let (completed_bytes, total_bytes, completed_chunks, total_chunks) = {
            let t = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
            (t.completed_bytes, t.total_bytes, t.completed_chunks, t.total_chunks)
        };
        let percent = if total_bytes == 0 {
            0.0
        } else {
            (completed_bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        TransferProgress {
            completed_bytes,
            total_bytes,
            completed_chunks,
            total_chunks,
            percent,
            bytes_per_second: self.speed.bytes_per_second(),
            eta: self.speed.eta(total_bytes.saturating_sub(completed_bytes)),
        }
    }

    fn notify(&self) {
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        if callbacks.is_empty() {
            return;
        }
        let _emit = self.emit.lock().unwrap_or_else(PoisonError::into_inner);
        let progress = self.snapshot();
        for cb in callbacks.iter() {
            cb(progress.clone());
        }
    }
}

/// Transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedWindow>,
}

struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
    window: Duration,
}

impl SpeedCalculator {
    /// `window` defaults to 5 s and `max_samples` to 100.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedWindow {
                samples: VecDeque::new(),
                max_samples: max_samples.unwrap_or(100).max(2),
                window: window.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    pub fn add_sample(&self, bytes: u64) {
        let mut w = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        w.samples.push_back((now, bytes));
        while let Some(&(at, _)) = w.samples.front() {
            if now.duration_since(at) <= w.window {
                break;
            }
            w.samples.pop_front();
        }
        while w.samples.len() > w.max_samples {
            w.samples.pop_front();
        }
    }

    /// Bytes per second across the window; 0.0 with fewer than 2 samples.
    ///
    /// The first sample only marks the start of the window, so its bytes
    /// are not counted.
    pub fn bytes_per_second(&self) -> f64 {
        let w = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(&(first, _)), Some(&(last, _))) = (w.samples.front(), w.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.duration_since(first);
        if w.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = w.samples.iter().skip(1).map(|&(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Time left for `remaining_bytes` at the current speed.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reporter_accumulates_and_notifies() {
        let reporter = ProgressReporter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        reporter.on_progress(Box::new(move |p| s.lock().unwrap().push(p)));

        reporter.begin(400, 4);
        reporter.record_resumed(100, 1);
        reporter.record(100, 1);
        reporter.record(200, 2);

        let seen = seen.lock().unwrap();
        let percents: Vec<f64> = seen.iter().map(|p| p.percent).collect();
        assert_eq!(percents, vec![25.0, 50.0, 100.0]);
        let last = seen.last().unwrap();
        assert_eq!(last.completed_chunks, 4);
        assert_eq!(last.total_chunks, 4);
        assert_eq!(last.completed_bytes, 400);
    }

    #[test]
    fn reporter_without_callbacks_is_noop() {
        let reporter = ProgressReporter::default();
        reporter.record(10, 1);
        // No total set yet; percent stays at zero rather than dividing by it.
        assert_eq!(reporter.snapshot().percent, 0.0);
    }

    #[test]
    fn percent_is_clamped() {
        let reporter = ProgressReporter::new();
        reporter.begin(10, 1);
        reporter.record(25, 1);
        assert_eq!(reporter.snapshot().percent, 100.0);
    }

    #[test]
    fn percent_is_monotonic_under_concurrency() {
        let reporter = Arc::new(ProgressReporter::new());
        reporter.begin(8000, 800);
        let last = Arc::new(Mutex::new(0.0f64));
        let l = Arc::clone(&last);
        reporter.on_progress(Box::new(move |p| {
            let mut last = l.lock().unwrap();
            assert!(p.percent >= *last);
            *last = p.percent;
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&reporter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        r.record(10, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*last.lock().unwrap(), 100.0);
        assert_eq!(reporter.snapshot().completed_chunks, 800);
    }

    #[test]
    fn begin_resets_counters() {
        let reporter = ProgressReporter::new();
        reporter.begin(100, 2);
        reporter.record(50, 1);
        reporter.begin(300, 3);
        let p = reporter.snapshot();
        assert_eq!(p.completed_bytes, 0);
        assert_eq!(p.total_bytes, 300);
    }

    #[test]
    fn speed_needs_two_samples() {
        let calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn speed_and_eta_from_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(500);
        std::thread::sleep(Duration::from_millis(50));
        calc.add_sample(500);

        assert!(calc.bytes_per_second() > 0.0);
        let eta = calc.eta(10_000).unwrap();
        assert!(eta.as_secs_f64() > 0.0);
    }

    #[test]
    fn speed_reset_clears_samples() {
        let calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        calc.add_sample(200);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_window_is_bounded() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.inner.lock().unwrap().samples.len() <= 5);
    }
}
