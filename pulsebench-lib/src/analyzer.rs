//! Sliding-window latency and error analysis.

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use tokio::time::Instant;

/// Collects timed latency samples and answers percentile/error-rate queries
/// over a trailing window.
///
/// Percentiles and averages consider only samples inside the window; the
/// request/error totals are cumulative and survive window resets. When the
/// sample cap is exceeded the oldest 10% are discarded.
#[derive(Debug)]
pub struct Analyzer {
    window: Duration,
    max_samples: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    samples: VecDeque<Sample>,
    total_requests: u64,
    total_errors: u64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency_ms: f64,
}

/// Point-in-time capture of the analyzer.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSnapshot {
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub sample_count: usize,
    pub taken_at: std::time::SystemTime,
}

const DEFAULT_MAX_SAMPLES: usize = 100_000;

impl Analyzer {
    pub fn new(window: Duration) -> Self {
        Self::with_capacity(window, DEFAULT_MAX_SAMPLES)
    }

    pub fn with_capacity(window: Duration, max_samples: usize) -> Self {
        Self {
            window,
            max_samples: max_samples.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record(&self, latency_ms: f64, is_error: bool) {
        let mut inner = self.lock();
        inner.samples.push_back(Sample {
            at: Instant::now(),
            latency_ms,
        });
        inner.total_requests += 1;
        if is_error {
            inner.total_errors += 1;
        }

        if inner.samples.len() > self.max_samples {
            let trim = self.max_samples / 10;
            inner.samples.drain(..trim.max(1));
        }
    }

    pub fn p95(&self) -> f64 {
        self.percentile(95.0)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(99.0)
    }

    pub fn percentile(&self, p: f64) -> f64 {
        let mut window = self.window_latencies();
        if window.is_empty() {
            return 0.0;
        }
        window.sort_by(|a, b| a.total_cmp(b));
        let index = ((window.len() - 1) as f64 * p / 100.0) as usize;
        window[index.min(window.len() - 1)]
    }

    pub fn avg(&self) -> f64 {
        let window = self.window_latencies();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }

    /// Cumulative error percentage over everything ever recorded.
    pub fn error_rate(&self) -> f64 {
        let inner = self.lock();
        if inner.total_requests == 0 {
            return 0.0;
        }
        inner.total_errors as f64 / inner.total_requests as f64 * 100.0
    }

    pub fn total_requests(&self) -> u64 {
        self.lock().total_requests
    }

    pub fn total_errors(&self) -> u64 {
        self.lock().total_errors
    }

    pub fn sample_count(&self) -> usize {
        self.window_latencies().len()
    }

    /// Clears samples and totals.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.total_requests = 0;
        inner.total_errors = 0;
    }

    /// Clears samples but keeps the cumulative totals.
    pub fn reset_window(&self) {
        self.lock().samples.clear();
    }

    pub fn snapshot(&self) -> AnalyzerSnapshot {
        AnalyzerSnapshot {
            p95_latency_ms: self.p95(),
            p99_latency_ms: self.p99(),
            avg_latency_ms: self.avg(),
            error_rate: self.error_rate(),
            total_requests: self.total_requests(),
            total_errors: self.total_errors(),
            sample_count: self.sample_count(),
            taken_at: std::time::SystemTime::now(),
        }
    }

    fn window_latencies(&self) -> Vec<f64> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .samples
            .iter()
            .filter(|s| now.duration_since(s.at) <= self.window)
            .map(|s| s.latency_ms)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
