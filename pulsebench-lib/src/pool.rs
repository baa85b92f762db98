//! Worker pool: a bounded job queue drained by a fixed set of workers, each
//! gated by the shared rate limiter.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use rama::graceful::{Shutdown, ShutdownGuard};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep},
};

use crate::{
    analyzer::Analyzer,
    client::{ProtocolClient, ProtocolRequest},
    config::{Target, WorkerConfig},
    limiter::RateLimiter,
    metrics::MetricsSink,
};

/// One unit of work: a target and the client that reaches it.
pub struct Job {
    pub target: Target,
    pub client: Arc<dyn ProtocolClient>,
}

/// Fixed-size worker pool over a bounded queue.
///
/// `submit` never blocks: a full queue rejects the job and the caller backs
/// off. Each worker waits for a limiter token before executing, so the
/// long-run execution rate follows the limiter setting regardless of how fast
/// jobs are enqueued.
pub struct WorkerPool {
    cfg: WorkerConfig,
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    observer: Option<Arc<Analyzer>>,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    counters: Arc<Counters>,
    closed: AtomicBool,
    stopped: AtomicBool,
    shutdown: Mutex<Option<Shutdown>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicI64,
    queued: AtomicI64,
    tps_count: AtomicU64,
    current_tps: AtomicU64,
    target_tps: AtomicU64,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    latency_sum_us: AtomicU64,
}

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(1);

impl WorkerPool {
    pub fn new(
        cfg: WorkerConfig,
        limiter: Arc<RateLimiter>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(cfg.queue_size);
        Self {
            cfg,
            limiter,
            metrics,
            observer: None,
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    /// Routes every completed request into the analyzer as well. Used by
    /// discovery, which judges SLOs on real per-request latencies.
    pub fn with_observer(mut self, observer: Arc<Analyzer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Spawns the workers and the once-per-second TPS sampler.
    pub fn start(&self) {
        let mut slot = lock(&self.shutdown);
        if slot.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let shutdown = Shutdown::new(async move {
            let _ = stop_rx.await;
        });

        for _ in 0..self.cfg.pool_size {
            let queue_rx = self.queue_rx.clone();
            let limiter = self.limiter.clone();
            let metrics = self.metrics.clone();
            let observer = self.observer.clone();
            let counters = self.counters.clone();
            shutdown.spawn_task_fn(move |guard| {
                worker_loop(guard, queue_rx, limiter, metrics, observer, counters)
            });
        }

        {
            let metrics = self.metrics.clone();
            let counters = self.counters.clone();
            shutdown.spawn_task_fn(move |guard| measure_loop(guard, metrics, counters));
        }

        tracing::info!(
            workers = self.cfg.pool_size,
            queue = self.cfg.queue_size,
            "worker pool started"
        );

        *slot = Some(shutdown);
        *lock(&self.stop_tx) = Some(stop_tx);
    }

    /// Enqueues a job without blocking. Returns false when the queue is full
    /// or the pool no longer accepts work.
    pub fn submit(&self, job: Job) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.queue_tx.try_send(job) {
            Ok(()) => {
                let queued = self.counters.queued.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.set_queued_requests(queued.max(0) as usize);
                true
            }
            Err(_) => false,
        }
    }

    /// Updates the limiter and the target-TPS gauge.
    pub fn set_rate(&self, tps: f64) {
        self.limiter.set_rate(tps);
        self.counters
            .target_tps
            .store(tps.to_bits(), Ordering::Relaxed);
        self.metrics.set_target_tps(tps);
    }

    pub fn active(&self) -> i64 {
        self.counters.active.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> i64 {
        self.counters.queued.load(Ordering::Relaxed).max(0)
    }

    pub fn current_tps(&self) -> f64 {
        f64::from_bits(self.counters.current_tps.load(Ordering::Relaxed))
    }

    pub fn target_tps(&self) -> f64 {
        f64::from_bits(self.counters.target_tps.load(Ordering::Relaxed))
    }

    pub fn total_requests(&self) -> u64 {
        self.counters.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.counters.total_errors.load(Ordering::Relaxed)
    }

    /// Mean latency over everything this pool executed.
    pub fn avg_latency_ms(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        let sum_us = self.counters.latency_sum_us.load(Ordering::Relaxed);
        sum_us as f64 / 1_000.0 / total as f64
    }

    /// Closes the submit side and waits for in-progress and queued work to
    /// finish, up to the deadline. Returns the number of requests still in
    /// flight when the deadline expired.
    pub async fn drain(&self, timeout: Duration) -> i64 {
        self.closed.store(true, Ordering::Release);
        if self.stopped.load(Ordering::Acquire) {
            return self.counters.active.load(Ordering::Relaxed);
        }
        let deadline = Instant::now() + timeout;

        loop {
            let active = self.counters.active.load(Ordering::Relaxed);
            let queued = self.counters.queued.load(Ordering::Relaxed);
            if active <= 0 && queued <= 0 {
                return 0;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining = active,
                    "drain deadline expired, abandoning in-flight requests"
                );
                return active;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Cancels the workers and waits briefly for them to exit. Safe to call
    /// more than once; later calls return immediately.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
        if let Some(stop_tx) = lock(&self.stop_tx).take() {
            let _ = stop_tx.send(());
        }
        let shutdown = lock(&self.shutdown).take();
        let Some(shutdown) = shutdown else {
            return;
        };

        match shutdown.shutdown_with_limit(STOP_GRACE).await {
            Ok(delay) => tracing::debug!("worker pool stopped after {delay:?}"),
            Err(err) => tracing::debug!("worker pool stop timed out: {err}"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn worker_loop(
    guard: ShutdownGuard,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    observer: Option<Arc<Analyzer>>,
    counters: Arc<Counters>,
) {
    loop {
        let job = tokio::select! {
            _ = guard.cancelled() => return,
            job = recv_job(&queue_rx) => {
                let Some(job) = job else { return };
                job
            }
        };

        let queued = counters.queued.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics.set_queued_requests(queued.max(0) as usize);

        tokio::select! {
            _ = guard.cancelled() => return,
            _ = limiter.wait() => {}
        }

        process_job(&job, &metrics, observer.as_deref(), &counters).await;
    }
}

async fn recv_job(queue_rx: &tokio::sync::Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    queue_rx.lock().await.recv().await
}

async fn process_job(
    job: &Job,
    metrics: &Arc<dyn MetricsSink>,
    observer: Option<&Analyzer>,
    counters: &Counters,
) {
    let active = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.inc_in_flight();
    metrics.set_active_workers(active.max(0) as usize);

    let request = ProtocolRequest::from_target(&job.target);
    let response = job.client.execute(&request).await;

    metrics.record_request(
        &job.target.name,
        job.target.transport,
        response.status,
        response.duration,
    );

    let latency_ms = response.duration.as_secs_f64() * 1_000.0;
    if let Some(observer) = observer {
        observer.record(latency_ms, response.is_error());
    }

    counters.total_requests.fetch_add(1, Ordering::Relaxed);
    if response.is_error() {
        counters.total_errors.fetch_add(1, Ordering::Relaxed);
    }
    counters
        .latency_sum_us
        .fetch_add(response.duration.as_micros() as u64, Ordering::Relaxed);

    counters.active.fetch_sub(1, Ordering::Relaxed);
    metrics.dec_in_flight();
    counters.tps_count.fetch_add(1, Ordering::Relaxed);
}

/// Samples the per-second execution counter and publishes it as current TPS.
async fn measure_loop(guard: ShutdownGuard, metrics: Arc<dyn MetricsSink>, counters: Arc<Counters>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = ticker.tick() => {
                let count = counters.tps_count.swap(0, Ordering::Relaxed);
                counters.current_tps.store((count as f64).to_bits(), Ordering::Relaxed);
                metrics.set_current_tps(count as f64);
            }
        }
    }
}
