//! Pulse controller: turns the pattern engine's time-varying target rate into
//! a stream of submitted jobs.

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use rama::graceful::{Shutdown, ShutdownGuard};
use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};
use tokio::{sync::oneshot, time::Instant};

use crate::{
    client::ClientSet,
    config::{ControllerConfig, Target, Transport},
    health::HealthBoard,
    metrics::MetricsSink,
    pattern::{PatternEngine, PatternStatus, Schedule, ScheduleInfo},
    pool::{Job, WorkerPool},
};

/// How often the control loop recomputes the target rate.
const CONTROL_INTERVAL: Duration = Duration::from_millis(100);
/// Generate loop cadence. Advisory; the limiter enforces the actual rate.
const GENERATE_INTERVAL: Duration = Duration::from_millis(1);
/// Upper bound on submissions attempted per generate tick.
const MAX_SUBMITS_PER_TICK: usize = 10;
/// How long `stop` waits for the tasks to wind down.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Drives three cooperative tasks once started: an optional ramp-up, the
/// 100 ms control loop feeding the limiter, and the ~1 kHz generate loop that
/// submits jobs for weighted, currently-healthy targets.
///
/// The tasks live on their own shutdown tree: they exit when the parent
/// guard cancels or when [`PulseController::stop`] is called, whichever comes
/// first, so the lifecycle can stop the controller before draining the pool.
pub struct PulseController {
    inner: Arc<Inner>,
    shutdown: Mutex<Option<Shutdown>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

struct Inner {
    cfg: ControllerConfig,
    targets: Vec<Target>,
    engine: Arc<PatternEngine>,
    schedule: Schedule,
    pool: Arc<WorkerPool>,
    board: Arc<HealthBoard>,
    clients: Arc<ClientSet>,
    metrics: Arc<dyn MetricsSink>,
    triggered: AtomicBool,
    ramping: AtomicBool,
    started_at: Mutex<Option<(SystemTime, Instant)>>,
    index: RwLock<Arc<WeightedIndex>>,
    /// Health board version the index was last built against.
    index_version: AtomicU64,
}

/// Immutable cumulative-weight snapshot over the healthy targets.
///
/// Published through an atomically swapped `Arc` so the generate loop never
/// holds a lock across target selection.
#[derive(Debug, Default)]
struct WeightedIndex {
    targets: Vec<Target>,
    cumulative: Vec<u64>,
    total: u64,
}

impl WeightedIndex {
    fn build(targets: &[Target], board: &HealthBoard) -> Self {
        let mut kept = Vec::with_capacity(targets.len());
        let mut cumulative = Vec::with_capacity(targets.len());
        let mut total = 0u64;
        for target in targets {
            if board.is_healthy(&target.name) {
                total += u64::from(target.weight);
                kept.push(target.clone());
                cumulative.push(total);
            }
        }
        Self {
            targets: kept,
            cumulative,
            total,
        }
    }

    /// Maps a uniform roll in `[0, total)` onto a target; ties resolve to the
    /// earlier entry.
    fn pick(&self, roll: u64) -> Option<&Target> {
        if self.total == 0 {
            return None;
        }
        let idx = self.cumulative.partition_point(|&c| c <= roll);
        self.targets.get(idx)
    }
}

/// Snapshot answered by `status()`.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub running: bool,
    pub triggered: bool,
    pub start_time: Option<SystemTime>,
    pub uptime: Duration,
    pub current_tps: f64,
    pub target_tps: f64,
    pub requests_sent: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub is_spiking: bool,
    pub active_workers: i64,
    pub queued_requests: i64,
    pub target_url: Option<String>,
    pub transport: Option<Transport>,
    pub pattern: PatternStatus,
    pub schedule: ScheduleInfo,
}

impl PulseController {
    pub fn new(
        cfg: ControllerConfig,
        targets: Vec<Target>,
        engine: Arc<PatternEngine>,
        schedule: Schedule,
        pool: Arc<WorkerPool>,
        board: Arc<HealthBoard>,
        clients: Arc<ClientSet>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let inner = Arc::new(Inner {
            cfg,
            targets,
            engine,
            schedule,
            pool,
            board,
            clients,
            metrics,
            triggered: AtomicBool::new(false),
            ramping: AtomicBool::new(false),
            started_at: Mutex::new(None),
            index: RwLock::new(Arc::new(WeightedIndex::default())),
            index_version: AtomicU64::new(u64::MAX),
        });
        Self {
            inner,
            shutdown: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn start(&self, guard: &ShutdownGuard) {
        {
            let mut started = lock(&self.inner.started_at);
            if started.is_some() {
                return;
            }
            *started = Some((SystemTime::now(), Instant::now()));
        }

        self.inner.refresh_index();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let parent_cancelled = guard.clone_weak().into_cancelled();
        let shutdown = Shutdown::new(async move {
            tokio::select! {
                _ = parent_cancelled => {}
                _ = stop_rx => {}
            }
        });

        if self.inner.cfg.ramp_up > Duration::ZERO {
            self.inner.ramping.store(true, Ordering::Release);
            let inner = self.inner.clone();
            shutdown.spawn_task_fn(move |guard| ramp_task(guard, inner));
        } else {
            self.inner.pool.set_rate(self.inner.cfg.base_tps);
        }

        let inner = self.inner.clone();
        shutdown.spawn_task_fn(move |guard| control_task(guard, inner));

        let inner = self.inner.clone();
        shutdown.spawn_task_fn(move |guard| generate_task(guard, inner));

        *lock(&self.shutdown) = Some(shutdown);
        *lock(&self.stop_tx) = Some(stop_tx);

        tracing::info!(
            base_tps = self.inner.cfg.base_tps,
            max_tps = self.inner.cfg.max_tps,
            "pulse controller started"
        );
    }

    /// Pauses generation, cancels the tasks and waits briefly for them to
    /// exit. Later calls return immediately.
    pub async fn stop(&self) {
        self.pause();
        if let Some(stop_tx) = lock(&self.stop_tx).take() {
            let _ = stop_tx.send(());
        }
        let shutdown = lock(&self.shutdown).take();
        let Some(shutdown) = shutdown else {
            return;
        };

        match shutdown.shutdown_with_limit(STOP_GRACE).await {
            Ok(delay) => tracing::debug!("pulse controller stopped after {delay:?}"),
            Err(err) => tracing::debug!("pulse controller stop timed out: {err}"),
        }
    }

    /// Enables the generate loop.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
    }

    /// Keeps the control loop running but stops submitting jobs.
    pub fn pause(&self) {
        self.inner.triggered.store(false, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    pub fn manual_spike(&self, factor: Option<f64>, duration: Option<Duration>) {
        self.inner.engine.trigger_manual_spike(factor, duration);
        tracing::info!(?factor, ?duration, "manual spike injected");
    }

    pub fn status(&self) -> ControllerStatus {
        let inner = &self.inner;
        let started = *lock(&inner.started_at);
        let primary = inner.targets.first();

        ControllerStatus {
            running: started.is_some(),
            triggered: inner.triggered.load(Ordering::Acquire),
            start_time: started.map(|(wall, _)| wall),
            uptime: started
                .map(|(_, mono)| mono.elapsed())
                .unwrap_or(Duration::ZERO),
            current_tps: inner.pool.current_tps(),
            target_tps: inner.pool.target_tps(),
            requests_sent: inner.pool.total_requests(),
            error_count: inner.pool.total_errors(),
            avg_latency_ms: inner.pool.avg_latency_ms(),
            is_spiking: inner.engine.is_spiking(),
            active_workers: inner.pool.active(),
            queued_requests: inner.pool.queued(),
            target_url: primary.map(|t| t.url.clone()),
            transport: primary.map(|t| t.transport),
            pattern: inner.engine.status(),
            schedule: inner.schedule.info(),
        }
    }
}

impl Inner {
    /// Rebuilds the cumulative index when the health board changed.
    fn refresh_index(&self) {
        let version = self.board.version();
        if self.index_version.swap(version, Ordering::AcqRel) == version {
            return;
        }
        let index = Arc::new(WeightedIndex::build(&self.targets, &self.board));
        match self.index.write() {
            Ok(mut guard) => *guard = index,
            Err(poisoned) => *poisoned.into_inner() = index,
        }
    }

    fn load_index(&self) -> Arc<WeightedIndex> {
        match self.index.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Linearly raises the limiter rate from 1 to base TPS.
async fn ramp_task(guard: ShutdownGuard, inner: Arc<Inner>) {
    let start = Instant::now();
    let duration = inner.cfg.ramp_up;
    let target = inner.cfg.base_tps;

    tracing::info!(?duration, "starting ramp-up");

    let mut ticker = tokio::time::interval(CONTROL_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = ticker.tick() => {
                let elapsed = start.elapsed();
                if elapsed >= duration {
                    inner.pool.set_rate(target);
                    inner.ramping.store(false, Ordering::Release);
                    tracing::info!(tps = target, "ramp-up complete");
                    return;
                }
                let progress = elapsed.as_secs_f64() / duration.as_secs_f64();
                inner.pool.set_rate(1.0 + (target - 1.0) * progress);
            }
        }
    }
}

/// Recomputes the pattern output every 100 ms and pushes it into the limiter.
async fn control_task(guard: ShutdownGuard, inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(CONTROL_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = ticker.tick() => {
                let tps = inner.engine.calculate_tps(inner.schedule.multiplier());
                if !inner.ramping.load(Ordering::Acquire) {
                    inner.pool.set_rate(tps);
                }
                inner.metrics.set_spike_active(inner.engine.is_spiking());
            }
        }
    }
}

/// Keeps the pool fed. Backpressure comes from `submit` failing fast: on a
/// full queue the loop simply waits for the next tick.
async fn generate_task(guard: ShutdownGuard, inner: Arc<Inner>) {
    let mut rng = SmallRng::from_os_rng();
    let mut ticker = tokio::time::interval(GENERATE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = ticker.tick() => {
                if !inner.triggered.load(Ordering::Acquire) {
                    continue;
                }
                inner.refresh_index();
                let index = inner.load_index();
                for _ in 0..MAX_SUBMITS_PER_TICK {
                    if index.total == 0 {
                        break;
                    }
                    let roll = rng.random_range(0..index.total);
                    let Some(target) = index.pick(roll) else { break };
                    let job = Job {
                        target: target.clone(),
                        client: inner.clients.for_transport(target.transport),
                    };
                    if !inner.pool.submit(job) {
                        break;
                    }
                }
            }
        }
    }
}
