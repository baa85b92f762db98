//! Adaptive load discovery: binary search for the highest TPS a target
//! sustains within latency and error-rate SLOs.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rama::{
    error::OpaqueError,
    graceful::ShutdownGuard,
};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    analyzer::Analyzer,
    client::ProtocolClient,
    config::{DiscoveryConfig, Target},
    pool::{Job, WorkerPool},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Progress message pushed to the observer every 100 ms during a step.
#[derive(Debug, Clone)]
pub struct DiscoveryProgress {
    pub percent: f64,
    pub current_tps: f64,
    pub p95_latency_ms: f64,
    pub error_rate: f64,
    pub status: String,
}

/// Outcome of a single constant-rate step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    pub tps: f64,
    pub p95_latency_ms: f64,
    pub error_rate: f64,
    pub stable: bool,
    pub duration: Duration,
    pub requests: u64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub sustained_tps: f64,
    pub breaking_tps: f64,
    pub p95_latency_ms: f64,
    pub error_rate: f64,
    pub duration: Duration,
    pub steps_completed: u32,
    pub recommendation: Recommendation,
}

/// Suggested controller settings derived from the discovered limits.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub base_tps: f64,
    pub max_tps: f64,
    pub description: String,
}

fn recommendation(sustained_tps: f64, breaking_tps: f64) -> Recommendation {
    let base_tps = sustained_tps * 0.8;
    let max_tps = (breaking_tps * 0.9).max(base_tps * 2.0);
    let description = format!(
        "Set base_tps to {base_tps:.0} (80% of sustained) and max_tps to {max_tps:.0} (safe spike limit)"
    );
    Recommendation {
        base_tps,
        max_tps,
        description,
    }
}

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Binary-search driver over the worker pool and the sliding-window analyzer.
///
/// Each step runs the target at a constant rate for `step_duration`, then
/// judges stability from the analyzer snapshot: `p95 <= latency_limit` and
/// `error_rate <= error_rate_limit`. Stable steps raise the lower bound,
/// unstable ones lower the upper bound, until the range converges.
pub struct DiscoveryController {
    cfg: DiscoveryConfig,
    pool: Arc<WorkerPool>,
    client: Arc<dyn ProtocolClient>,
    analyzer: Arc<Analyzer>,
    state: Mutex<DiscoveryState>,
}

impl DiscoveryController {
    pub fn new(
        cfg: DiscoveryConfig,
        pool: Arc<WorkerPool>,
        client: Arc<dyn ProtocolClient>,
        analyzer: Arc<Analyzer>,
    ) -> Self {
        Self {
            cfg,
            pool,
            client,
            analyzer,
            state: Mutex::new(DiscoveryState::Idle),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        *self.lock_state()
    }

    /// Runs discovery to completion. Cancellation mid-step fails the run and
    /// yields no result.
    pub async fn run(
        &self,
        guard: ShutdownGuard,
        progress_tx: mpsc::Sender<DiscoveryProgress>,
    ) -> Result<DiscoveryResult, OpaqueError> {
        {
            let mut state = self.lock_state();
            if *state == DiscoveryState::Running {
                return Err(OpaqueError::from_display("discovery already running"));
            }
            *state = DiscoveryState::Running;
        }
        self.analyzer.reset();

        let started = Instant::now();
        let mut low = self.cfg.min_tps;
        let mut high = self.cfg.max_tps;
        let mut current = self.cfg.min_tps;
        let mut last_stable = 0.0f64;
        let mut breaking = 0.0f64;
        let mut steps = 0u32;

        tracing::info!(
            min_tps = self.cfg.min_tps,
            max_tps = self.cfg.max_tps,
            latency_limit_ms = self.cfg.latency_limit_ms,
            error_rate_limit = self.cfg.error_rate_limit,
            "starting adaptive load discovery"
        );

        loop {
            if low > 0.0 && (high - low) / low < self.cfg.convergence_rate {
                break;
            }

            let percent = self.progress_percent(low, high);
            let step = match self.run_step(&guard, current, percent, &progress_tx).await {
                Ok(step) => step,
                Err(err) => {
                    *self.lock_state() = DiscoveryState::Failed;
                    return Err(err);
                }
            };
            steps += 1;

            if step.stable {
                last_stable = current;
                low = current;
                if current >= high {
                    break;
                }
            } else {
                breaking = current;
                high = current;
            }
            current = (low + high) / 2.0;

            tracing::info!(
                step = steps,
                tps = step.tps,
                stable = step.stable,
                p95_ms = step.p95_latency_ms,
                error_rate = step.error_rate,
                low,
                high,
                "discovery step complete"
            );
        }

        let snapshot = self.analyzer.snapshot();
        let sustained_tps = if last_stable > 0.0 {
            last_stable
        } else {
            self.cfg.min_tps
        };
        let breaking_tps = if breaking > 0.0 {
            breaking
        } else {
            sustained_tps * 1.2
        };

        let result = DiscoveryResult {
            sustained_tps,
            breaking_tps,
            p95_latency_ms: snapshot.p95_latency_ms,
            error_rate: snapshot.error_rate,
            duration: started.elapsed(),
            steps_completed: steps,
            recommendation: recommendation(sustained_tps, breaking_tps),
        };

        *self.lock_state() = DiscoveryState::Completed;
        let _ = progress_tx
            .try_send(DiscoveryProgress {
                percent: 100.0,
                current_tps: result.sustained_tps,
                p95_latency_ms: result.p95_latency_ms,
                error_rate: result.error_rate,
                status: "Discovery complete".into(),
            });

        tracing::info!(
            sustained = result.sustained_tps,
            breaking = result.breaking_tps,
            steps = result.steps_completed,
            "discovery completed"
        );

        Ok(result)
    }

    /// One constant-rate probe. Submissions use a fixed `1/tps` ticker rather
    /// than the pattern engine; the limiter is set to the same rate.
    async fn run_step(
        &self,
        guard: &ShutdownGuard,
        tps: f64,
        percent: f64,
        progress_tx: &mpsc::Sender<DiscoveryProgress>,
    ) -> Result<StepOutcome, OpaqueError> {
        self.analyzer.reset_window();
        self.pool.set_rate(tps);

        let target = Target {
            name: "discovery".into(),
            url: self.cfg.target_url.clone(),
            transport: self.cfg.transport,
            method: self.cfg.method.clone(),
            headers: Default::default(),
            body: String::new(),
            weight: 100,
            timeout: Duration::from_secs(5),
        };

        let requests_before = self.analyzer.total_requests();
        let errors_before = self.analyzer.total_errors();

        let step_deadline = tokio::time::sleep(self.cfg.step_duration);
        tokio::pin!(step_deadline);

        let mut submit_tick =
            tokio::time::interval(Duration::from_secs_f64(1.0 / tps.max(1.0)));
        submit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut progress_tick = tokio::time::interval(PROGRESS_INTERVAL);
        progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = guard.cancelled() => {
                    return Err(OpaqueError::from_display("discovery cancelled"));
                }
                _ = &mut step_deadline => break,
                _ = submit_tick.tick() => {
                    self.pool.submit(Job {
                        target: target.clone(),
                        client: self.client.clone(),
                    });
                }
                _ = progress_tick.tick() => {
                    let _ = progress_tx.try_send(DiscoveryProgress {
                        percent,
                        current_tps: tps,
                        p95_latency_ms: self.analyzer.p95(),
                        error_rate: self.analyzer.error_rate(),
                        status: format!("Testing {tps:.0} TPS"),
                    });
                }
            }
        }

        let snapshot = self.analyzer.snapshot();
        let stable = snapshot.p95_latency_ms <= self.cfg.latency_limit_ms
            && snapshot.error_rate <= self.cfg.error_rate_limit;

        Ok(StepOutcome {
            tps,
            p95_latency_ms: snapshot.p95_latency_ms,
            error_rate: snapshot.error_rate,
            stable,
            duration: self.cfg.step_duration,
            requests: snapshot.total_requests - requests_before,
            errors: snapshot.total_errors - errors_before,
        })
    }

    /// How far the search range has narrowed, capped at 99 until completion.
    fn progress_percent(&self, low: f64, high: f64) -> f64 {
        let initial = self.cfg.max_tps - self.cfg.min_tps;
        if initial <= 0.0 {
            return 0.0;
        }
        ((1.0 - (high - low) / initial) * 100.0).min(99.0)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DiscoveryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rama::graceful::Shutdown;
    use tokio::time;

    use super::*;
    use crate::{
        client::{ProtocolRequest, ProtocolResponse},
        config::{Transport, WorkerConfig},
        limiter::RateLimiter,
        metrics::NoopMetrics,
    };

    /// Simulated target: fast while the driven rate stays at or below the
    /// knee, slow above it.
    struct KneeClient {
        limiter: Arc<RateLimiter>,
        knee_tps: f64,
    }

    #[async_trait]
    impl ProtocolClient for KneeClient {
        async fn execute(&self, _req: &ProtocolRequest) -> ProtocolResponse {
            let overloaded = self.limiter.rate() > self.knee_tps;
            ProtocolResponse {
                status: 200,
                duration: if overloaded {
                    Duration::from_millis(600)
                } else {
                    Duration::from_millis(50)
                },
                bytes_read: 0,
                bytes_written: 0,
                error: None,
            }
        }
    }

    struct Rig {
        discovery: DiscoveryController,
        analyzer: Arc<Analyzer>,
        pool: Arc<WorkerPool>,
    }

    fn rig(cfg: DiscoveryConfig, knee_tps: f64) -> Rig {
        let limiter = Arc::new(RateLimiter::new(cfg.min_tps));
        let analyzer = Arc::new(Analyzer::new(Duration::from_secs(5)));
        let pool = Arc::new(
            WorkerPool::new(
                WorkerConfig {
                    pool_size: 8,
                    queue_size: 2000,
                    ..Default::default()
                },
                limiter.clone(),
                Arc::new(NoopMetrics),
            )
            .with_observer(analyzer.clone()),
        );
        pool.start();

        let client: Arc<dyn ProtocolClient> = Arc::new(KneeClient {
            limiter,
            knee_tps,
        });
        let discovery = DiscoveryController::new(cfg, pool.clone(), client, analyzer.clone());
        Rig {
            discovery,
            analyzer,
            pool,
        }
    }

    fn sim_config() -> DiscoveryConfig {
        DiscoveryConfig {
            target_url: "http://localhost:1/sim".into(),
            transport: Transport::Http,
            method: "GET".into(),
            latency_limit_ms: 500.0,
            error_rate_limit: 5.0,
            min_tps: 10.0,
            max_tps: 1000.0,
            step_duration: Duration::from_millis(500),
            convergence_rate: 0.05,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn converges_on_the_stability_knee() {
        time::pause();

        let rig = rig(sim_config(), 200.0);
        let shutdown = Shutdown::new(std::future::pending::<()>());
        let (tx, mut rx) = mpsc::channel(256);

        let result = rig
            .discovery
            .run(shutdown.guard(), tx)
            .await
            .expect("discovery result");

        assert!(
            (190.0..=210.0).contains(&result.sustained_tps),
            "sustained {}",
            result.sustained_tps
        );
        assert!(result.breaking_tps > result.sustained_tps);
        assert!(result.steps_completed <= 14, "{} steps", result.steps_completed);
        assert_eq!(rig.discovery.state(), DiscoveryState::Completed);

        // Recommendation arithmetic.
        let rec = &result.recommendation;
        assert!((rec.base_tps - result.sustained_tps * 0.8).abs() < 1e-9);
        assert!(rec.max_tps >= rec.base_tps * 2.0 - 1e-9);

        // Progress was pushed and stayed within range, ending at 100.
        let mut last = 0.0;
        let mut seen = 0;
        while let Ok(p) = rx.try_recv() {
            assert!((0.0..=100.0).contains(&p.percent), "percent {}", p.percent);
            last = p.percent;
            seen += 1;
        }
        assert!(seen > 0);
        assert_eq!(last, 100.0);

        rig.pool.stop().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn low_ceiling_reports_fallback_breaking_point() {
        time::pause();

        // Knee above max_tps: every step is stable, no breaking point found.
        let mut cfg = sim_config();
        cfg.max_tps = 100.0;
        cfg.min_tps = 100.0;
        let rig = rig(cfg, 200.0);

        let shutdown = Shutdown::new(std::future::pending::<()>());
        let (tx, _rx) = mpsc::channel(256);
        let result = rig
            .discovery
            .run(shutdown.guard(), tx)
            .await
            .expect("discovery result");

        assert_eq!(result.sustained_tps, 100.0);
        assert!((result.breaking_tps - 120.0).abs() < 1e-9);

        rig.pool.stop().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancellation_mid_step_fails_without_result() {
        time::pause();

        let rig = rig(sim_config(), 200.0);
        // Signal fires 200 ms in, well inside the first 500 ms step.
        let shutdown = Shutdown::new(tokio::time::sleep(Duration::from_millis(200)));
        let guard = shutdown.guard();
        tokio::spawn(shutdown.shutdown());
        let (tx, _rx) = mpsc::channel(256);

        let err = rig
            .discovery
            .run(guard, tx)
            .await
            .expect_err("cancelled discovery must not produce a result");
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(rig.discovery.state(), DiscoveryState::Failed);

        rig.pool.stop().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn analyzer_window_resets_between_steps() {
        time::pause();

        let rig = rig(sim_config(), 200.0);
        rig.analyzer.record(10_000.0, false);
        assert!(rig.analyzer.p95() > 0.0);

        let shutdown = Shutdown::new(std::future::pending::<()>());
        let (tx, _rx) = mpsc::channel(16);
        let result = rig
            .discovery
            .run(shutdown.guard(), tx)
            .await
            .expect("discovery result");

        // The poisoned pre-run sample influenced nothing.
        assert!((190.0..=210.0).contains(&result.sustained_tps));

        rig.pool.stop().await;
    }
}
