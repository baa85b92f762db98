//! Lifecycle wiring for the two operating modes: steady generation (`run`)
//! and adaptive load discovery (`discover`).

use std::{sync::Arc, time::Duration};

use rama::{
    error::{ErrorContext as _, OpaqueError},
    graceful::ShutdownGuard,
};
use tokio::sync::mpsc;

use crate::{
    analyzer::Analyzer,
    client::{ClientSet, ClientSettings},
    config::{Config, DiscoveryConfig, WorkerConfig},
    controller::{ControllerStatus, PulseController},
    discovery::{DiscoveryController, DiscoveryProgress, DiscoveryResult},
    health::{HealthBoard, HealthChecker},
    limiter::RateLimiter,
    metrics::MetricsSink,
    pattern::{PatternEngine, Schedule},
    pool::WorkerPool,
};

/// Final accounting of a generator run. The request totals are captured at
/// stop time, before the drain tail.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub requests_sent: u64,
    pub error_count: u64,
    pub drain_abandoned: i64,
}

/// A fully wired traffic generator.
///
/// Owns the pool, the health checker and the pulse controller; exposes the
/// command surface (trigger, pause, manual spike, status) while running.
pub struct Generator {
    cfg: Config,
    clients: Arc<ClientSet>,
    pool: Arc<WorkerPool>,
    checker: HealthChecker,
    controller: PulseController,
}

impl Generator {
    pub fn new(cfg: Config, metrics: Arc<dyn MetricsSink>) -> Result<Self, OpaqueError> {
        cfg.validate()?;
        let clients = Arc::new(
            ClientSet::new(ClientSettings::from(&cfg.worker)).context("create protocol clients")?,
        );
        Ok(Self::with_clients(cfg, clients, metrics))
    }

    fn with_clients(cfg: Config, clients: Arc<ClientSet>, metrics: Arc<dyn MetricsSink>) -> Self {
        let limiter = Arc::new(RateLimiter::new(1.0));
        let pool = Arc::new(WorkerPool::new(
            cfg.worker.clone(),
            limiter,
            metrics.clone(),
        ));
        let board = Arc::new(HealthBoard::new(&cfg.targets));
        let checker = HealthChecker::new(
            cfg.health.clone(),
            cfg.targets.clone(),
            clients.clone(),
            metrics.clone(),
            board.clone(),
        );
        let engine = Arc::new(PatternEngine::new(
            cfg.pattern.clone(),
            cfg.controller.base_tps,
            cfg.controller.max_tps,
        ));
        let schedule = Schedule::new(cfg.pattern.schedule.clone());
        let controller = PulseController::new(
            cfg.controller.clone(),
            cfg.targets.clone(),
            engine,
            schedule,
            pool.clone(),
            board,
            clients.clone(),
            metrics,
        );

        Self {
            cfg,
            clients,
            pool,
            checker,
            controller,
        }
    }

    /// Starts pool, health checker and controller, and pulls the trigger.
    pub fn start(&self, guard: &ShutdownGuard) {
        self.pool.start();
        self.checker.start(guard);
        self.controller.start(guard);
        self.controller.trigger();
    }

    pub fn trigger(&self) {
        self.controller.trigger();
    }

    pub fn pause(&self) {
        self.controller.pause();
    }

    pub fn manual_spike(&self, factor: Option<f64>, duration: Option<Duration>) {
        self.controller.manual_spike(factor, duration);
    }

    pub fn status(&self) -> ControllerStatus {
        self.controller.status()
    }

    /// Tears the generator down in dependency order: controller first, then
    /// the health checker, then the pool (drain up to the configured
    /// deadline, then stop), and finally the clients. Safe to call again.
    pub async fn shutdown(&self) -> RunReport {
        self.controller.stop().await;
        self.checker.stop().await;

        let requests_sent = self.pool.total_requests();
        let error_count = self.pool.total_errors();

        let drain_abandoned = self.pool.drain(self.cfg.controller.shutdown_timeout).await;
        self.pool.stop().await;
        self.clients.close().await;

        tracing::info!(
            requests_sent,
            error_count,
            drain_abandoned,
            "generator stopped"
        );

        RunReport {
            requests_sent,
            error_count,
            drain_abandoned,
        }
    }
}

/// Blocks until cancellation (or until `run_for` elapses), then drains and
/// stops.
pub async fn run(
    cfg: Config,
    metrics: Arc<dyn MetricsSink>,
    guard: ShutdownGuard,
    run_for: Option<Duration>,
) -> Result<RunReport, OpaqueError> {
    let generator = Generator::new(cfg, metrics)?;
    generator.start(&guard);

    match run_for.filter(|d| *d > Duration::ZERO) {
        Some(duration) => {
            tokio::select! {
                _ = guard.cancelled() => {
                    tracing::info!("shutdown signal received");
                }
                _ = tokio::time::sleep(duration) => {
                    tracing::info!(?duration, "run duration elapsed");
                }
            }
        }
        None => {
            guard.cancelled().await;
            tracing::info!("shutdown signal received");
        }
    }

    Ok(generator.shutdown().await)
}

/// Runs adaptive load discovery against a single endpoint.
pub async fn discover(
    cfg: DiscoveryConfig,
    worker: WorkerConfig,
    metrics: Arc<dyn MetricsSink>,
    guard: ShutdownGuard,
    progress_tx: mpsc::Sender<DiscoveryProgress>,
) -> Result<DiscoveryResult, OpaqueError> {
    cfg.validate()?;
    let clients =
        ClientSet::new(ClientSettings::from(&worker)).context("create protocol clients")?;
    let client = clients.for_transport(cfg.transport);

    let limiter = Arc::new(RateLimiter::new(cfg.min_tps));
    let analyzer = Arc::new(Analyzer::new(Duration::from_secs(5)));
    let pool = Arc::new(
        WorkerPool::new(worker, limiter, metrics).with_observer(analyzer.clone()),
    );
    pool.start();

    let discovery = DiscoveryController::new(cfg, pool.clone(), client, analyzer);
    let result = discovery.run(guard, progress_tx).await;

    pool.stop().await;
    clients.close().await;

    result
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use rama::graceful::Shutdown;
    use tokio::{task::yield_now, time};

    use super::*;
    use crate::{
        client::{ProtocolClient, ProtocolRequest, ProtocolResponse},
        config::{
            ControllerConfig, HealthConfig, NoiseConfig, PatternConfig, PoissonConfig, Target,
            Transport,
        },
        metrics::NoopMetrics,
    };

    struct FastClient;

    #[async_trait]
    impl ProtocolClient for FastClient {
        async fn execute(&self, _req: &ProtocolRequest) -> ProtocolResponse {
            ProtocolResponse {
                status: 200,
                duration: Duration::from_millis(10),
                bytes_read: 64,
                bytes_written: 0,
                error: None,
            }
        }
    }

    fn flat_config(base_tps: f64) -> Config {
        Config {
            targets: vec![Target {
                name: "primary".into(),
                url: "http://localhost:1/primary".into(),
                transport: Transport::Http,
                method: "GET".into(),
                headers: BTreeMap::new(),
                body: String::new(),
                weight: 100,
                timeout: Duration::from_secs(5),
            }],
            controller: ControllerConfig {
                base_tps,
                max_tps: 1000.0,
                ramp_up: Duration::ZERO,
                shutdown_timeout: Duration::from_secs(2),
            },
            pattern: PatternConfig {
                poisson: PoissonConfig {
                    enabled: false,
                    ..Default::default()
                },
                noise: NoiseConfig {
                    enabled: false,
                    amplitude: 0.0,
                },
                schedule: Vec::new(),
            },
            worker: WorkerConfig {
                pool_size: 50,
                queue_size: 1000,
                ..Default::default()
            },
            health: HealthConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    fn generator(cfg: Config) -> Generator {
        let clients = Arc::new(ClientSet::single_for_tests(Arc::new(FastClient)));
        Generator::with_clients(cfg, clients, Arc::new(NoopMetrics))
    }

    async fn advance(total: Duration) {
        let step = Duration::from_millis(20);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            time::advance(step).await;
            yield_now().await;
            elapsed += step;
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn flat_run_hits_the_configured_rate() {
        time::pause();

        let generator = generator(flat_config(100.0));
        let shutdown = Shutdown::new(std::future::pending::<()>());
        generator.start(&shutdown.guard());

        advance(Duration::from_secs(5)).await;
        let report = generator.shutdown().await;

        // 5 s at 100 tps, within the 10% envelope of the spec scenario.
        assert!(
            (450..=550).contains(&report.requests_sent),
            "sent {}",
            report.requests_sent
        );
        assert_eq!(report.error_count, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manual_spike_raises_throughput_and_reports_spiking() {
        time::pause();

        let generator = generator(flat_config(100.0));
        let shutdown = Shutdown::new(std::future::pending::<()>());
        generator.start(&shutdown.guard());

        advance(Duration::from_secs(1)).await;
        assert!(!generator.status().is_spiking);
        let flat_sent = generator.status().requests_sent;

        generator.manual_spike(Some(4.0), Some(Duration::from_secs(3)));
        assert!(generator.status().is_spiking);

        advance(Duration::from_secs(3)).await;
        // Past the spike end the flag clears again.
        assert!(!generator.status().is_spiking);

        let spiked_sent = generator.status().requests_sent - flat_sent;
        // 3 s under a factor-4 envelope must beat the flat 3 s count of ~300.
        assert!(spiked_sent > 450, "sent {spiked_sent} during the spike");

        generator.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn poisson_spikes_raise_the_target_rate() {
        time::pause();

        let mut cfg = flat_config(100.0);
        cfg.pattern.poisson = PoissonConfig {
            enabled: true,
            lambda: 1.0,
            interval: None,
            spike_factor: 5.0,
            min_interval: Duration::ZERO,
            max_interval: Duration::from_secs(600),
            ramp_up: Duration::from_millis(100),
            ramp_down: Duration::from_millis(200),
        };

        let generator = generator(cfg);
        let shutdown = Shutdown::new(std::future::pending::<()>());
        generator.start(&shutdown.guard());

        let mut spikes = 0u32;
        let mut spiking_before = false;
        let mut peak_target_tps = 0.0f64;
        for _ in 0..500 {
            time::advance(Duration::from_millis(20)).await;
            yield_now().await;
            let status = generator.status();
            if status.is_spiking && !spiking_before {
                spikes += 1;
            }
            spiking_before = status.is_spiking;
            peak_target_tps = peak_target_tps.max(status.target_tps);
        }

        // lambda=1 over 10 s: several distinct spikes, and at least one
        // control tick observes the envelope near its factor-5 peak.
        assert!((2..=30).contains(&spikes), "{spikes} spikes");
        assert!(peak_target_tps >= 400.0, "peak target tps {peak_target_tps}");

        generator.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_after_shutdown_is_safe() {
        time::pause();

        let generator = generator(flat_config(50.0));
        let shutdown = Shutdown::new(std::future::pending::<()>());
        generator.start(&shutdown.guard());

        advance(Duration::from_millis(500)).await;
        let first = generator.shutdown().await;
        let second = generator.shutdown().await;
        assert_eq!(first.drain_abandoned, 0);
        assert_eq!(second.drain_abandoned, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalid_config_refuses_to_start() {
        let mut cfg = flat_config(100.0);
        cfg.targets.clear();
        let err = Generator::new(cfg, Arc::new(NoopMetrics)).expect_err("must refuse");
        assert!(err.to_string().contains("invalid config"));
    }
}
