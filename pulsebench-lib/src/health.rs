//! Periodic target health probing.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rama::graceful::{Shutdown, ShutdownGuard};
use tokio::{sync::oneshot, task::JoinSet};

use crate::{
    client::{ClientSet, ProtocolRequest, ProtocolResponse},
    config::{HealthConfig, Target},
    metrics::MetricsSink,
};

/// Shared per-target health flags.
///
/// Written only by the health checker; read by the pulse controller. The
/// version counter bumps on every flag change so readers can rebuild derived
/// state (like the weighted target index) without scanning the map.
#[derive(Debug)]
pub struct HealthBoard {
    flags: RwLock<HashMap<String, bool>>,
    version: AtomicU64,
}

impl HealthBoard {
    /// Every target starts healthy; probes downgrade them.
    pub fn new(targets: &[Target]) -> Self {
        let flags = targets
            .iter()
            .map(|t| (t.name.clone(), true))
            .collect::<HashMap<_, _>>();
        Self {
            flags: RwLock::new(flags),
            version: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.read().get(name).copied().unwrap_or(false)
    }

    /// Returns whether the flag actually changed.
    pub fn set(&self, name: &str, healthy: bool) -> bool {
        let mut flags = match self.flags.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = flags.insert(name.to_string(), healthy);
        let changed = previous != Some(healthy);
        if changed {
            self.version.fetch_add(1, Ordering::Release);
        }
        changed
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, bool>> {
        match self.flags.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// How long `stop` waits for the probe loop to wind down.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Probes each target on an interval and publishes the outcome.
///
/// A target is healthy iff the probe produced no transport error and a status
/// in `[200, 400)`. Probes always use GET regardless of the target's
/// configured method, and are never retried; the next interval corrects any
/// blip.
///
/// The probe loop runs on its own shutdown tree, so it stops either with the
/// parent guard or through an explicit [`HealthChecker::stop`].
pub struct HealthChecker {
    cfg: HealthConfig,
    targets: Vec<Target>,
    clients: Arc<ClientSet>,
    metrics: Arc<dyn MetricsSink>,
    board: Arc<HealthBoard>,
    shutdown: Mutex<Option<Shutdown>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl HealthChecker {
    pub fn new(
        cfg: HealthConfig,
        targets: Vec<Target>,
        clients: Arc<ClientSet>,
        metrics: Arc<dyn MetricsSink>,
        board: Arc<HealthBoard>,
    ) -> Self {
        Self {
            cfg,
            targets,
            clients,
            metrics,
            board,
            shutdown: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn start(&self, guard: &ShutdownGuard) {
        if !self.cfg.enabled {
            return;
        }
        let mut slot = lock(&self.shutdown);
        if slot.is_some() {
            return;
        }

        for target in &self.targets {
            self.metrics.set_target_health(&target.name, true);
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let parent_cancelled = guard.clone_weak().into_cancelled();
        let shutdown = Shutdown::new(async move {
            tokio::select! {
                _ = parent_cancelled => {}
                _ = stop_rx => {}
            }
        });

        let cfg = self.cfg.clone();
        let targets = self.targets.clone();
        let clients = self.clients.clone();
        let metrics = self.metrics.clone();
        let board = self.board.clone();
        shutdown.spawn_task_fn(move |guard| {
            check_loop(guard, cfg, targets, clients, metrics, board)
        });

        *slot = Some(shutdown);
        *lock(&self.stop_tx) = Some(stop_tx);
    }

    /// Cancels the probe loop and waits briefly for it to exit. Later calls
    /// return immediately.
    pub async fn stop(&self) {
        if let Some(stop_tx) = lock(&self.stop_tx).take() {
            let _ = stop_tx.send(());
        }
        let shutdown = lock(&self.shutdown).take();
        let Some(shutdown) = shutdown else {
            return;
        };

        match shutdown.shutdown_with_limit(STOP_GRACE).await {
            Ok(delay) => tracing::debug!("health checker stopped after {delay:?}"),
            Err(err) => tracing::debug!("health checker stop timed out: {err}"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn check_loop(
    guard: ShutdownGuard,
    cfg: HealthConfig,
    targets: Vec<Target>,
    clients: Arc<ClientSet>,
    metrics: Arc<dyn MetricsSink>,
    board: Arc<HealthBoard>,
) {
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = ticker.tick() => {
                check_all(&cfg, &targets, &clients, &metrics, &board).await;
            }
        }
    }
}

async fn check_all(
    cfg: &HealthConfig,
    targets: &[Target],
    clients: &Arc<ClientSet>,
    metrics: &Arc<dyn MetricsSink>,
    board: &Arc<HealthBoard>,
) {
    let mut checks = JoinSet::new();
    for target in targets.iter().cloned() {
        let client = clients.for_transport(target.transport);
        let timeout = cfg.timeout;
        let metrics = metrics.clone();
        let board = board.clone();
        checks.spawn(async move {
            let request = probe_request(&target, timeout);
            let response = client.execute(&request).await;
            publish(&target, &response, &board, metrics.as_ref());
        });
    }
    while checks.join_next().await.is_some() {}
}

/// Health probes always GET, whatever the target's traffic method is.
fn probe_request(target: &Target, timeout: Duration) -> ProtocolRequest {
    ProtocolRequest {
        url: target.url.clone(),
        method: "GET".into(),
        headers: target.headers.clone(),
        body: rama::bytes::Bytes::new(),
        timeout,
    }
}

fn is_probe_healthy(response: &ProtocolResponse) -> bool {
    response.error.is_none() && (200..400).contains(&response.status)
}

fn publish(
    target: &Target,
    response: &ProtocolResponse,
    board: &HealthBoard,
    metrics: &dyn MetricsSink,
) {
    let healthy = is_probe_healthy(response);
    let changed = board.set(&target.name, healthy);
    metrics.set_target_health(&target.name, healthy);

    if changed {
        if healthy {
            tracing::info!(target = %target.name, "target is healthy again");
        } else {
            tracing::warn!(
                target = %target.name,
                status = response.status,
                error = response.error.map(|e| e.to_string()),
                "target became unhealthy"
            );
        }
    }
}
