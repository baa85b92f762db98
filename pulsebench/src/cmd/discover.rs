use std::{sync::Arc, time::Duration};

use clap::Args;
use rama::{error::OpaqueError, graceful::ShutdownGuard};
use tokio::sync::mpsc;

use pulsebench_lib::{
    config::{DiscoveryConfig, Transport, WorkerConfig},
    discovery::DiscoveryProgress,
    metrics::NoopMetrics,
    runner,
};

#[derive(Debug, Clone, Args)]
/// probe the highest sustainable TPS under latency and error-rate limits
pub struct DiscoverCommand {
    /// target URL to probe
    #[arg(value_name = "URL", required = true)]
    url: String,

    /// transport: http, http2 or grpc
    #[arg(long, default_value = "http")]
    transport: String,

    /// HTTP method used for probe requests
    #[arg(long, default_value = "GET")]
    method: String,

    /// P95 latency limit in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 500.)]
    latency_limit: f64,

    /// error rate limit in percent
    #[arg(long, value_name = "PERCENT", default_value_t = 5.)]
    error_limit: f64,

    /// lower bound of the search range
    #[arg(long, value_name = "TPS", default_value_t = 10.)]
    min_tps: f64,

    /// upper bound of the search range
    #[arg(long, value_name = "TPS", default_value_t = 10_000.)]
    max_tps: f64,

    /// how long each TPS step runs
    #[arg(long, value_name = "SECONDS", default_value_t = 10.)]
    step: f64,

    /// stop once the search range has narrowed to this ratio
    #[arg(long, default_value_t = 0.05)]
    convergence: f64,
}

pub async fn exec(guard: ShutdownGuard, args: DiscoverCommand) -> Result<(), OpaqueError> {
    let transport: Transport = args.transport.parse()?;
    let cfg = DiscoveryConfig {
        target_url: args.url,
        transport,
        method: args.method,
        latency_limit_ms: args.latency_limit,
        error_rate_limit: args.error_limit,
        min_tps: args.min_tps,
        max_tps: args.max_tps,
        step_duration: Duration::from_secs_f64(args.step),
        convergence_rate: args.convergence,
    };

    let (progress_tx, progress_rx) = mpsc::channel::<DiscoveryProgress>(64);
    guard.spawn_task_fn(|guard| progress_printer(guard, progress_rx));

    let result = runner::discover(
        cfg,
        WorkerConfig::default(),
        Arc::new(NoopMetrics),
        guard,
        progress_tx,
    )
    .await?;

    println!("sustained_tps={:.0}", result.sustained_tps);
    println!("breaking_tps={:.0}", result.breaking_tps);
    println!("p95_latency_ms={:.1}", result.p95_latency_ms);
    println!("error_rate={:.2}%", result.error_rate);
    println!(
        "steps={} duration={:.1}s",
        result.steps_completed,
        result.duration.as_secs_f64()
    );
    println!("{}", result.recommendation.description);

    Ok(())
}

async fn progress_printer(guard: ShutdownGuard, mut progress_rx: mpsc::Receiver<DiscoveryProgress>) {
    loop {
        let progress = tokio::select! {
            _ = guard.cancelled() => return,
            maybe_progress = progress_rx.recv() => {
                let Some(progress) = maybe_progress else { return };
                progress
            }
        };

        println!(
            "[{:>3.0}%] tps={:.0} p95={:.1}ms err={:.2}% {}",
            progress.percent,
            progress.current_tps,
            progress.p95_latency_ms,
            progress.error_rate,
            progress.status,
        );
    }
}
