use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Args;
use prometheus::{Registry, TextEncoder};
use rama::{
    error::{ErrorContext as _, OpaqueError},
    graceful::ShutdownGuard,
};

use pulsebench_lib::{
    config::{Config, Target, Transport},
    metrics::{MetricsSink, NoopMetrics, PrometheusMetrics},
    runner,
};

#[derive(Debug, Clone, Args)]
/// generate irregular traffic against the configured targets
pub struct RunCommand {
    /// TOML config file with targets and pattern settings
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// single target URL, as an alternative to a config file
    #[arg(long, value_name = "URL")]
    target: Option<String>,

    /// transport for --target: http, http2 or grpc
    #[arg(long, default_value = "http")]
    transport: String,

    /// HTTP method for --target
    #[arg(long, default_value = "GET")]
    method: String,

    /// overwrite the configured base TPS
    #[arg(long, value_name = "TPS")]
    base_tps: Option<f64>,

    /// overwrite the configured max TPS
    #[arg(long, value_name = "TPS")]
    max_tps: Option<f64>,

    /// how long to generate; 0 runs until interrupted
    #[arg(long, value_name = "SECONDS", default_value_t = 0.)]
    duration: f64,

    /// gather into a prometheus registry and dump it on exit
    #[arg(long, default_value_t = false)]
    dump_metrics: bool,
}

pub async fn exec(guard: ShutdownGuard, args: RunCommand) -> Result<(), OpaqueError> {
    let cfg = load_config(&args)?;

    let registry = Registry::new();
    let metrics: Arc<dyn MetricsSink> = if args.dump_metrics {
        Arc::new(PrometheusMetrics::register(&registry).context("register metrics")?)
    } else {
        Arc::new(NoopMetrics)
    };

    let run_for = (args.duration > 0.).then(|| Duration::from_secs_f64(args.duration));
    let report = runner::run(cfg, metrics, guard, run_for).await?;

    println!(
        "done requests={} errors={} abandoned={}",
        report.requests_sent, report.error_count, report.drain_abandoned,
    );

    if args.dump_metrics {
        let body = TextEncoder::new()
            .encode_to_string(&registry.gather())
            .context("encode metrics")?;
        println!("{body}");
    }

    Ok(())
}

fn load_config(args: &RunCommand) -> Result<Config, OpaqueError> {
    let mut cfg = match (&args.config, &args.target) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config file '{}'", path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("parse config file '{}'", path.display()))?
        }
        (None, Some(url)) => {
            let transport: Transport = args.transport.parse()?;
            Config {
                targets: vec![Target {
                    name: "primary".into(),
                    url: url.clone(),
                    transport,
                    method: args.method.clone(),
                    headers: Default::default(),
                    body: String::new(),
                    weight: 100,
                    timeout: Duration::from_secs(5),
                }],
                ..Default::default()
            }
        }
        (None, None) => {
            return Err(OpaqueError::from_display(
                "either --config or --target is required",
            ));
        }
    };

    if let Some(base_tps) = args.base_tps {
        cfg.controller.base_tps = base_tps;
        cfg.controller.max_tps = cfg.controller.max_tps.max(base_tps);
    }
    if let Some(max_tps) = args.max_tps {
        cfg.controller.max_tps = max_tps;
    }

    cfg.validate()?;
    Ok(cfg)
}
