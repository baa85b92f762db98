//! Typed run configuration consumed by the engine.
//!
//! Outer layers (CLI flags, config files) produce these structs; everything in
//! here is validated once via [`Config::validate`] before any component starts.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use rama::error::OpaqueError;
use serde::{Deserialize, Serialize};

/// Wire transport used to reach a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    Http2,
    Grpc,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Http2 => "http2",
            Self::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = OpaqueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "http1" | "http/1.1" => Ok(Self::Http),
            "http2" | "h2" | "http/2" => Ok(Self::Http2),
            "grpc" => Ok(Self::Grpc),
            other => Err(OpaqueError::from_display(format!(
                "unknown transport '{other}' (expected http, http2 or grpc)"
            ))),
        }
    }
}

/// A single endpoint traffic is generated against. Immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_target_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_method() -> String {
    "GET".into()
}

fn default_weight() -> u32 {
    100
}

fn default_target_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Pulse controller knobs: the steady rate, its ceiling and the ramp/drain windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub base_tps: f64,
    pub max_tps: f64,
    #[serde(with = "duration_secs")]
    pub ramp_up: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_tps: 100.0,
            max_tps: 1000.0,
            ramp_up: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Traffic shape: Poisson bursts, micro noise and the hour-of-day schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default)]
    pub poisson: PoissonConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

/// Poisson-scheduled spike events.
///
/// Either `lambda` (events per second) or `interval` drives the process; a
/// nonzero `interval` wins and is converted as `lambda = 1 / seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoissonConfig {
    pub enabled: bool,
    pub lambda: f64,
    #[serde(default, with = "opt_duration_secs")]
    pub interval: Option<Duration>,
    pub spike_factor: f64,
    #[serde(with = "duration_secs")]
    pub min_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_interval: Duration,
    #[serde(with = "duration_secs")]
    pub ramp_up: Duration,
    #[serde(with = "duration_secs")]
    pub ramp_down: Duration,
}

impl Default for PoissonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // one spike every ~2 minutes
            lambda: 1.0 / 120.0,
            interval: None,
            spike_factor: 2.0,
            min_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(600),
            ramp_up: Duration::from_secs(5),
            ramp_down: Duration::from_secs(10),
        }
    }
}

impl PoissonConfig {
    /// Effective event rate after the interval-to-lambda conversion.
    pub fn effective_lambda(&self) -> f64 {
        match self.interval {
            Some(interval) if interval > Duration::ZERO => 1.0 / interval.as_secs_f64(),
            _ => self.lambda,
        }
    }
}

/// Smooth multiplicative jitter around 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseConfig {
    pub enabled: bool,
    pub amplitude: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            amplitude: 0.10,
        }
    }
}

/// Hour-of-day multiplier; later entries override earlier ones for the same hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub hours: Vec<u8>,
    pub multiplier: f64,
}

/// Worker pool sizing and connection reuse knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub queue_size: usize,
    pub max_idle_conns: usize,
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    #[serde(default = "default_tls_insecure")]
    pub tls_insecure: bool,
}

fn default_tls_insecure() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1000,
            queue_size: 10_000,
            max_idle_conns: 100,
            idle_timeout: Duration::from_secs(90),
            tls_insecure: true,
        }
    }
}

/// Periodic target probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Binary-search load discovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub target_url: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_method")]
    pub method: String,
    pub latency_limit_ms: f64,
    pub error_rate_limit: f64,
    pub min_tps: f64,
    pub max_tps: f64,
    #[serde(with = "duration_secs")]
    pub step_duration: Duration,
    pub convergence_rate: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            transport: Transport::Http,
            method: "GET".into(),
            latency_limit_ms: 500.0,
            error_rate_limit: 5.0,
            min_tps: 10.0,
            max_tps: 10_000.0,
            step_duration: Duration::from_secs(10),
            convergence_rate: 0.05,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), OpaqueError> {
        if self.target_url.is_empty() {
            return Err(invalid("discovery target_url must be set"));
        }
        if self.latency_limit_ms <= 0.0 {
            return Err(invalid("discovery latency_limit_ms must be positive"));
        }
        if !(0.0..=100.0).contains(&self.error_rate_limit) {
            return Err(invalid("discovery error_rate_limit must be within [0, 100]"));
        }
        if self.min_tps <= 0.0 || self.max_tps < self.min_tps {
            return Err(invalid(
                "discovery tps range requires 0 < min_tps <= max_tps",
            ));
        }
        if self.step_duration == Duration::ZERO {
            return Err(invalid("discovery step_duration must be positive"));
        }
        if !(self.convergence_rate > 0.0 && self.convergence_rate < 1.0) {
            return Err(invalid("discovery convergence_rate must be within (0, 1)"));
        }
        Ok(())
    }
}

/// Root configuration for a generator run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub pattern: PatternConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    /// Rejects configurations the engine refuses to start with.
    pub fn validate(&self) -> Result<(), OpaqueError> {
        if self.targets.is_empty() {
            return Err(invalid("at least one target is required"));
        }
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(invalid("target name must not be empty"));
            }
            if !target.url.contains("://") && target.transport != Transport::Grpc {
                return Err(invalid(format!(
                    "target '{}' url must be absolute: '{}'",
                    target.name, target.url
                )));
            }
            if target.weight == 0 {
                return Err(invalid(format!(
                    "target '{}' weight must be positive",
                    target.name
                )));
            }
            if target.timeout == Duration::ZERO {
                return Err(invalid(format!(
                    "target '{}' timeout must be positive",
                    target.name
                )));
            }
        }

        let ctrl = &self.controller;
        if ctrl.base_tps <= 0.0 {
            return Err(invalid("controller base_tps must be positive"));
        }
        if ctrl.max_tps < ctrl.base_tps {
            return Err(invalid("controller max_tps must be >= base_tps"));
        }

        let poisson = &self.pattern.poisson;
        if poisson.enabled {
            if poisson.effective_lambda() <= 0.0 {
                return Err(invalid(
                    "poisson requires a positive lambda or a nonzero interval",
                ));
            }
            if poisson.spike_factor < 1.0 {
                return Err(invalid("poisson spike_factor must be >= 1"));
            }
            if poisson.max_interval < poisson.min_interval {
                return Err(invalid("poisson max_interval must be >= min_interval"));
            }
        }

        let noise = &self.pattern.noise;
        if noise.enabled && !(0.0..=1.0).contains(&noise.amplitude) {
            return Err(invalid("noise amplitude must be within [0, 1]"));
        }

        for entry in &self.pattern.schedule {
            if entry.multiplier <= 0.0 {
                return Err(invalid("schedule multiplier must be positive"));
            }
            if entry.hours.iter().any(|h| *h > 23) {
                return Err(invalid("schedule hours must be within 0..=23"));
            }
        }

        if self.worker.pool_size == 0 {
            return Err(invalid("worker pool_size must be positive"));
        }
        if self.worker.queue_size == 0 {
            return Err(invalid("worker queue_size must be positive"));
        }

        Ok(())
    }
}

fn invalid(msg: impl fmt::Display) -> OpaqueError {
    OpaqueError::from_display(format!("invalid config: {msg}"))
}

/// Durations serialize as fractional seconds so config files stay unit-free.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(de)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be >= 0 seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_some(&d.as_secs_f64()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(de)?;
        match secs {
            None => Ok(None),
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Some(Duration::from_secs_f64(secs)))
            }
            Some(_) => Err(serde::de::Error::custom("duration must be >= 0 seconds")),
        }
    }
}
