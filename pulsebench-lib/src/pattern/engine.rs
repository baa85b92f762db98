use std::{sync::RwLock, time::Duration};

use crate::{
    config::PatternConfig,
    pattern::{Noise, PoissonSpike},
};

/// Composes schedule, Poisson spikes and noise into one target TPS.
///
/// `base_tps` and `max_tps` can be reset at runtime; everything else is
/// frozen at construction.
#[derive(Debug)]
pub struct PatternEngine {
    poisson: PoissonSpike,
    noise: Noise,
    limits: RwLock<Limits>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    base_tps: f64,
    max_tps: f64,
}

/// Point-in-time view of the engine, for status output.
#[derive(Debug, Clone, Copy)]
pub struct PatternStatus {
    pub base_tps: f64,
    pub max_tps: f64,
    pub current_tps: f64,
    pub poisson_enabled: bool,
    pub poisson_spiking: bool,
    pub poisson_multiplier: f64,
    pub noise_enabled: bool,
    pub noise_multiplier: f64,
}

impl PatternEngine {
    pub fn new(cfg: PatternConfig, base_tps: f64, max_tps: f64) -> Self {
        Self {
            poisson: PoissonSpike::new(cfg.poisson),
            noise: Noise::new(cfg.noise),
            limits: RwLock::new(Limits { base_tps, max_tps }),
        }
    }

    /// Target TPS for this instant, clamped to `[1, max_tps]`.
    pub fn calculate_tps(&self, schedule_multiplier: f64) -> f64 {
        let limits = self.limits();
        let tps = limits.base_tps
            * schedule_multiplier
            * self.poisson.multiplier()
            * self.noise.multiplier();
        tps.clamp(1.0, limits.max_tps.max(1.0))
    }

    pub fn is_spiking(&self) -> bool {
        self.poisson.is_spiking()
    }

    pub fn trigger_manual_spike(&self, factor: Option<f64>, duration: Option<Duration>) {
        self.poisson.trigger_manual(factor, duration);
    }

    pub fn next_spike_in(&self) -> Duration {
        self.poisson.next_spike_in()
    }

    pub fn base_tps(&self) -> f64 {
        self.limits().base_tps
    }

    pub fn max_tps(&self) -> f64 {
        self.limits().max_tps
    }

    pub fn set_base_tps(&self, tps: f64) {
        self.write_limits(|limits| limits.base_tps = tps);
    }

    pub fn set_max_tps(&self, tps: f64) {
        self.write_limits(|limits| limits.max_tps = tps);
    }

    pub fn status(&self) -> PatternStatus {
        let limits = self.limits();
        let poisson_multiplier = self.poisson.multiplier();
        let noise_multiplier = self.noise.multiplier();
        let current_tps = (limits.base_tps * poisson_multiplier * noise_multiplier)
            .clamp(1.0, limits.max_tps.max(1.0));

        PatternStatus {
            base_tps: limits.base_tps,
            max_tps: limits.max_tps,
            current_tps,
            poisson_enabled: self.poisson.enabled(),
            poisson_spiking: self.poisson.is_spiking(),
            poisson_multiplier,
            noise_enabled: self.noise.enabled(),
            noise_multiplier,
        }
    }

    fn limits(&self) -> Limits {
        match self.limits.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn write_limits(&self, f: impl FnOnce(&mut Limits)) {
        match self.limits.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
