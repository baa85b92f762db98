use std::sync::Mutex;

use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

use crate::config::NoiseConfig;

/// Smoothly varying multiplier around 1.0 within `[1 - amplitude, 1 + amplitude]`.
///
/// A spring-damper system chases a randomly resampled target offset, which
/// produces drift without step discontinuities. Disabled noise always yields 1.0.
#[derive(Debug)]
pub struct Noise {
    cfg: NoiseConfig,
    state: Mutex<NoiseState>,
}

#[derive(Debug)]
struct NoiseState {
    rng: SmallRng,
    current: f64,
    velocity: f64,
    target: f64,
}

const SPRING_CONSTANT: f64 = 0.1;
const DAMPING_CONSTANT: f64 = 0.3;
const RETARGET_PROBABILITY: f64 = 0.1;

impl Noise {
    pub fn new(cfg: NoiseConfig) -> Self {
        Self::new_with_rng(cfg, SmallRng::from_os_rng())
    }

    fn new_with_rng(cfg: NoiseConfig, rng: SmallRng) -> Self {
        Self {
            cfg,
            state: Mutex::new(NoiseState {
                rng,
                current: 0.0,
                velocity: 0.0,
                target: 0.0,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn multiplier(&self) -> f64 {
        if !self.cfg.enabled {
            return 1.0;
        }

        let amplitude = self.cfg.amplitude;
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.rng.random::<f64>() < RETARGET_PROBABILITY {
            state.target = (state.rng.random::<f64>() * 2.0 - 1.0) * amplitude;
        }

        let force = SPRING_CONSTANT * (state.target - state.current);
        state.velocity = state.velocity * DAMPING_CONSTANT + force;
        state.current += state.velocity;

        if state.current > amplitude {
            state.current = amplitude;
            state.velocity = 0.0;
        }
        if state.current < -amplitude {
            state.current = -amplitude;
            state.velocity = 0.0;
        }

        1.0 + state.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(cfg: NoiseConfig, seed: u64) -> Noise {
        Noise::new_with_rng(cfg, SmallRng::seed_from_u64(seed))
    }

    #[test]
    fn disabled_noise_is_identity() {
        let noise = seeded(
            NoiseConfig {
                enabled: false,
                amplitude: 0.5,
            },
            1,
        );
        for _ in 0..100 {
            assert_eq!(noise.multiplier(), 1.0);
        }
    }

    #[test]
    fn output_stays_within_amplitude_bounds() {
        let amplitude = 0.2;
        let noise = seeded(
            NoiseConfig {
                enabled: true,
                amplitude,
            },
            2,
        );
        for _ in 0..10_000 {
            let m = noise.multiplier();
            assert!(m >= 1.0 - amplitude - 1e-12, "below bound: {m}");
            assert!(m <= 1.0 + amplitude + 1e-12, "above bound: {m}");
        }
    }

    #[test]
    fn evolution_is_smooth() {
        let amplitude = 0.3;
        let noise = seeded(
            NoiseConfig {
                enabled: true,
                amplitude,
            },
            3,
        );

        // Worst-case per-call step of the damped spring: force is bounded by
        // spring * 2A and velocity by that bound's geometric series.
        let max_step = SPRING_CONSTANT * 2.0 * amplitude / (1.0 - DAMPING_CONSTANT);
        let mut prev = noise.multiplier();
        for _ in 0..10_000 {
            let next = noise.multiplier();
            assert!(
                (next - prev).abs() <= max_step + 1e-9,
                "jump {} exceeds {max_step}",
                (next - prev).abs()
            );
            prev = next;
        }
    }
}
