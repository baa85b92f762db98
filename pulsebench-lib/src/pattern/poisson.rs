use std::{sync::Mutex, time::Duration};

use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};
use tokio::time::Instant;

use crate::config::PoissonConfig;

/// Poisson-scheduled traffic spikes.
///
/// The generator is a two-state machine. While idle, the next spike deadline
/// is drawn by inverse transform sampling of the exponential distribution and
/// clamped to the configured interval bounds. While spiking, the multiplier
/// ramps linearly up to the spike factor and decays exponentially back to 1.0.
///
/// A manual spike can be injected at any time. It replaces whatever spike is
/// active, uses a third of its duration for the ramp-up, and suppresses
/// automatic scheduling until it completes.
#[derive(Debug)]
pub struct PoissonSpike {
    cfg: PoissonConfig,
    lambda: f64,
    state: Mutex<SpikeState>,
}

#[derive(Debug)]
struct SpikeState {
    rng: SmallRng,
    phase: Phase,
    next_spike_at: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Spiking {
        start: Instant,
        peak: Instant,
        end: Instant,
        factor: f64,
        manual: bool,
    },
}

impl PoissonSpike {
    pub fn new(cfg: PoissonConfig) -> Self {
        Self::new_with_rng(cfg, SmallRng::from_os_rng())
    }

    fn new_with_rng(cfg: PoissonConfig, rng: SmallRng) -> Self {
        let lambda = cfg.effective_lambda();
        let mut state = SpikeState {
            rng,
            phase: Phase::Idle,
            next_spike_at: Instant::now(),
        };
        schedule_next(&mut state, &cfg, lambda, Instant::now());
        Self {
            cfg,
            lambda,
            state: Mutex::new(state),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Current multiplier; advances the state machine as a side effect.
    pub fn multiplier(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.lock();

        if let Phase::Spiking { end, .. } = state.phase
            && now >= end
        {
            state.phase = Phase::Idle;
            schedule_next(&mut state, &self.cfg, self.lambda, now);
        }

        if self.cfg.enabled
            && matches!(state.phase, Phase::Idle)
            && now >= state.next_spike_at
        {
            let peak = now + self.cfg.ramp_up;
            state.phase = Phase::Spiking {
                start: now,
                peak,
                end: peak + self.cfg.ramp_down,
                factor: self.cfg.spike_factor,
                manual: false,
            };
        }

        match state.phase {
            Phase::Idle => 1.0,
            Phase::Spiking {
                start,
                peak,
                end,
                factor,
                ..
            } => envelope(now, start, peak, end, factor),
        }
    }

    /// Injects a manual spike, replacing any active automatic one.
    ///
    /// `factor` falls back to the configured spike factor, `duration` to
    /// `ramp_up + ramp_down`. A third of the duration is spent ramping up.
    pub fn trigger_manual(&self, factor: Option<f64>, duration: Option<Duration>) {
        let factor = factor
            .filter(|f| *f > 0.0)
            .unwrap_or(self.cfg.spike_factor);
        let duration = duration
            .filter(|d| *d > Duration::ZERO)
            .unwrap_or(self.cfg.ramp_up + self.cfg.ramp_down);

        let now = Instant::now();
        let mut state = self.lock();
        state.phase = Phase::Spiking {
            start: now,
            peak: now + duration / 3,
            end: now + duration,
            factor,
            manual: true,
        };
    }

    pub fn is_spiking(&self) -> bool {
        let now = Instant::now();
        match self.lock().phase {
            Phase::Idle => false,
            Phase::Spiking { end, .. } => now < end,
        }
    }

    pub fn is_manual_spike(&self) -> bool {
        let now = Instant::now();
        match self.lock().phase {
            Phase::Idle => false,
            Phase::Spiking { end, manual, .. } => manual && now < end,
        }
    }

    /// Time until the next automatic spike; zero while one is active.
    pub fn next_spike_in(&self) -> Duration {
        let now = Instant::now();
        let state = self.lock();
        match state.phase {
            Phase::Spiking { end, .. } if now < end => Duration::ZERO,
            _ => state.next_spike_at.saturating_duration_since(now),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpikeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn schedule_next(state: &mut SpikeState, cfg: &PoissonConfig, lambda: f64, now: Instant) {
    let interval = sample_interval(&mut state.rng, lambda, cfg.min_interval, cfg.max_interval);
    state.next_spike_at = now + interval;
}

/// Inverse transform sampling of the exponential distribution, clamped to the
/// configured interval bounds.
fn sample_interval(
    rng: &mut SmallRng,
    lambda: f64,
    min_interval: Duration,
    max_interval: Duration,
) -> Duration {
    let u = rng.random::<f64>().max(1e-10);
    let mut interval = -u.ln() / lambda;

    let min_secs = min_interval.as_secs_f64();
    let max_secs = max_interval.as_secs_f64();
    if interval < min_secs {
        interval = min_secs;
    }
    if max_secs > 0.0 && interval > max_secs {
        interval = max_secs;
    }

    Duration::from_secs_f64(interval)
}

fn envelope(now: Instant, start: Instant, peak: Instant, end: Instant, factor: f64) -> f64 {
    if now < peak {
        let total = peak.duration_since(start).as_secs_f64();
        let total = if total == 0.0 { 1.0 } else { total };
        let progress = now.duration_since(start).as_secs_f64() / total;
        return 1.0 + (factor - 1.0) * progress;
    }

    let total = end.duration_since(peak).as_secs_f64();
    let total = if total == 0.0 { 1.0 } else { total };
    let progress = now.duration_since(peak).as_secs_f64() / total;
    1.0 + (factor - 1.0) * (-3.0 * progress).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn spike_config(lambda: f64) -> PoissonConfig {
        PoissonConfig {
            enabled: true,
            lambda,
            interval: None,
            spike_factor: 3.0,
            min_interval: Duration::ZERO,
            max_interval: Duration::from_secs(1_000_000),
            ramp_up: Duration::from_secs(1),
            ramp_down: Duration::from_secs(2),
        }
    }

    fn seeded(cfg: PoissonConfig, seed: u64) -> PoissonSpike {
        PoissonSpike::new_with_rng(cfg, SmallRng::seed_from_u64(seed))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disabled_without_manual_is_identity() {
        time::pause();
        let spike = seeded(
            PoissonConfig {
                enabled: false,
                ..spike_config(1.0)
            },
            1,
        );
        for _ in 0..10 {
            assert_eq!(spike.multiplier(), 1.0);
            assert!(!spike.is_spiking());
            time::advance(Duration::from_secs(5)).await;
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn envelope_matches_ramp_and_decay() {
        time::pause();
        let spike = seeded(spike_config(1.0), 2);

        // Force a spike to start right now.
        spike.trigger_manual(Some(3.0), Some(Duration::from_secs(3)));
        // A manual 3 s spike peaks at 1 s, same shape as ramp_up=1s ramp_down=2s.
        let expectations = [
            (Duration::ZERO, 1.0),
            (Duration::from_millis(500), 2.0),
            (Duration::from_secs(1), 3.0),
            (Duration::from_secs(2), 1.0 + 2.0 * (-1.5f64).exp()),
            (Duration::from_secs(3), 1.0),
        ];

        let mut elapsed = Duration::ZERO;
        for (at, expected) in expectations {
            time::advance(at - elapsed).await;
            elapsed = at;
            let got = spike.multiplier();
            let tolerance = (expected * 0.01).max(1e-9);
            assert!(
                (got - expected).abs() <= tolerance,
                "t={at:?}: got {got}, expected {expected}"
            );
        }
        assert!(!spike.is_spiking());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn automatic_spike_starts_after_deadline() {
        time::pause();
        let spike = seeded(spike_config(1.0), 3);
        let wait = spike.next_spike_in();
        assert!(wait > Duration::ZERO);

        time::advance(wait + Duration::from_millis(1)).await;
        let m = spike.multiplier();
        assert!(spike.is_spiking());
        assert!(!spike.is_manual_spike());
        assert!(m >= 1.0);
        assert_eq!(spike.next_spike_in(), Duration::ZERO);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn spike_ends_and_reschedules() {
        time::pause();
        let spike = seeded(spike_config(1.0), 4);
        time::advance(spike.next_spike_in() + Duration::from_millis(1)).await;
        spike.multiplier();
        assert!(spike.is_spiking());

        // Past ramp_up + ramp_down the spike must be over and a new deadline set.
        time::advance(Duration::from_secs(4)).await;
        assert_eq!(spike.multiplier(), 1.0);
        assert!(!spike.is_spiking());
        assert!(spike.next_spike_in() > Duration::ZERO);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manual_spike_overrides_and_suppresses_automatic() {
        time::pause();
        let spike = seeded(spike_config(1000.0), 5);

        spike.trigger_manual(Some(4.0), Some(Duration::from_secs(3)));
        assert!(spike.is_manual_spike());

        // With lambda=1000 an automatic spike would fire immediately, but the
        // manual one owns the state until it completes.
        time::advance(Duration::from_secs(1)).await;
        let got = spike.multiplier();
        assert!((got - 4.0).abs() < 0.05, "peak multiplier {got}");
        assert!(spike.is_manual_spike());

        time::advance(Duration::from_secs(2)).await;
        spike.multiplier();
        assert!(!spike.is_manual_spike());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn at_most_one_spike_at_a_time() {
        time::pause();
        let spike = seeded(spike_config(1000.0), 6);

        let mut transitions = 0;
        let mut last = spike.is_spiking();
        for _ in 0..3_000 {
            time::advance(Duration::from_millis(10)).await;
            spike.multiplier();
            let now_spiking = spike.is_spiking();
            if now_spiking != last {
                transitions += 1;
                last = now_spiking;
            }
        }
        // 30 s with a 3 s envelope per spike: transitions alternate start/stop,
        // never overlapping, so the count stays near 2 * (30 / 3).
        assert!(transitions <= 22, "transitions {transitions}");
    }

    #[test]
    fn interarrival_sampling_is_exponential() {
        let mut rng = SmallRng::seed_from_u64(7);
        let n = 5_000;
        let mut sum = 0.0;
        let mut below_median = 0usize;
        for _ in 0..n {
            let d = sample_interval(
                &mut rng,
                1.0,
                Duration::ZERO,
                Duration::from_secs(1_000_000),
            );
            let secs = d.as_secs_f64();
            sum += secs;
            if secs < std::f64::consts::LN_2 {
                below_median += 1;
            }
        }

        let mean = sum / n as f64;
        assert!((mean - 1.0).abs() < 0.1, "mean {mean}");

        // For Exp(1) the median is ln 2; half the mass sits below it.
        let frac = below_median as f64 / n as f64;
        assert!((frac - 0.5).abs() < 0.05, "median fraction {frac}");
    }

    #[test]
    fn sampling_respects_clamps() {
        let mut rng = SmallRng::seed_from_u64(8);
        for _ in 0..1_000 {
            let d = sample_interval(
                &mut rng,
                1.0,
                Duration::from_secs(2),
                Duration::from_secs(5),
            );
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(5));
        }
    }
}
