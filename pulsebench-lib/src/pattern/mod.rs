//! Traffic shaping: schedule, Poisson spikes and noise composed into a
//! time-varying target TPS.

mod engine;
mod noise;
mod poisson;
mod schedule;

pub use self::{
    engine::{PatternEngine, PatternStatus},
    noise::Noise,
    poisson::PoissonSpike,
    schedule::{Schedule, ScheduleInfo},
};
