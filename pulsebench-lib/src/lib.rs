#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod analyzer;
pub mod client;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod pattern;
pub mod pool;
pub mod runner;
