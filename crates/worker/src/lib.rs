#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Meterline background worker
//!
//! Runs the billing cycle, drains the provider notification queue and
//! prunes settled queue rows on cron schedules.

pub mod config;
pub mod error;
pub mod jobs;
pub mod webhook_processor;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
