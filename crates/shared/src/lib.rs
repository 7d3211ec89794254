//! Meterline Shared Types and Utilities
//!
//! Status enums, money helpers and database plumbing shared by the billing
//! engine and the worker.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;
pub mod error;
pub mod money;
pub mod types;

pub use db::*;
pub use error::*;
pub use money::*;
pub use types::*;
