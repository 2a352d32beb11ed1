//! Watch catch-up
//!
//! Tracks the series a media library's users are watching and keeps their
//! next episodes downloaded, spending search attempts only when an episode
//! is likely to be available.

pub mod catchup;
pub mod config;
pub mod db;
pub mod jobs;
pub mod services;
pub mod telemetry;

pub use catchup::{RunOutcome, Scheduler};
pub use config::CatchupConfig;
