// Trigger scheduler: owns the trigger index, routes inbound events to
// deployed workflows, and drives time-based firings.

pub mod api;
pub mod config;
pub mod cron;
pub mod engine_client;
pub mod error;
pub mod index;
pub mod service;
pub mod signature;

pub use config::Config;
pub use cron::CronDriver;
pub use engine_client::{ExecutionDispatcher, HttpEngineClient, RecordingDispatcher};
pub use error::{Result, SchedulerError};
pub use service::SchedulerService;
