// Public contracts for Loomline
// This crate defines workflow/execution/trigger DTOs, the error taxonomy,
// and the log query types shared by the scheduler and the engine.

pub mod common;
pub mod error;
pub mod execution;
pub mod logs;
pub mod trigger;
pub mod workflow;

pub use common::*;
pub use error::*;
pub use execution::*;
pub use logs::*;
pub use trigger::*;
pub use workflow::*;
