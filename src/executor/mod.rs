//! Task executor module
//!
//! Handles the task execution lifecycle:
//! - Deduplicating tasks from the push and poll channels
//! - Dispatching to the execution host (direct or relay)
//! - Correlating relayed answers
//! - Tracking in-flight requests

mod dedup;
mod dispatch;
mod relay;
mod runner;
mod state;

pub use dispatch::*;
pub use relay::*;
pub use runner::*;
pub use state::*;
