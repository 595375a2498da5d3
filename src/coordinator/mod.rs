//! Coordinator communication module
//!
//! Handles everything that talks to the coordinator:
//! - HTTP client and SSE decoding
//! - Push stream connection with watchdog and reconnect
//! - Fallback backlog polling
//! - Result reporting

mod client;
mod connector;
mod poller;
mod reporter;
mod sse;

#[cfg(test)]
pub mod mock;

pub use client::*;
pub use connector::*;
pub use poller::*;
pub use reporter::*;
