//! Protocol module for coordinator and host communication
//!
//! Defines the message types for the coordinator's HTTP/SSE surface and
//! the host correlation protocol used by the relay strategy.

mod messages;

pub use messages::*;
