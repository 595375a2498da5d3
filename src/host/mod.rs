//! Execution host module
//!
//! Handles the browser tab that runs the link capability:
//! - Locating or provisioning the tab (single-flight)
//! - Readiness and settle waits
//! - The Chrome DevTools Protocol adapter

mod cdp;
mod manager;
mod traits;

#[cfg(test)]
pub mod mock;

pub use cdp::*;
pub use manager::*;
pub use traits::*;
