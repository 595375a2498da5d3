//! Build identity
//!
//! `build.rs` stamps the commit and target into the binary. The coordinator
//! sees the identity as the HTTP user agent; `version` prints it together
//! with the delivery timings an unconfigured worker runs with.

use std::fmt;
use std::fmt::Write as _;

use crate::config::WorkerConfig;

/// Identity stamped in at compile time
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    /// Short commit hash, suffixed with `-dirty` for uncommitted trees
    pub commit: &'static str,
    pub built_at: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
}

pub const BUILD: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    commit: env!("LINKGEN_COMMIT"),
    built_at: env!("LINKGEN_BUILT_AT"),
    target: env!("LINKGEN_TARGET"),
    profile: env!("LINKGEN_PROFILE"),
};

impl BuildInfo {
    /// Version with build metadata, e.g. `0.1.0+1a2b3c4d`
    pub fn full_version(&self) -> String {
        format!("{}+{}", self.version, self.commit)
    }

    pub fn user_agent(&self) -> String {
        format!("linkgen-worker/{}", self.full_version())
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "linkgen-worker {}", self.full_version())?;
        writeln!(f, "Built {} for {} ({})", self.built_at, self.target, self.profile)
    }
}

/// Build identity followed by the timings of `defaults`
fn describe(build: &BuildInfo, defaults: &WorkerConfig) -> String {
    let secs = |ms: u64| ms as f64 / 1000.0;
    let coordinator = &defaults.coordinator;
    let executor = &defaults.executor;

    let mut out = build.to_string();
    let _ = writeln!(out);
    let _ = writeln!(out, "Delivery defaults:");
    let _ = writeln!(out, "  Coordinator:       {}", coordinator.url);
    let _ = writeln!(
        out,
        "  Watchdog:          {}s silence, checked every {}s",
        secs(coordinator.watchdog_silence_ms),
        secs(coordinator.watchdog_check_ms)
    );
    let _ = writeln!(out, "  Reconnect after:   {}s", secs(coordinator.reconnect_delay_ms));
    let _ = writeln!(out, "  Poll every:        {}s", secs(defaults.poller.interval_ms));
    let _ = writeln!(
        out,
        "  Response timeout:  {}s ({} retry, {}s settle)",
        secs(executor.response_timeout_ms),
        executor.max_transport_retries,
        secs(executor.retry_settle_ms)
    );
    let _ = writeln!(out, "  Keep-alive:        {}s", secs(defaults.lifecycle.keepalive_interval_ms));
    out
}

pub fn print_version() {
    print!("{}", describe(&BUILD, &WorkerConfig::default()));
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: BuildInfo = BuildInfo {
        version: "0.1.0",
        commit: "1a2b3c4d-dirty",
        built_at: "2026-01-01 00:00 UTC",
        target: "x86_64-unknown-linux-gnu",
        profile: "release",
    };

    #[test]
    fn test_full_version_and_user_agent() {
        assert_eq!(SAMPLE.full_version(), "0.1.0+1a2b3c4d-dirty");
        assert_eq!(SAMPLE.user_agent(), "linkgen-worker/0.1.0+1a2b3c4d-dirty");

        assert!(BUILD.full_version().starts_with(BUILD.version));
        assert!(!BUILD.commit.is_empty());
    }

    #[test]
    fn test_describe_lists_delivery_timings() {
        let text = describe(&SAMPLE, &WorkerConfig::default());

        assert!(text.starts_with("linkgen-worker 0.1.0+1a2b3c4d-dirty\n"));
        assert!(text.contains("for x86_64-unknown-linux-gnu (release)"));
        assert!(text.contains("40s silence, checked every 10s"));
        assert!(text.contains("Reconnect after:   5s"));
        assert!(text.contains("Response timeout:  15s (1 retry, 3s settle)"));
        assert!(text.contains("Keep-alive:        15s"));
    }
}
