//! Stamps the commit, build time and target into the worker binary.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    let commit = match git(&["rev-parse", "--short=8", "HEAD"]) {
        Some(hash) if git(&["status", "--porcelain"]).is_some_and(|s| !s.is_empty()) => {
            format!("{}-dirty", hash)
        }
        Some(hash) => hash,
        None => "unknown".to_string(),
    };
    let built_at = chrono::Utc::now().format("%Y-%m-%d %H:%M UTC");
    let cargo_env = |key: &str| env::var(key).unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=LINKGEN_COMMIT={}", commit);
    println!("cargo:rustc-env=LINKGEN_BUILT_AT={}", built_at);
    println!("cargo:rustc-env=LINKGEN_TARGET={}", cargo_env("TARGET"));
    println!("cargo:rustc-env=LINKGEN_PROFILE={}", cargo_env("PROFILE"));
}

/// Trimmed stdout of a git command, if it ran and succeeded
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
