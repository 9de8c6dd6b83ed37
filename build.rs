//! Build script for cliprdr-x11-bridge
//!
//! Sets compile-time environment variables for build identification.

use std::process::Command;

fn capture(program: &str, args: &[&str], fallback: &str) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn main() {
    println!("cargo:rustc-env=BUILD_DATE={}", capture("date", &["+%Y-%m-%d"], "unknown"));
    println!("cargo:rustc-env=GIT_HASH={}", capture("git", &["rev-parse", "--short", "HEAD"], "unknown"));

    // Re-run if git HEAD changes
    println!("cargo:rerun-if-changed=.git/HEAD");
}
