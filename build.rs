use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let commit = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let built = chrono::Utc::now().format("%Y-%m-%d");

    // e.g. `0.1.0 (3f2c1ab 2026-10-19)`
    println!(
        "cargo:rustc-env=MERIDIAN_VERSION={} ({} {})",
        env!("CARGO_PKG_VERSION"),
        commit,
        built
    );
    println!("cargo:rerun-if-changed=.git/HEAD");
}
