use std::process::Command;

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout).ok()
            } else {
                None
            }
        })
}

fn main() {
    // Capture git commit hash for version info
    let git_commit = command_stdout("git", &["rev-parse", "--short", "HEAD"])
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // Check if working directory is dirty (has uncommitted changes)
    let is_dirty = command_stdout("git", &["status", "--porcelain"])
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);

    let git_commit_with_dirty = if is_dirty {
        format!("{}-dirty", git_commit)
    } else {
        git_commit
    };

    println!("cargo:rustc-env=GIT_COMMIT={}", git_commit_with_dirty);

    // Extract just the version number (e.g., "1.85.0" from "rustc 1.85.0 (4d91de4e4 2025-02-17)")
    let rustc_version = command_stdout("rustc", &["--version"])
        .and_then(|s| s.split_whitespace().nth(1).map(|v| v.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=RUSTC_VERSION={}", rustc_version);

    // Re-run build script if git HEAD changes
    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=../.git/refs");
}
