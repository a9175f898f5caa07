use std::process::Command;

fn main() {
    // GIT_COMMIT feeds the version subcommand; without a git checkout the
    // binary reports "unknown".
    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string());

    if let Some(commit) = commit {
        println!("cargo:rustc-env=GIT_COMMIT={commit}");
    }

    println!("cargo:rerun-if-changed=build.rs");
}
