use std::env;
use std::process::Command;

/// 编译期嵌入构建信息，供 --version-info 输出
fn main() {
    let build_time = chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();

    let values = [
        ("BUILD_TIME", Some(build_time)),
        ("GIT_HASH", command_output("git", &["rev-parse", "--short", "HEAD"])),
        ("GIT_BRANCH", command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"])),
        ("RUST_VERSION", command_output("rustc", &["--version"])),
        ("TARGET_ARCH", env::var("TARGET").ok()),
        ("BUILD_PROFILE", env::var("PROFILE").ok()),
    ];

    for (key, value) in values {
        let value = value.unwrap_or_else(|| "unknown".to_string());
        println!("cargo:rustc-env={}={}", key, value);
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
