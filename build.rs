//! Build script: pre-flight checks for GPU feature flags.
//!
//! Verifies that required toolkits are installed before whisper-rs-sys
//! tries to compile, so the user sees an actionable message instead of a
//! wall of nvcc errors.

use std::process::Command;

fn main() {
    if std::env::var_os("CARGO_FEATURE_CUDA").is_some() {
        check_cuda();
    }
    if std::env::var_os("CARGO_FEATURE_VULKAN").is_some() {
        check_vulkan();
    }
}

fn check_cuda() {
    let output = Command::new("nvcc").arg("--version").output();
    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            if let Some((major, minor)) = parse_cuda_version(&text) {
                println!("cargo::warning=building with CUDA toolkit {}.{}", major, minor);
            } else {
                println!("cargo::warning=building with CUDA (version unknown)");
            }
        }
        _ => {
            panic!(
                "\n`nvcc` not found - the CUDA toolkit is not installed.\n\
                 Install it from https://developer.nvidia.com/cuda-downloads\n\
                 or build without CUDA: cargo build --release\n"
            );
        }
    }
}

fn check_vulkan() {
    let found = Command::new("pkg-config")
        .args(["--exists", "vulkan"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !found {
        println!(
            "cargo::warning=vulkan headers not found via pkg-config; \
             the whisper-rs vulkan build may fail"
        );
    }
}

/// Parse "release X.Y" from nvcc --version output.
fn parse_cuda_version(text: &str) -> Option<(u32, u32)> {
    // nvcc output: "Cuda compilation tools, release 12.4, V12.4.131"
    let release_pos = text.find("release ")?;
    let after = &text[release_pos + 8..];
    let comma = after.find(',')?;
    let mut parts = after[..comma].split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
