//! Host platform detection.

#[cfg(any(target_os = "macos", target_os = "linux"))]
use std::process::Command;

use bk_core::{Arch, Error, PlatformFingerprint};

/// The fingerprint of the running host, or the `--platform` override.
pub fn resolve_platform(tag: Option<&str>) -> Result<PlatformFingerprint, Error> {
    match tag {
        Some(tag) => tag.parse(),
        None => host_platform(),
    }
}

fn host_arch() -> Result<Arch, Error> {
    if cfg!(target_arch = "aarch64") {
        Ok(Arch::Arm64)
    } else if cfg!(target_arch = "x86_64") {
        Ok(Arch::X86_64)
    } else {
        Err(Error::Config {
            message: format!(
                "unsupported architecture '{}'; pass --platform",
                std::env::consts::ARCH
            ),
        })
    }
}

#[cfg(target_os = "macos")]
fn host_platform() -> Result<PlatformFingerprint, Error> {
    let arch = host_arch()?;
    let version = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .unwrap_or_default();
    let codename = macos_codename(version.trim()).ok_or_else(|| Error::Config {
        message: format!("unrecognized macOS version '{}'; pass --platform", version.trim()),
    })?;
    Ok(PlatformFingerprint::macos(arch, codename))
}

#[cfg(target_os = "linux")]
fn host_platform() -> Result<PlatformFingerprint, Error> {
    let platform = PlatformFingerprint::linux(host_arch()?);
    if cfg!(target_env = "musl") {
        return Ok(platform.with_abi("musl"));
    }
    // Look for a musl loader when running a glibc build on a musl host
    let musl_host = Command::new("ldd")
        .arg("--version")
        .output()
        .map(|out| {
            let text = String::from_utf8_lossy(&out.stdout).to_lowercase()
                + &String::from_utf8_lossy(&out.stderr).to_lowercase();
            text.contains("musl")
        })
        .unwrap_or(false);
    Ok(if musl_host {
        platform.with_abi("musl")
    } else {
        platform
    })
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn host_platform() -> Result<PlatformFingerprint, Error> {
    let _ = host_arch()?;
    Err(Error::Config {
        message: format!("unsupported OS '{}'; pass --platform", std::env::consts::OS),
    })
}

/// Bottle codename for a macOS product version such as `14.5`.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn macos_codename(version: &str) -> Option<&'static str> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    match (major, minor) {
        (10, 15) => Some("catalina"),
        (11, _) => Some("big_sur"),
        (12, _) => Some("monterey"),
        (13, _) => Some("ventura"),
        (14, _) => Some("sonoma"),
        (15, _) => Some("sequoia"),
        (26, _) => Some("tahoe"),
        _ => None,
    }
}
