//! Platform fingerprints and their bottle tags.
//!
//! A fingerprint is supplied by the caller; nothing in here inspects the
//! running host. Tags follow the bottle naming scheme used by formula
//! manifests: `arm64_sonoma`, `sonoma` (Intel macOS), `x86_64_linux`,
//! `arm64_linux`, plus the universal `all`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Tag of platform-independent bottles.
pub const UNIVERSAL_TAG: &str = "all";

/// macOS release codenames, oldest first.
const MACOS_CODENAMES: &[&str] = &[
    "catalina", "big_sur", "monterey", "ventura", "sonoma", "sequoia", "tahoe",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Macos,
    Linux,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Macos => f.write_str("macos"),
            OsFamily::Linux => f.write_str("linux"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm64,
    X86_64,
}

impl Arch {
    fn as_str(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X86_64 => "x86_64",
        }
    }
}

/// (OS family, OS version, architecture, ABI variant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformFingerprint {
    pub os: OsFamily,
    /// macOS codename such as `sonoma`; unused on Linux.
    pub os_version: Option<String>,
    pub arch: Arch,
    /// libc flavour on Linux; `None` means the default glibc build.
    pub abi: Option<String>,
}

impl PlatformFingerprint {
    pub fn macos(arch: Arch, codename: &str) -> Self {
        Self {
            os: OsFamily::Macos,
            os_version: Some(codename.to_string()),
            arch,
            abi: None,
        }
    }

    pub fn linux(arch: Arch) -> Self {
        Self {
            os: OsFamily::Linux,
            os_version: None,
            arch,
            abi: None,
        }
    }

    pub fn with_abi(mut self, abi: &str) -> Self {
        self.abi = Some(abi.to_string());
        self
    }

    /// The exact bottle tag for this fingerprint.
    pub fn tag(&self) -> String {
        match self.os {
            OsFamily::Macos => {
                let codename = self.os_version.as_deref().unwrap_or("unknown");
                match self.arch {
                    Arch::Arm64 => format!("arm64_{codename}"),
                    Arch::X86_64 => codename.to_string(),
                }
            }
            OsFamily::Linux => match self.abi.as_deref() {
                None => format!("{}_linux", self.arch.as_str()),
                Some(abi) => format!("{}_linux_{abi}", self.arch.as_str()),
            },
        }
    }

    /// Tags whose bottles can run on this platform, most specific first.
    ///
    /// On macOS a bottle built for an older release of the same architecture
    /// runs on newer releases, so older codenames follow the exact tag,
    /// newest first. Linux bottles only match their own architecture and ABI.
    /// The universal tag is always last.
    pub fn candidate_tags(&self) -> Vec<String> {
        let mut tags = vec![self.tag()];

        if self.os == OsFamily::Macos
            && let Some(current) = self.os_version.as_deref()
            && let Some(idx) = MACOS_CODENAMES.iter().position(|c| *c == current)
        {
            for older in MACOS_CODENAMES[..idx].iter().rev() {
                let fallback = Self::macos(self.arch, older);
                tags.push(fallback.tag());
            }
        }

        tags.push(UNIVERSAL_TAG.to_string());
        tags
    }
}

impl fmt::Display for PlatformFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl FromStr for PlatformFingerprint {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Config {
            message: format!("unrecognized platform tag '{tag}'"),
        };

        if let Some(rest) = tag.strip_prefix("arm64_") {
            return parse_os_part(rest, Arch::Arm64).ok_or_else(invalid);
        }
        if let Some(rest) = tag.strip_prefix("x86_64_") {
            return parse_os_part(rest, Arch::X86_64).ok_or_else(invalid);
        }
        if MACOS_CODENAMES.contains(&tag) {
            return Ok(Self::macos(Arch::X86_64, tag));
        }
        Err(invalid())
    }
}

fn parse_os_part(rest: &str, arch: Arch) -> Option<PlatformFingerprint> {
    if rest == "linux" {
        return Some(PlatformFingerprint::linux(arch));
    }
    if let Some(abi) = rest.strip_prefix("linux_") {
        return Some(PlatformFingerprint::linux(arch).with_abi(abi));
    }
    if arch == Arch::Arm64 && MACOS_CODENAMES.contains(&rest) {
        return Some(PlatformFingerprint::macos(arch, rest));
    }
    None
}

impl TryFrom<String> for PlatformFingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlatformFingerprint> for String {
    fn from(value: PlatformFingerprint) -> Self {
        value.tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_parse() {
        for tag in ["arm64_sonoma", "sonoma", "x86_64_linux", "arm64_linux", "x86_64_linux_musl"] {
            let platform: PlatformFingerprint = tag.parse().unwrap();
            assert_eq!(platform.tag(), tag);
        }
    }

    #[test]
    fn rejects_unknown_tags() {
        assert!("riscv64_linux".parse::<PlatformFingerprint>().is_err());
        assert!("all".parse::<PlatformFingerprint>().is_err());
        assert!("x86_64_sonoma".parse::<PlatformFingerprint>().is_err());
    }

    #[test]
    fn macos_candidates_walk_older_releases_newest_first() {
        let platform = PlatformFingerprint::macos(Arch::Arm64, "sonoma");
        assert_eq!(
            platform.candidate_tags(),
            vec![
                "arm64_sonoma",
                "arm64_ventura",
                "arm64_monterey",
                "arm64_big_sur",
                "arm64_catalina",
                "all"
            ]
        );
    }

    #[test]
    fn intel_macos_candidates_use_bare_codenames() {
        let platform = PlatformFingerprint::macos(Arch::X86_64, "monterey");
        assert_eq!(
            platform.candidate_tags(),
            vec!["monterey", "big_sur", "catalina", "all"]
        );
    }

    #[test]
    fn linux_candidates_never_cross_arch_or_abi() {
        let glibc = PlatformFingerprint::linux(Arch::X86_64);
        assert_eq!(glibc.candidate_tags(), vec!["x86_64_linux", "all"]);

        let musl = PlatformFingerprint::linux(Arch::Arm64).with_abi("musl");
        assert_eq!(musl.candidate_tags(), vec!["arm64_linux_musl", "all"]);
    }

    #[test]
    fn deserializes_from_tag_string() {
        let platform: PlatformFingerprint = serde_json::from_str("\"arm64_ventura\"").unwrap();
        assert_eq!(platform, PlatformFingerprint::macos(Arch::Arm64, "ventura"));
    }
}
