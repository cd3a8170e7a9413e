//! Version comparison for formula versions.
//!
//! Formula versions are vendor-defined strings, so comparison is lenient:
//! - Dotted components compare numerically: `1.10.0 > 1.9.0`
//! - Missing trailing components sort first: `1.0 < 1.0.1`
//! - A prerelease sorts before its release: `1.0.0-beta < 1.0.0`
//! - `HEAD` builds sort above every released version
//!
//! A [`PkgVersion`] pairs a version with the formula revision and is what
//! install prefixes are keyed by (`7.7.2-4`).

use std::cmp::Ordering;
use std::fmt;

/// A parsed formula version
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<Component>,
    prerelease: Vec<Component>,
    head: bool,
    original: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Component {
    // Variant order matters: numeric sorts before alpha ("1" < "beta")
    Numeric(u64),
    Alpha(String),
}

impl Version {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let original = s.to_string();

        if s.starts_with("HEAD") {
            return Version {
                components: Vec::new(),
                prerelease: Vec::new(),
                head: true,
                original,
            };
        }

        let (main, prerelease) = match s.split_once('-') {
            Some((main, pre)) => (main, split_components(pre)),
            None => (s, Vec::new()),
        };

        Version {
            components: split_components(main),
            prerelease,
            head: false,
            original,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn is_head(&self) -> bool {
        self.head
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.head, other.head) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }

        let main = compare_components(&self.components, &other.components);
        if main != Ordering::Equal {
            return main;
        }

        match (self.prerelease.is_empty(), other.prerelease.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_components(&self.prerelease, &other.prerelease),
        }
    }
}

/// Trailing zero components are insignificant: `1.0 == 1.0.0`.
fn compare_components(a: &[Component], b: &[Component]) -> Ordering {
    let zero = Component::Numeric(0);
    let len = a.len().max(b.len());

    for i in 0..len {
        let left = a.get(i);
        let right = b.get(i);
        let ord = match (left, right) {
            (Some(l), Some(r)) => l.cmp(r),
            (Some(l), None) if *l == zero => Ordering::Equal,
            (None, Some(r)) if *r == zero => Ordering::Equal,
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

/// Split on `.`, `_` and `+`, and at every digit/letter boundary
/// (`1.2b3` -> `1`, `2`, `b`, `3`).
fn split_components(s: &str) -> Vec<Component> {
    let mut components = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, components: &mut Vec<Component>| {
        if current.is_empty() {
            return;
        }
        let component = match current.parse::<u64>() {
            Ok(n) => Component::Numeric(n),
            Err(_) => Component::Alpha(current.to_lowercase()),
        };
        components.push(component);
        current.clear();
    };

    for c in s.chars() {
        if !c.is_alphanumeric() {
            flush(&mut current, &mut components);
            continue;
        }
        let boundary = current
            .chars()
            .last()
            .is_some_and(|last| last.is_ascii_digit() != c.is_ascii_digit());
        if boundary {
            flush(&mut current, &mut components);
        }
        current.push(c);
    }
    flush(&mut current, &mut components);

    components
}

/// A version plus the formula revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PkgVersion {
    pub version: Version,
    pub revision: u32,
}

impl PkgVersion {
    pub fn new(version: &str, revision: u32) -> Self {
        Self {
            version: Version::parse(version),
            revision,
        }
    }

    /// Directory name bottles unpack to: `1.2.3`, or `1.2.3_4` for revision 4.
    ///
    /// Not unique (`1.0_2` rev 0 and `1.0` rev 2 agree), so never key
    /// anything by it.
    pub fn keg_name(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.to_string()
        }
    }
}

/// Renders as the install directory name `{version}-{revision}`.
///
/// The revision is always written and never contains `-`, so splitting at
/// the last `-` recovers the pair.
impl fmt::Display for PkgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.version, self.revision)
    }
}

/// A dependency's version requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReq {
    Exact(Version),
    AtLeast(Version),
}

impl VersionReq {
    /// Parse `"1.2"` / `"=1.2"` as exact and `">=1.2"` as a lower bound.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix(">=") {
            VersionReq::AtLeast(Version::parse(rest))
        } else {
            VersionReq::Exact(Version::parse(s.trim_start_matches('=')))
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionReq::Exact(v) => version == v,
            VersionReq::AtLeast(v) => version >= v,
        }
    }

    /// Whether some version could satisfy both requirements.
    pub fn is_compatible_with(&self, other: &VersionReq) -> bool {
        match (self, other) {
            (VersionReq::Exact(a), VersionReq::Exact(b)) => a == b,
            (VersionReq::Exact(exact), VersionReq::AtLeast(min))
            | (VersionReq::AtLeast(min), VersionReq::Exact(exact)) => exact >= min,
            (VersionReq::AtLeast(_), VersionReq::AtLeast(_)) => true,
        }
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionReq::Exact(v) => write!(f, "={v}"),
            VersionReq::AtLeast(v) => write!(f, ">={v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_simple_versions() {
        assert!(Version::parse("1.0.0") < Version::parse("1.0.1"));
        assert!(Version::parse("1.0.0") < Version::parse("1.1.0"));
        assert!(Version::parse("1.9.0") < Version::parse("1.10.0"));
        assert!(Version::parse("2.1004.0") > Version::parse("2.999.9"));
    }

    #[test]
    fn trailing_zeros_are_insignificant() {
        assert_eq!(Version::parse("1.0"), Version::parse("1.0.0"));
        assert!(Version::parse("1.0") < Version::parse("1.0.1"));
    }

    #[test]
    fn prerelease_sorts_before_release() {
        assert!(Version::parse("1.0.0-beta") < Version::parse("1.0.0"));
        assert!(Version::parse("1.0.0-alpha") < Version::parse("1.0.0-beta"));
        assert!(Version::parse("1.0.0-rc1") < Version::parse("1.0.0-rc2"));
    }

    #[test]
    fn head_sorts_above_releases() {
        let head = Version::parse("HEAD-abc123");
        assert!(head.is_head());
        assert!(head > Version::parse("99.0"));
        assert_eq!(head.as_str(), "HEAD-abc123");
    }

    #[test]
    fn splits_letter_digit_boundaries() {
        assert!(Version::parse("1.1.1w") > Version::parse("1.1.1v"));
        assert!(Version::parse("9.4p1") < Version::parse("9.5p1"));
    }

    #[test]
    fn pkg_version_renders_revision_suffix() {
        assert_eq!(PkgVersion::new("7.7.2", 4).to_string(), "7.7.2-4");
        assert_eq!(PkgVersion::new("2.1004.0", 0).to_string(), "2.1004.0-0");
        assert_eq!(PkgVersion::new("7.7.2", 4).keg_name(), "7.7.2_4");
        assert_eq!(PkgVersion::new("2.1004.0", 0).keg_name(), "2.1004.0");
        assert!(PkgVersion::new("7.7.2", 3) < PkgVersion::new("7.7.2", 4));
        assert!(PkgVersion::new("7.7.2", 9) < PkgVersion::new("7.8.0", 0));
    }

    #[test]
    fn distinct_version_revision_pairs_render_distinctly() {
        let pairs = [("1.0_2", 0), ("1.0", 2), ("1.0-2", 0), ("1.0", 20), ("1.0-2", 1)];
        let rendered: std::collections::HashSet<String> = pairs
            .iter()
            .map(|(v, r)| PkgVersion::new(v, *r).to_string())
            .collect();
        assert_eq!(rendered.len(), pairs.len());
    }

    #[test]
    fn version_req_matching() {
        let v = Version::parse("3.2.1");
        assert!(VersionReq::parse("3.2.1").matches(&v));
        assert!(VersionReq::parse("=3.2.1").matches(&v));
        assert!(VersionReq::parse(">=3").matches(&v));
        assert!(!VersionReq::parse(">=3.3").matches(&v));
        assert!(!VersionReq::parse("3.2").matches(&v));
    }

    #[test]
    fn version_req_compatibility() {
        let exact = VersionReq::parse("=2.0");
        assert!(exact.is_compatible_with(&VersionReq::parse(">=1.5")));
        assert!(!exact.is_compatible_with(&VersionReq::parse(">=2.1")));
        assert!(!exact.is_compatible_with(&VersionReq::parse("1.9")));
        assert!(VersionReq::parse(">=1").is_compatible_with(&VersionReq::parse(">=9")));
    }
}
