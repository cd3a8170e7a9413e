use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use crate::platform::OsFamily;
use crate::version::{PkgVersion, Version, VersionReq};
use crate::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Formula {
    pub name: String,
    pub version: String,
    /// Bumped when the same version is rebuilt; part of the install prefix.
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    /// Source archive, used when no bottle matches the platform
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub bottle: BottleTable,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub install_steps: Vec<InstallStep>,
    #[serde(default)]
    pub test_steps: Vec<TestStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSpec {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BottleTable {
    /// Base URL bottles are served from when a file has no explicit URL
    #[serde(default)]
    pub root_url: Option<String>,
    #[serde(default)]
    pub rebuild: u32,
    /// Platform tag -> bottle file
    #[serde(default)]
    pub files: BTreeMap<String, BottleFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BottleFile {
    pub sha256: String,
    #[serde(default)]
    pub cellar: Cellar,
    #[serde(default)]
    pub url: Option<String>,
}

/// Where a bottle may be poured.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Cellar {
    /// Relocatable into any install root
    #[default]
    Any,
    /// Contains no install-root references at all
    AnySkipRelocation,
    /// Only valid under this exact install root
    Path(String),
}

impl From<String> for Cellar {
    fn from(value: String) -> Self {
        match value.trim_start_matches(':') {
            "any" => Cellar::Any,
            "any_skip_relocation" => Cellar::AnySkipRelocation,
            _ => Cellar::Path(value),
        }
    }
}

impl From<Cellar> for String {
    fn from(value: Cellar) -> Self {
        match value {
            Cellar::Any => "any".to_string(),
            Cellar::AnySkipRelocation => "any_skip_relocation".to_string(),
            Cellar::Path(path) => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Build,
    Runtime,
    Test,
    Recommended,
    Optional,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DependencyKind::Build => "build",
            DependencyKind::Runtime => "runtime",
            DependencyKind::Test => "test",
            DependencyKind::Recommended => "recommended",
            DependencyKind::Optional => "optional",
        };
        f.write_str(label)
    }
}

/// A dependency declaration. Manifests may write a bare name for a plain
/// runtime dependency or an object for anything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "DependencyRepr")]
pub struct Dependency {
    pub name: String,
    pub kinds: Vec<DependencyKind>,
    /// Requirement such as `"=1.2"` or `">=3"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Only applies on this OS family
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsFamily>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        kinds: Vec<DependencyKind>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        os: Option<OsFamily>,
    },
}

impl From<DependencyRepr> for Dependency {
    fn from(repr: DependencyRepr) -> Self {
        match repr {
            DependencyRepr::Name(name) => Dependency::runtime(&name),
            DependencyRepr::Full {
                name,
                mut kinds,
                version,
                os,
            } => {
                if kinds.is_empty() {
                    kinds.push(DependencyKind::Runtime);
                }
                Dependency {
                    name,
                    kinds,
                    version,
                    os,
                }
            }
        }
    }
}

impl Dependency {
    pub fn new(name: &str, kinds: &[DependencyKind]) -> Self {
        Self {
            name: name.to_string(),
            kinds: kinds.to_vec(),
            version: None,
            os: None,
        }
    }

    pub fn runtime(name: &str) -> Self {
        Self::new(name, &[DependencyKind::Runtime])
    }

    pub fn build(name: &str) -> Self {
        Self::new(name, &[DependencyKind::Build])
    }

    pub fn has_kind(&self, kind: DependencyKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn applies_to(&self, os: OsFamily) -> bool {
        self.os.is_none_or(|only| only == os)
    }

    pub fn requirement(&self) -> Option<VersionReq> {
        self.version.as_deref().map(VersionReq::parse)
    }
}

/// An external command with its arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the step's base directory
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra variables layered over the controlled environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkScope {
    /// `<shared_bin>/<link>` pointing into the prefix
    #[default]
    SharedBin,
    /// `<prefix>/<link>` pointing elsewhere inside the prefix
    Prefix,
}

/// One step of an install procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallStep {
    /// Download an extra verified file into the work directory
    Fetch {
        url: String,
        sha256: String,
        dest: String,
    },
    /// Extract an archive that lives in the work directory
    Unpack {
        archive: String,
        #[serde(default)]
        dest: Option<String>,
    },
    Run(CommandSpec),
    /// `target` is relative to the prefix
    Symlink {
        target: String,
        link: String,
        #[serde(default)]
        scope: LinkScope,
    },
    /// Write a file relative to the prefix
    WriteFile {
        path: String,
        contents: String,
        #[serde(default)]
        executable: bool,
    },
    /// Regex substitution over a file relative to the prefix.
    ///
    /// `replacement` may use `$1` style groups and placeholders. Matching
    /// nothing is an error, so a recipe notices when upstream changes.
    Replace {
        path: String,
        pattern: String,
        replacement: String,
    },
}

impl InstallStep {
    /// Steps that still apply after pouring a prebuilt bottle.
    pub fn applies_to_bottle(&self) -> bool {
        matches!(
            self,
            InstallStep::Symlink {
                scope: LinkScope::SharedBin,
                ..
            }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            InstallStep::Fetch { url, .. } => format!("fetch {url}"),
            InstallStep::Unpack { archive, .. } => format!("unpack {archive}"),
            InstallStep::Run(cmd) => cmd.to_string(),
            InstallStep::Symlink { target, link, .. } => format!("symlink {link} -> {target}"),
            InstallStep::WriteFile { path, .. } => format!("write {path}"),
            InstallStep::Replace { path, pattern, .. } => format!("replace /{pattern}/ in {path}"),
        }
    }
}

/// A check over a test step's captured stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assertion {
    Contains { value: String },
    /// Compared against the output with its trailing newline removed
    Equals { value: String },
    Matches { pattern: String },
    /// Compare a single output line (0-based)
    Line { index: usize, equals: String },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCommand {
    #[serde(flatten)]
    pub command: CommandSpec,
    #[serde(default = "default_true")]
    pub expect_success: bool,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestStep {
    Run(TestCommand),
    /// Write a fixture file into the test directory
    WriteFile { path: String, contents: String },
}

impl Formula {
    pub fn parsed_version(&self) -> Version {
        Version::parse(&self.version)
    }

    pub fn pkg_version(&self) -> PkgVersion {
        PkgVersion::new(&self.version, self.revision)
    }

    /// URL a bottle file is fetched from.
    pub fn bottle_url(&self, file: &BottleFile) -> Option<String> {
        if let Some(url) = &file.url {
            return Some(url.clone());
        }
        self.bottle.root_url.as_ref().map(|root| {
            format!(
                "{}/{}/blobs/sha256:{}",
                root.trim_end_matches('/'),
                self.name,
                file.sha256
            )
        })
    }

    /// Check the manifest for values the engine refuses to act on.
    ///
    /// Paths written by steps must stay inside their base directory and
    /// checksums must be SHA-256 hex digests.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Error::InvalidManifest {
            name: self.name.clone(),
            message,
        };

        if !is_path_segment(&self.name) {
            return Err(invalid(format!("'{}' is not a valid formula name", self.name)));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version is empty".to_string()));
        }
        if !is_path_segment(&self.version) || self.version.contains("..") {
            return Err(invalid(format!("'{}' is not a valid version", self.version)));
        }
        if let Some(source) = &self.source {
            check_sha256(&source.sha256).map_err(invalid)?;
        }
        for (tag, file) in &self.bottle.files {
            check_sha256(&file.sha256).map_err(|m| invalid(format!("bottle '{tag}': {m}")))?;
        }
        for dep in &self.dependencies {
            if dep.name == self.name {
                return Err(invalid("formula depends on itself".to_string()));
            }
        }

        for (idx, step) in self.install_steps.iter().enumerate() {
            let at = |m: String| invalid(format!("install step {}: {m}", idx + 1));
            match step {
                InstallStep::Fetch { sha256, dest, .. } => {
                    check_sha256(sha256).map_err(at)?;
                    check_relative(dest).map_err(at)?;
                }
                InstallStep::Unpack { archive, dest } => {
                    check_relative(archive).map_err(at)?;
                    if let Some(dest) = dest {
                        check_relative(dest).map_err(at)?;
                    }
                }
                InstallStep::Run(cmd) => {
                    if let Some(cwd) = &cmd.cwd {
                        check_relative(cwd).map_err(at)?;
                    }
                }
                InstallStep::Symlink { target, link, .. } => {
                    check_relative(target).map_err(at)?;
                    check_relative(link).map_err(at)?;
                }
                InstallStep::WriteFile { path, .. } => check_relative(path).map_err(at)?,
                InstallStep::Replace { path, pattern, .. } => {
                    check_relative(path).map_err(at)?;
                    regex::Regex::new(pattern)
                        .map_err(|e| at(format!("bad pattern '{pattern}': {e}")))?;
                }
            }
        }

        for (idx, step) in self.test_steps.iter().enumerate() {
            let at = |m: String| invalid(format!("test step {}: {m}", idx + 1));
            match step {
                TestStep::WriteFile { path, .. } => check_relative(path).map_err(at)?,
                TestStep::Run(test) => {
                    for assertion in &test.assertions {
                        if let Assertion::Matches { pattern } = assertion {
                            regex::Regex::new(pattern)
                                .map_err(|e| at(format!("bad pattern '{pattern}': {e}")))?;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Usable as one directory name under the install root.
fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && !value.contains(['/', '\\', '\0'])
        && value.trim() == value
}

fn check_sha256(value: &str) -> Result<(), String> {
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(format!("'{value}' is not a sha256 hex digest"))
    }
}

fn check_relative(value: &str) -> Result<(), String> {
    let path = Path::new(value);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if value.is_empty() || escapes {
        Err(format!("path '{value}' must be relative and stay inside its directory"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opencascade() -> Formula {
        serde_json::from_str(include_str!("../fixtures/opencascade.json")).unwrap()
    }

    fn aws_cdk() -> Formula {
        serde_json::from_str(include_str!("../fixtures/aws-cdk.json")).unwrap()
    }

    #[test]
    fn deserialize_formula_fixtures() {
        for formula in [opencascade(), aws_cdk()] {
            assert!(!formula.name.is_empty());
            assert!(!formula.bottle.files.is_empty());
            assert!(!formula.test_steps.is_empty());
            formula.validate().unwrap();
        }
    }

    #[test]
    fn pkg_version_includes_revision() {
        assert_eq!(opencascade().pkg_version().to_string(), "7.7.2-4");
        assert_eq!(aws_cdk().pkg_version().to_string(), "2.1004.0-0");
    }

    #[test]
    fn dependency_accepts_multiple_kinds_and_os_guard() {
        let formula = opencascade();
        let cmake = formula
            .dependencies
            .iter()
            .find(|d| d.name == "cmake")
            .unwrap();
        assert!(cmake.has_kind(DependencyKind::Build));
        assert!(cmake.has_kind(DependencyKind::Test));
        assert!(!cmake.has_kind(DependencyKind::Runtime));

        let mesa = formula
            .dependencies
            .iter()
            .find(|d| d.name == "mesa")
            .unwrap();
        assert!(mesa.applies_to(OsFamily::Linux));
        assert!(!mesa.applies_to(OsFamily::Macos));
    }

    #[test]
    fn bare_dependency_name_is_runtime() {
        let formula = aws_cdk();
        assert_eq!(formula.dependencies, vec![Dependency::runtime("node")]);
    }

    #[test]
    fn cellar_parses_known_values() {
        let formula = opencascade();
        assert_eq!(
            formula.bottle.files["x86_64_linux"].cellar,
            Cellar::AnySkipRelocation
        );
        assert_eq!(formula.bottle.files["arm64_sonoma"].cellar, Cellar::Any);
        assert_eq!(
            Cellar::from("/usr/local/Cellar".to_string()),
            Cellar::Path("/usr/local/Cellar".to_string())
        );
    }

    #[test]
    fn bottle_url_prefers_explicit_url() {
        let formula = aws_cdk();
        let file = &formula.bottle.files["all"];
        let url = formula.bottle_url(file).unwrap();
        assert_eq!(
            url,
            format!("https://ghcr.io/v2/homebrew/core/aws-cdk/blobs/sha256:{}", file.sha256)
        );

        let explicit = BottleFile {
            sha256: file.sha256.clone(),
            cellar: Cellar::Any,
            url: Some("file:///mirror/aws-cdk.tar.gz".to_string()),
        };
        assert_eq!(
            formula.bottle_url(&explicit).unwrap(),
            "file:///mirror/aws-cdk.tar.gz"
        );
    }

    #[test]
    fn install_steps_deserialize_as_tagged_variants() {
        let formula = aws_cdk();
        assert!(matches!(&formula.install_steps[0], InstallStep::Run(cmd) if cmd.program == "npm"));
        assert!(formula.install_steps[1].applies_to_bottle());
        assert!(!formula.install_steps[0].applies_to_bottle());
    }

    #[test]
    fn test_commands_default_to_expecting_success() {
        let json = r#"{"type": "run", "program": "true"}"#;
        let step: TestStep = serde_json::from_str(json).unwrap();
        let TestStep::Run(test) = step else {
            panic!("expected run step");
        };
        assert!(test.expect_success);
        assert!(test.assertions.is_empty());
    }

    #[test]
    fn validate_rejects_escaping_paths() {
        let mut formula = aws_cdk();
        formula.install_steps.push(InstallStep::WriteFile {
            path: "../../etc/passwd".to_string(),
            contents: String::new(),
            executable: false,
        });

        let err = formula.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidManifest { .. }));
        assert!(err.to_string().contains("install step 3"));
    }

    #[test]
    fn validate_rejects_bad_checksums_and_patterns() {
        let mut formula = aws_cdk();
        formula.source.as_mut().unwrap().sha256 = "deadbeef".to_string();
        assert!(formula.validate().is_err());

        let mut formula = aws_cdk();
        formula.test_steps.push(TestStep::Run(TestCommand {
            command: CommandSpec::new("true", &[]),
            expect_success: true,
            assertions: vec![Assertion::Matches {
                pattern: "(unclosed".to_string(),
            }],
        }));
        assert!(formula.validate().is_err());
    }

    #[test]
    fn validate_rejects_versions_that_are_not_one_directory() {
        for version in ["../../x", "1.0/..", "..", "1..0", ".1", "1.0\\x", " 1.0"] {
            let mut formula = aws_cdk();
            formula.version = version.to_string();
            let err = formula.validate().unwrap_err();
            assert!(
                err.to_string().contains("not a valid version"),
                "{version:?}: {err}"
            );
        }

        let mut formula = aws_cdk();
        formula.version = "1.0.0-beta.1+build_7".to_string();
        assert!(formula.validate().is_ok());
    }

    #[test]
    fn validate_rejects_names_that_are_not_one_directory() {
        for name in ["", "a/b", ".hidden", "a\\b"] {
            let mut formula = aws_cdk();
            formula.name = name.to_string();
            assert!(formula.validate().is_err(), "{name:?}");
        }
    }

    #[test]
    fn replace_step_parses_and_checks_its_pattern() {
        let json = r#"{"type": "replace", "path": "lib/cmake/OpenCASCADEConfig.cmake",
            "pattern": "\\$\\{OCCT_INSTALL_PREFIX\\}", "replacement": "{opt:opencascade}"}"#;
        let step: InstallStep = serde_json::from_str(json).unwrap();
        assert!(!step.applies_to_bottle());
        assert!(step.describe().starts_with("replace /"));

        let mut formula = aws_cdk();
        formula.install_steps.push(step);
        assert!(formula.validate().is_ok());

        formula.install_steps.push(InstallStep::Replace {
            path: "lib/x.cmake".to_string(),
            pattern: "[unclosed".to_string(),
            replacement: String::new(),
        });
        let err = formula.validate().unwrap_err();
        assert!(err.to_string().contains("install step 4"), "{err}");
    }
}
