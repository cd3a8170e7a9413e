use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures while turning a target formula into an install order.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error(
        "dependency cycle detected: {}\n  hint: this is likely a formula bug; please report it upstream",
        .cycle.join(" -> ")
    )]
    Cycle { cycle: Vec<String> },

    #[error(
        "formula '{name}' not found (required via {})\n  hint: add a manifest for '{name}' to the formula directory",
        .path.join(" -> ")
    )]
    MissingDependency { name: String, path: Vec<String> },

    #[error(
        "conflicting versions of '{name}' (available: {}): {}\n  hint: align the version requirements of the dependents",
        render_optional(.available),
        render_demands(.demands)
    )]
    VersionConflict {
        name: String,
        available: Option<String>,
        demands: Vec<VersionDemand>,
    },
}

/// One dependent's version requirement on a formula.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionDemand {
    pub required_by: String,
    pub requirement: String,
}

impl fmt::Display for VersionDemand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requires {}", self.required_by, self.requirement)
    }
}

fn render_demands(demands: &[VersionDemand]) -> String {
    demands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_available(platforms: &[String]) -> String {
    if platforms.is_empty() {
        String::new()
    } else {
        format!(" (bottles available for: {})", platforms.join(", "))
    }
}

fn render_optional(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("none")
}

fn render_file_name(file_name: &Option<String>) -> String {
    file_name
        .as_ref()
        .map(|name| format!(" for '{name}'"))
        .unwrap_or_default()
}

fn render_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\n{stderr}")
    }
}

fn render_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(
        "no compatible bottle for formula '{name}' on {platform} and no source to build from{}",
        render_available(.available_platforms)
    )]
    UnsupportedBottle {
        name: String,
        platform: String,
        available_platforms: Vec<String>,
    },

    #[error(
        "checksum verification failed{}\n  expected: {expected}\n  got:      {actual}\n  hint: this may indicate a corrupted download or a tampered mirror; try again",
        render_file_name(.file_name)
    )]
    ChecksumMismatch {
        expected: String,
        actual: String,
        file_name: Option<String>,
    },

    #[error("network error: {message}\n  hint: check your internet connection and try again")]
    NetworkFailure { message: String },

    #[error(
        "install step {step} of '{formula}' failed ({}): {command}{}",
        render_exit(.exit_code),
        render_stderr(.stderr)
    )]
    InstallStep {
        formula: String,
        step: usize,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("cannot link '{}' ({existing_type})\n  hint: {}", .path.display(), .existing_type.hint())]
    LinkConflict {
        path: PathBuf,
        existing_type: LinkConflictType,
    },

    #[error("filesystem error at '{}': {message}", .path.display())]
    Filesystem { path: PathBuf, message: String },

    #[error("invalid manifest for '{name}': {message}")]
    InvalidManifest { name: String, message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl Error {
    /// Wrap an I/O failure on `path`.
    pub fn fs(path: &Path, err: impl fmt::Display) -> Self {
        Error::Filesystem {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// Whether fetching the same artifact again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NetworkFailure { .. } | Error::ChecksumMismatch { .. }
        )
    }
}

/// Type of existing file at a link conflict path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkConflictType {
    RegularFile,
    Directory,
    SymlinkToOther { target: PathBuf },
}

impl LinkConflictType {
    fn hint(&self) -> &'static str {
        match self {
            LinkConflictType::RegularFile => "remove the existing file",
            LinkConflictType::Directory => "remove the existing directory first",
            LinkConflictType::SymlinkToOther { .. } => {
                "another formula owns this link; unlink it before installing"
            }
        }
    }
}

impl fmt::Display for LinkConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkConflictType::RegularFile => write!(f, "file already exists"),
            LinkConflictType::Directory => write!(f, "directory already exists"),
            LinkConflictType::SymlinkToOther { target } => {
                write!(f, "symlink to '{}' already exists", target.display())
            }
        }
    }
}
