use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};

use bk_core::{ArtifactPlan, Error, Formula};

use crate::config::EngineConfig;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// Where an install came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactKind {
    Bottle { tag: String },
    Source,
}

/// Written last; its presence marks a complete install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub revision: u32,
    pub artifact: ArtifactKind,
    pub sha256: String,
    /// Shared-bin links created by this install
    #[serde(default)]
    pub links: Vec<PathBuf>,
    /// Files under the prefix, relative to it
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub installed_at: String,
}

impl InstallReceipt {
    pub fn new(formula: &Formula, artifact: &ArtifactPlan) -> Self {
        let kind = match artifact {
            ArtifactPlan::UseBottle { tag, .. } => ArtifactKind::Bottle { tag: tag.clone() },
            ArtifactPlan::BuildFromSource { .. } => ArtifactKind::Source,
        };
        Self {
            name: formula.name.clone(),
            version: formula.version.clone(),
            revision: formula.revision,
            artifact: kind,
            sha256: artifact.sha256().to_string(),
            links: Vec::new(),
            files: Vec::new(),
            installed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// On-disk layout of install prefixes.
#[derive(Debug, Clone)]
pub struct Layout {
    install_root: PathBuf,
    locks_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl Layout {
    pub fn new(config: &EngineConfig) -> Result<Self, Error> {
        Self::at(&config.install_root())
    }

    pub fn at(install_root: &Path) -> Result<Self, Error> {
        let layout = Self::inspect(install_root);
        for dir in [install_root, layout.locks_dir.as_path(), layout.tmp_dir.as_path()] {
            fs::create_dir_all(dir).map_err(|e| Error::fs(dir, e))?;
        }
        Ok(layout)
    }

    /// Read-only view that creates nothing; for queries on possibly missing roots.
    pub fn inspect(install_root: &Path) -> Self {
        Self {
            install_root: install_root.to_path_buf(),
            locks_dir: install_root.join(".locks"),
            tmp_dir: install_root.join(".tmp"),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Scratch space on the same filesystem as the prefixes, so finished
    /// trees can be renamed into place.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// `<install_root>/<name>/<version>-<revision>`, unique per (name, version, revision).
    pub fn prefix_for(&self, formula: &Formula) -> PathBuf {
        self.install_root
            .join(&formula.name)
            .join(formula.pkg_version().to_string())
    }

    pub fn read_receipt(&self, prefix: &Path) -> Option<InstallReceipt> {
        let contents = fs::read_to_string(prefix.join(RECEIPT_FILE)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// A receipt exists in the prefix and names this exact version and revision.
    pub fn is_installed(&self, formula: &Formula) -> bool {
        self.read_receipt(&self.prefix_for(formula))
            .is_some_and(|r| r.version == formula.version && r.revision == formula.revision)
    }

    /// Write the receipt via a temp file so it appears atomically.
    pub fn write_receipt(&self, prefix: &Path, receipt: &InstallReceipt) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(receipt).map_err(|e| Error::Config {
            message: format!("failed to serialize install receipt: {e}"),
        })?;
        let tmp = prefix.join(format!(".{RECEIPT_FILE}.tmp"));
        let path = prefix.join(RECEIPT_FILE);
        fs::write(&tmp, json).map_err(|e| Error::fs(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::fs(&path, e))
    }

    /// Exclusive lock on one prefix, held until the guard drops.
    ///
    /// Blocks, so call it from a blocking context.
    pub fn lock(&self, formula: &Formula) -> Result<PrefixLock, Error> {
        let lock_path = self
            .locks_dir
            .join(format!("{}-{}.lock", formula.name, formula.pkg_version()));
        let file = File::create(&lock_path).map_err(|e| Error::fs(&lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| Error::fs(&lock_path, format!("failed to acquire lock: {e}")))?;
        Ok(PrefixLock { _file: file })
    }

    /// Prefixes of `names`, for placeholder and environment construction.
    pub fn prefixes<'a>(
        &self,
        formulas: impl IntoIterator<Item = &'a Formula>,
    ) -> BTreeMap<String, PathBuf> {
        formulas
            .into_iter()
            .map(|f| (f.name.clone(), self.prefix_for(f)))
            .collect()
    }
}

pub struct PrefixLock {
    _file: File,
}

/// Removes a partially written prefix unless disarmed.
pub(crate) struct PrefixGuard {
    path: PathBuf,
    armed: bool,
}

impl PrefixGuard {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PrefixGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            tracing::debug!(prefix = %self.path.display(), "removing partial prefix");
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Files under `root`, relative to it, sorted.
pub fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .filter(|p| p.as_os_str() != RECEIPT_FILE)
        .collect();
    files.sort();
    files
}
