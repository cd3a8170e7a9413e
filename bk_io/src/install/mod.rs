//! Installer module for brewkit
//!
//! Turns one resolved formula plus its artifact plan into a complete install
//! prefix. It is organized into focused submodules:
//!
//! - `steps` - Pouring bottles and running install steps in a work directory
//! - `scheduler` - Installing a whole dependency closure on a worker pool
//!
//! An install is complete once `INSTALL_RECEIPT.json` exists in its prefix.
//! A prefix without a receipt is leftover from an interrupted attempt and is
//! removed before the next one starts.

mod scheduler;
mod steps;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use bk_core::{ArtifactPlan, Error, Formula, InstallStep};

use crate::blob::BlobCache;
use crate::config::EngineConfig;
use crate::fetch::{FetchRequest, Fetcher};
use crate::layout::Layout;
use crate::link::Linker;
use crate::progress::{InstallEvent, ProgressCallback, emit};
use crate::traits::{CommandRunner, HttpClient, ProcessRecord, ReqwestHttpClient, StdCommandRunner};

pub use scheduler::{ClosureReport, InstallOptions, NodeOutcome, NodeReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadySatisfied,
}

/// Result of installing a single formula
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub name: String,
    pub pkg_version: String,
    pub prefix: PathBuf,
    pub outcome: InstallOutcome,
    /// Shared-bin links created by this install
    pub links: Vec<PathBuf>,
    /// Every process the install ran, in order
    pub records: Vec<ProcessRecord>,
}

#[derive(Clone)]
pub struct Installer {
    pub(crate) layout: Layout,
    pub(crate) linker: Linker,
    pub(crate) fetcher: Fetcher,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) env_allowlist: Arc<[String]>,
    pub(crate) jobs: usize,
    pub(crate) progress: Option<ProgressCallback>,
}

impl Installer {
    pub fn new(
        config: &EngineConfig,
        client: Arc<dyn HttpClient>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let layout = Layout::new(config)?;
        let linker = Linker::new(&config.shared_bin(), layout.install_root())?;
        let cache_dir = config.cache_dir();
        let cache = BlobCache::new(&cache_dir).map_err(|e| Error::fs(&cache_dir, e))?;
        let fetcher = Fetcher::new(client, cache, config.retry, config.download_concurrency);

        Ok(Self {
            layout,
            linker,
            fetcher,
            runner,
            env_allowlist: config.env_allowlist.clone().into(),
            jobs: config.jobs,
            progress: None,
        })
    }

    /// Installer using the real network and real processes.
    pub fn from_config(config: &EngineConfig) -> Result<Self, Error> {
        Self::new(
            config,
            Arc::new(ReqwestHttpClient::new()),
            Arc::new(StdCommandRunner),
        )
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn is_installed(&self, formula: &Formula) -> bool {
        self.layout.is_installed(formula)
    }

    /// Install one formula whose dependencies are already in place.
    ///
    /// `deps` maps every formula of the dependency closure to its prefix; it
    /// feeds `{opt:NAME}` and the controlled environment.
    pub async fn install(
        &self,
        formula: &Formula,
        artifact: &ArtifactPlan,
        deps: &BTreeMap<String, PathBuf>,
    ) -> Result<InstallReport, Error> {
        formula.validate()?;
        let prefix = self.layout.prefix_for(formula);
        if self.layout.is_installed(formula) {
            debug!(name = %formula.name, prefix = %prefix.display(), "already installed");
            emit(
                &self.progress,
                InstallEvent::AlreadySatisfied {
                    name: formula.name.clone(),
                },
            );
            return Ok(steps::already_satisfied(formula, prefix));
        }

        let blob = self
            .fetcher
            .fetch(&FetchRequest {
                url: artifact.url().to_string(),
                sha256: artifact.sha256().to_string(),
                name: formula.name.clone(),
            })
            .await?;

        // Extra downloads are verified up front so the blocking part never waits on the network
        let mut extra_blobs = HashMap::new();
        if !artifact.is_bottle() {
            for (idx, step) in formula.install_steps.iter().enumerate() {
                if let InstallStep::Fetch { url, sha256, .. } = step {
                    let path = self
                        .fetcher
                        .fetch(&FetchRequest {
                            url: url.clone(),
                            sha256: sha256.clone(),
                            name: formula.name.clone(),
                        })
                        .await?;
                    extra_blobs.insert(idx, path);
                }
            }
        }

        emit(
            &self.progress,
            InstallEvent::InstallStarted {
                name: formula.name.clone(),
                from_source: !artifact.is_bottle(),
            },
        );

        let job = steps::InstallJob {
            installer: self.clone(),
            formula: formula.clone(),
            artifact: artifact.clone(),
            prefix,
            deps: deps.clone(),
            blob,
            extra_blobs,
        };
        let report = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| Error::Filesystem {
                path: PathBuf::from(&formula.name),
                message: format!("install task failed: {e}"),
            })??;

        let event = match report.outcome {
            InstallOutcome::Installed => InstallEvent::InstallCompleted {
                name: formula.name.clone(),
            },
            InstallOutcome::AlreadySatisfied => InstallEvent::AlreadySatisfied {
                name: formula.name.clone(),
            },
        };
        emit(&self.progress, event);
        Ok(report)
    }
}
