//! Installing a whole dependency closure.
//!
//! Every node that is not installed yet gets its artifact fetch started as
//! soon as the plan exists. A node's install starts once all of its install
//! dependencies have succeeded, and at most `jobs` installs run at once. When
//! a node fails, every transitive dependent that has not started is skipped
//! and its fetch aborted; independent nodes keep going.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use bk_core::{
    ArtifactPlan, Error, Formula, InstallGraph, PlatformFingerprint, ResolveOptions, Universe,
    plan, select_artifact, source_artifact,
};

use crate::fetch::FetchRequest;
use crate::progress::{InstallEvent, emit};
use crate::test_runner::{TestResult, TestRunner};

use super::{InstallOutcome, Installer};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Build the target from source even when a bottle matches
    pub build_from_source: bool,
    /// Install the target's test dependencies and run its tests
    pub run_tests: bool,
    pub include_recommended: bool,
    pub include_optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Installed,
    AlreadySatisfied,
    Failed { reason: String },
    /// `dependency` is the formula whose failure caused the skip
    SkippedDueToDependencyFailure { dependency: String },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Installed | NodeOutcome::AlreadySatisfied)
    }
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub name: String,
    /// Display form, `1.2.3_4`; `prefix` is the unique key
    pub pkg_version: String,
    pub prefix: PathBuf,
    pub artifact: Option<ArtifactPlan>,
    pub outcome: NodeOutcome,
    /// The underlying error of a `Failed` node
    pub error: Option<Error>,
}

/// Per-formula results, in install order.
#[derive(Debug, Clone)]
pub struct ClosureReport {
    pub target: String,
    pub nodes: Vec<NodeReport>,
    pub test: Option<TestResult>,
}

impl ClosureReport {
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.node(name).map(|n| &n.outcome)
    }

    /// Every node installed and, if tests ran, every test passed.
    pub fn succeeded(&self) -> bool {
        self.nodes.iter().all(|n| n.outcome.is_success())
            && self.test.as_ref().is_none_or(|t| t.passed)
    }
}

enum Readiness {
    Ready,
    Waiting,
    Blocked { dependency: String },
}

impl Installer {
    /// Resolve, fetch, install and optionally test `target` with its closure.
    ///
    /// Resolution errors abort the whole run since there is no plan; every
    /// later failure is recorded on its node instead.
    pub async fn install_closure(
        &self,
        target: &Formula,
        universe: &Universe,
        platform: &PlatformFingerprint,
        options: &InstallOptions,
    ) -> Result<ClosureReport, Error> {
        let resolve_options = ResolveOptions {
            os: Some(platform.os),
            include_test: options.run_tests,
            include_recommended: options.include_recommended,
            include_optional: options.include_optional,
        };
        let graph = plan(target, universe, &resolve_options)?;
        debug!(
            target = %target.name,
            order = ?graph.order().iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "resolved install order"
        );

        let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
        let mut errors: HashMap<String, Error> = HashMap::new();
        let mut artifacts: HashMap<String, ArtifactPlan> = HashMap::new();
        let mut prefetches: HashMap<String, JoinHandle<Result<PathBuf, Error>>> = HashMap::new();

        for formula in graph.order() {
            // Manifest values become paths, so nothing unvalidated goes further
            if let Err(e) = formula.validate() {
                self.record_failure(&formula.name, e, &mut outcomes, &mut errors);
                continue;
            }
            if self.layout.is_installed(formula) {
                outcomes.insert(formula.name.clone(), NodeOutcome::AlreadySatisfied);
                emit(
                    &self.progress,
                    InstallEvent::AlreadySatisfied {
                        name: formula.name.clone(),
                    },
                );
                continue;
            }

            let force_source = options.build_from_source && formula.name == target.name;
            let artifact = if force_source {
                source_artifact(formula)
            } else {
                select_artifact(formula, platform)
            };
            match artifact {
                Ok(artifact) => {
                    let handle = self.spawn_prefetch(formula, &artifact);
                    prefetches.insert(formula.name.clone(), handle);
                    artifacts.insert(formula.name.clone(), artifact);
                }
                Err(e) => self.record_failure(&formula.name, e, &mut outcomes, &mut errors),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.jobs.max(1)));
        let mut running = JoinSet::new();
        let mut running_names: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut pending: Vec<&Formula> = graph
            .order()
            .iter()
            .copied()
            .filter(|f| !outcomes.contains_key(&f.name))
            .collect();

        loop {
            let mut waiting = Vec::new();
            // Pending is in install order, so a skip reaches later dependents in this same pass
            for formula in pending.drain(..) {
                match readiness(&graph, &formula.name, &outcomes) {
                    Readiness::Waiting => waiting.push(formula),
                    Readiness::Blocked { dependency } => {
                        if let Some(handle) = prefetches.remove(&formula.name) {
                            handle.abort();
                        }
                        info!(name = %formula.name, %dependency, "skipping, dependency failed");
                        emit(
                            &self.progress,
                            InstallEvent::Skipped {
                                name: formula.name.clone(),
                                dependency: dependency.clone(),
                            },
                        );
                        outcomes.insert(
                            formula.name.clone(),
                            NodeOutcome::SkippedDueToDependencyFailure { dependency },
                        );
                    }
                    Readiness::Ready => {
                        let Some(artifact) = artifacts.get(&formula.name).cloned() else {
                            continue;
                        };
                        let installer = self.clone();
                        let owned = formula.clone();
                        let deps = self.layout.prefixes(graph.closure_of(&formula.name));
                        let prefetch = prefetches.remove(&formula.name);
                        let permits = semaphore.clone();

                        let handle = running.spawn(async move {
                            if let Some(prefetch) = prefetch {
                                prefetch.await.map_err(|e| Error::NetworkFailure {
                                    message: format!("fetch task failed: {e}"),
                                })??;
                            }
                            let _permit = permits.acquire_owned().await.map_err(|_| {
                                Error::Config {
                                    message: "install worker pool closed".to_string(),
                                }
                            })?;
                            installer.install(&owned, &artifact, &deps).await
                        });
                        running_names.insert(handle.id(), formula.name.clone());
                    }
                }
            }
            pending = waiting;

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(join_error) => {
                    let message = format!("install task failed: {join_error}");
                    (
                        join_error.id(),
                        Err(Error::Filesystem {
                            path: PathBuf::new(),
                            message,
                        }),
                    )
                }
            };
            let Some(name) = running_names.remove(&id) else {
                continue;
            };
            match result {
                Ok(report) => {
                    let outcome = match report.outcome {
                        InstallOutcome::Installed => NodeOutcome::Installed,
                        InstallOutcome::AlreadySatisfied => NodeOutcome::AlreadySatisfied,
                    };
                    outcomes.insert(name, outcome);
                }
                Err(e) => self.record_failure(&name, e, &mut outcomes, &mut errors),
            }
        }

        let test = if options.run_tests
            && outcomes.get(&target.name).is_some_and(NodeOutcome::is_success)
        {
            Some(self.test_target(&graph, target).await)
        } else {
            None
        };

        let nodes = graph
            .order()
            .iter()
            .map(|formula| NodeReport {
                name: formula.name.clone(),
                pkg_version: formula.pkg_version().keg_name(),
                prefix: self.layout.prefix_for(formula),
                artifact: artifacts.get(&formula.name).cloned(),
                outcome: outcomes
                    .remove(&formula.name)
                    .unwrap_or(NodeOutcome::Failed {
                        reason: "not scheduled".to_string(),
                    }),
                error: errors.remove(&formula.name),
            })
            .collect();

        Ok(ClosureReport {
            target: target.name.clone(),
            nodes,
            test,
        })
    }

    fn spawn_prefetch(
        &self,
        formula: &Formula,
        artifact: &ArtifactPlan,
    ) -> JoinHandle<Result<PathBuf, Error>> {
        let fetcher = self.fetcher.clone();
        let progress = self.progress.clone();
        let request = FetchRequest {
            url: artifact.url().to_string(),
            sha256: artifact.sha256().to_string(),
            name: formula.name.clone(),
        };
        tokio::spawn(async move {
            emit(
                &progress,
                InstallEvent::FetchStarted {
                    name: request.name.clone(),
                    url: request.url.clone(),
                },
            );
            let path = fetcher.fetch(&request).await?;
            emit(
                &progress,
                InstallEvent::FetchCompleted {
                    name: request.name.clone(),
                },
            );
            Ok(path)
        })
    }

    fn record_failure(
        &self,
        name: &str,
        err: Error,
        outcomes: &mut HashMap<String, NodeOutcome>,
        errors: &mut HashMap<String, Error>,
    ) {
        error!(name, error = %err, "install failed");
        emit(
            &self.progress,
            InstallEvent::Failed {
                name: name.to_string(),
                reason: err.to_string(),
            },
        );
        outcomes.insert(
            name.to_string(),
            NodeOutcome::Failed {
                reason: err.to_string(),
            },
        );
        errors.insert(name.to_string(), err);
    }

    async fn test_target(&self, graph: &InstallGraph<'_>, target: &Formula) -> TestResult {
        // Build-only dependencies are not part of what the target ships with
        let mut visible: BTreeMap<String, PathBuf> =
            self.layout.prefixes(graph.runtime_closure_of(&target.name));
        for dep in graph.test_dependencies() {
            if let Some(formula) = graph.get(dep) {
                visible.insert(formula.name.clone(), self.layout.prefix_for(formula));
                visible.extend(self.layout.prefixes(graph.runtime_closure_of(dep)));
            }
        }

        let runner = TestRunner::new(self.runner.clone(), self.env_allowlist.clone());
        let formula = target.clone();
        let prefix = self.layout.prefix_for(target);

        emit(
            &self.progress,
            InstallEvent::TestStarted {
                name: target.name.clone(),
            },
        );
        let result =
            tokio::task::spawn_blocking(move || runner.run_tests(&formula, &prefix, &visible))
                .await
                .unwrap_or_else(|e| TestResult::setup_failure(format!("test task failed: {e}")));
        emit(
            &self.progress,
            InstallEvent::TestCompleted {
                name: target.name.clone(),
                passed: result.passed,
            },
        );
        result
    }
}

fn readiness(
    graph: &InstallGraph<'_>,
    name: &str,
    outcomes: &HashMap<String, NodeOutcome>,
) -> Readiness {
    let mut waiting = false;
    for dep in graph.dependencies(name) {
        match outcomes.get(dep) {
            Some(NodeOutcome::Failed { .. }) => {
                return Readiness::Blocked {
                    dependency: dep.clone(),
                };
            }
            Some(NodeOutcome::SkippedDueToDependencyFailure { dependency }) => {
                return Readiness::Blocked {
                    dependency: dependency.clone(),
                };
            }
            Some(_) => {}
            None => waiting = true,
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}
