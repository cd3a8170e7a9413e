use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, warn};

use bk_core::{ArtifactPlan, Error, Formula, InstallStep, LinkScope};

use crate::environment::BuildEnvironment;
use crate::extract::{extract_archive, single_top_level_dir};
use crate::layout::{InstallReceipt, PrefixGuard, collect_files};
use crate::link::{LinkedFile, make_symlink};
use crate::progress::{InstallEvent, emit};
use crate::traits::ProcessRecord;

use super::{InstallOutcome, InstallReport, Installer};

/// Lines of stderr kept in a step failure.
const STDERR_TAIL_LINES: usize = 20;

pub(super) fn already_satisfied(formula: &Formula, prefix: PathBuf) -> InstallReport {
    InstallReport {
        name: formula.name.clone(),
        pkg_version: formula.pkg_version().to_string(),
        prefix,
        outcome: InstallOutcome::AlreadySatisfied,
        links: Vec::new(),
        records: Vec::new(),
    }
}

/// Everything the blocking half of an install needs, owned.
pub(super) struct InstallJob {
    pub(super) installer: Installer,
    pub(super) formula: Formula,
    pub(super) artifact: ArtifactPlan,
    pub(super) prefix: PathBuf,
    pub(super) deps: BTreeMap<String, PathBuf>,
    /// Verified main artifact
    pub(super) blob: PathBuf,
    /// Verified `fetch` step downloads by step index
    pub(super) extra_blobs: HashMap<usize, PathBuf>,
}

struct Progress {
    links: Vec<LinkedFile>,
    records: Vec<ProcessRecord>,
}

impl InstallJob {
    pub(super) fn run(self) -> Result<InstallReport, Error> {
        let layout = &self.installer.layout;
        let _lock = layout.lock(&self.formula)?;

        // Another process may have finished while we waited for the lock
        if layout.is_installed(&self.formula) {
            return Ok(already_satisfied(&self.formula, self.prefix.clone()));
        }
        if self.prefix.exists() {
            warn!(
                name = %self.formula.name,
                prefix = %self.prefix.display(),
                "removing leftover prefix from an interrupted install"
            );
            fs::remove_dir_all(&self.prefix).map_err(|e| Error::fs(&self.prefix, e))?;
        }

        let work = tempfile::Builder::new()
            .prefix(&format!("{}-", self.formula.name))
            .tempdir_in(layout.tmp_dir())
            .map_err(|e| Error::fs(layout.tmp_dir(), e))?;

        let guard = PrefixGuard::new(&self.prefix);
        let mut progress = Progress {
            links: Vec::new(),
            records: Vec::new(),
        };

        let applied = match &self.artifact {
            ArtifactPlan::UseBottle { .. } => self.pour_bottle(work.path(), &mut progress),
            ArtifactPlan::BuildFromSource { .. } => {
                self.build_from_source(work.path(), &mut progress)
            }
        };
        let finished = applied.and_then(|()| self.write_receipt(&progress));

        if let Err(e) = finished {
            for linked in progress.links.iter().rev() {
                if let Err(rollback) = self.installer.linker.rollback(linked) {
                    warn!(
                        link = %linked.link_path.display(),
                        error = %rollback,
                        "failed to roll back link"
                    );
                }
            }
            return Err(e);
        }

        guard.disarm();
        info!(name = %self.formula.name, prefix = %self.prefix.display(), "installed");
        Ok(InstallReport {
            name: self.formula.name.clone(),
            pkg_version: self.formula.pkg_version().to_string(),
            prefix: self.prefix.clone(),
            outcome: InstallOutcome::Installed,
            links: progress.links.into_iter().map(|l| l.link_path).collect(),
            records: progress.records,
        })
    }

    fn environment(&self, work: &Path, srcdir: Option<&Path>) -> BuildEnvironment {
        BuildEnvironment::for_install(
            &self.formula,
            &self.prefix,
            work,
            srcdir,
            &self.deps,
            &self.installer.env_allowlist,
            self.installer.jobs,
        )
    }

    fn pour_bottle(&self, work: &Path, progress: &mut Progress) -> Result<(), Error> {
        let unpacked = work.join("bottle");
        extract_archive(&self.blob, &unpacked)?;
        let keg = self.locate_keg(&unpacked)?;

        if let Some(parent) = self.prefix.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e))?;
        }
        fs::rename(&keg, &self.prefix).map_err(|e| Error::fs(&self.prefix, e))?;

        let env = self.environment(work, None);
        let steps: Vec<(usize, &InstallStep)> = self
            .formula
            .install_steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.applies_to_bottle())
            .map(|(idx, step)| (idx + 1, step))
            .collect();
        self.apply_steps(&steps, &env, work, progress)
    }

    /// Bottles unpack to `<name>/<version>[_<revision>]/`.
    fn locate_keg(&self, unpacked: &Path) -> Result<PathBuf, Error> {
        let named = unpacked.join(&self.formula.name);
        let exact = named.join(self.formula.pkg_version().keg_name());
        if exact.is_dir() {
            return Ok(exact);
        }
        if named.is_dir() {
            let only = single_top_level_dir(&named)?;
            if only != named {
                return Ok(only);
            }
        }
        Err(Error::InvalidManifest {
            name: self.formula.name.clone(),
            message: format!(
                "bottle does not contain a single '{}/<version>' directory",
                self.formula.name
            ),
        })
    }

    fn build_from_source(&self, work: &Path, progress: &mut Progress) -> Result<(), Error> {
        let src_root = work.join("src");
        extract_archive(&self.blob, &src_root)?;
        let srcdir = single_top_level_dir(&src_root)?;
        fs::create_dir_all(&self.prefix).map_err(|e| Error::fs(&self.prefix, e))?;

        let env = self.environment(work, Some(&srcdir));
        let steps: Vec<(usize, &InstallStep)> = self
            .formula
            .install_steps
            .iter()
            .enumerate()
            .map(|(idx, step)| (idx + 1, step))
            .collect();
        self.apply_steps(&steps, &env, work, progress)
    }

    fn apply_steps(
        &self,
        steps: &[(usize, &InstallStep)],
        env: &BuildEnvironment,
        work: &Path,
        progress: &mut Progress,
    ) -> Result<(), Error> {
        let total = self.formula.install_steps.len();
        for (number, step) in steps {
            debug!(name = %self.formula.name, step = number, "{}", step.describe());
            emit(
                &self.installer.progress,
                InstallEvent::StepStarted {
                    name: self.formula.name.clone(),
                    step: *number,
                    total,
                    description: step.describe(),
                },
            );
            self.apply_step(*number, step, env, work, progress)?;
        }
        Ok(())
    }

    fn apply_step(
        &self,
        number: usize,
        step: &InstallStep,
        env: &BuildEnvironment,
        work: &Path,
        progress: &mut Progress,
    ) -> Result<(), Error> {
        match step {
            InstallStep::Fetch { dest, .. } => {
                let blob = self.extra_blobs.get(&(number - 1)).ok_or_else(|| Error::Filesystem {
                    path: PathBuf::from(dest),
                    message: "download for this step was not fetched".to_string(),
                })?;
                let dest = env.confined(work, dest)?;
                create_parent(&dest)?;
                fs::copy(blob, &dest).map_err(|e| Error::fs(&dest, e))?;
            }
            InstallStep::Unpack { archive, dest } => {
                let archive = env.confined(work, archive)?;
                let dest = match dest {
                    Some(dest) => env.confined(work, dest)?,
                    None => work.to_path_buf(),
                };
                extract_archive(&archive, &dest)?;
            }
            InstallStep::Run(spec) => {
                let invocation = env.invocation(spec)?;
                fs::create_dir_all(&invocation.cwd).map_err(|e| Error::fs(&invocation.cwd, e))?;

                let record = self
                    .installer
                    .runner
                    .run(&invocation)
                    .map_err(|e| Error::InstallStep {
                        formula: self.formula.name.clone(),
                        step: number,
                        command: invocation.command_line(),
                        exit_code: None,
                        stderr: e.to_string(),
                    })?;
                let failed = !record.success();
                let exit_code = record.exit_code;
                let stderr = tail(&record.stderr, STDERR_TAIL_LINES);
                progress.records.push(record);

                if failed {
                    return Err(Error::InstallStep {
                        formula: self.formula.name.clone(),
                        step: number,
                        command: invocation.command_line(),
                        exit_code,
                        stderr,
                    });
                }
            }
            InstallStep::Symlink {
                target,
                link,
                scope,
            } => {
                let target_path = env.confined(&self.prefix, target)?;
                if fs::symlink_metadata(&target_path).is_err() {
                    return Err(Error::InvalidManifest {
                        name: self.formula.name.clone(),
                        message: format!("symlink target '{target}' does not exist in the prefix"),
                    });
                }
                match scope {
                    LinkScope::SharedBin => {
                        let link = env.confined(Path::new(""), link)?;
                        let (_, linked) =
                            self.installer
                                .linker
                                .link(&self.formula.name, &link, &target_path)?;
                        progress.links.extend(linked);
                    }
                    LinkScope::Prefix => {
                        let link_path = env.confined(&self.prefix, link)?;
                        create_parent(&link_path)?;
                        if fs::symlink_metadata(&link_path).is_ok() {
                            fs::remove_file(&link_path).map_err(|e| Error::fs(&link_path, e))?;
                        }
                        make_symlink(&target_path, &link_path)?;
                    }
                }
            }
            InstallStep::WriteFile {
                path,
                contents,
                executable,
            } => {
                let path = env.confined(&self.prefix, path)?;
                create_parent(&path)?;
                fs::write(&path, env.expand(contents)?).map_err(|e| Error::fs(&path, e))?;
                if *executable {
                    make_executable(&path)?;
                }
            }
            InstallStep::Replace {
                path,
                pattern,
                replacement,
            } => {
                let path = env.confined(&self.prefix, path)?;
                let re = Regex::new(pattern).map_err(|e| Error::InvalidManifest {
                    name: self.formula.name.clone(),
                    message: format!("bad pattern '{pattern}': {e}"),
                })?;
                let text = fs::read_to_string(&path).map_err(|e| Error::fs(&path, e))?;
                if !re.is_match(&text) {
                    return Err(Error::InstallStep {
                        formula: self.formula.name.clone(),
                        step: number,
                        command: step.describe(),
                        exit_code: None,
                        stderr: format!("pattern matched nothing in {}", path.display()),
                    });
                }
                let replaced = re.replace_all(&text, env.expand(replacement)?.as_str());
                fs::write(&path, replaced.as_bytes()).map_err(|e| Error::fs(&path, e))?;
            }
        }
        Ok(())
    }

    fn write_receipt(&self, progress: &Progress) -> Result<(), Error> {
        let mut receipt = InstallReceipt::new(&self.formula, &self.artifact);
        receipt.links = progress.links.iter().map(|l| l.link_path.clone()).collect();
        receipt.files = collect_files(&self.prefix);
        self.installer.layout.write_receipt(&self.prefix, &receipt)
    }
}

fn create_parent(path: &Path) -> Result<(), Error> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e)),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| Error::fs(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), Error> {
    Ok(())
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
