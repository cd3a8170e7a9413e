use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs4::fs_std::FileExt;
use tracing::{debug, info};

use bk_core::{Error, LinkConflictType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    /// Already pointed at the requested target
    Unchanged,
    /// A dangling link or one into another prefix of the same formula
    Replaced,
}

/// A link created or replaced by this process, for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFile {
    pub link_path: PathBuf,
    pub target_path: PathBuf,
    /// What the link pointed at before, if it was replaced
    pub previous: Option<PathBuf>,
}

static NEXT_TMP: AtomicU64 = AtomicU64::new(0);

/// Manages links in the shared executable directory.
///
/// Each link path has its own lock file, held from the ownership check
/// through the rename, so two installs claiming one name cannot both win.
#[derive(Debug, Clone)]
pub struct Linker {
    shared_bin: PathBuf,
    install_root: PathBuf,
    locks_dir: PathBuf,
}

impl Linker {
    pub fn new(shared_bin: &Path, install_root: &Path) -> Result<Self, Error> {
        let locks_dir = install_root.join(".locks");
        for dir in [shared_bin, locks_dir.as_path()] {
            fs::create_dir_all(dir).map_err(|e| Error::fs(dir, e))?;
        }
        Ok(Self {
            shared_bin: shared_bin.to_path_buf(),
            install_root: install_root.to_path_buf(),
            locks_dir,
        })
    }

    pub fn shared_bin(&self) -> &Path {
        &self.shared_bin
    }

    /// Point `<shared_bin>/<link>` at `target`, idempotently.
    ///
    /// `formula` decides which existing links may be replaced: dangling
    /// links, and links into another version of the same formula.
    pub fn link(
        &self,
        formula: &str,
        link: &Path,
        target: &Path,
    ) -> Result<(LinkOutcome, Option<LinkedFile>), Error> {
        let link_path = self.shared_bin.join(link);
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e))?;
        }
        let _lock = self.lock(link)?;

        let metadata = match fs::symlink_metadata(&link_path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                replace_atomically(&link_path, target)?;
                debug!(link = %link_path.display(), target = %target.display(), "linked");
                return Ok((
                    LinkOutcome::Created,
                    Some(LinkedFile {
                        link_path,
                        target_path: target.to_path_buf(),
                        previous: None,
                    }),
                ));
            }
            Err(e) => return Err(Error::fs(&link_path, e)),
        };

        if metadata.is_dir() {
            return Err(Error::LinkConflict {
                path: link_path,
                existing_type: LinkConflictType::Directory,
            });
        }
        if !metadata.file_type().is_symlink() {
            return Err(Error::LinkConflict {
                path: link_path,
                existing_type: LinkConflictType::RegularFile,
            });
        }

        let current = fs::read_link(&link_path).map_err(|e| Error::fs(&link_path, e))?;
        let resolved = resolve_link_target(&link_path, &current);
        if resolved == target {
            return Ok((LinkOutcome::Unchanged, None));
        }

        let dangling = !resolved.exists();
        let same_formula = resolved.starts_with(self.install_root.join(formula));
        if !dangling && !same_formula {
            return Err(Error::LinkConflict {
                path: link_path,
                existing_type: LinkConflictType::SymlinkToOther { target: current },
            });
        }

        replace_atomically(&link_path, target)?;
        info!(
            link = %link_path.display(),
            from = %current.display(),
            to = %target.display(),
            "replaced link"
        );
        Ok((
            LinkOutcome::Replaced,
            Some(LinkedFile {
                link_path,
                target_path: target.to_path_buf(),
                previous: Some(current),
            }),
        ))
    }

    /// Undo a link made by [`Linker::link`], restoring what it replaced.
    ///
    /// Leaves the path alone if someone else has re-pointed it since.
    pub fn rollback(&self, linked: &LinkedFile) -> Result<(), Error> {
        let link = linked
            .link_path
            .strip_prefix(&self.shared_bin)
            .unwrap_or(&linked.link_path);
        let _lock = self.lock(link)?;
        let Ok(current) = fs::read_link(&linked.link_path) else {
            return Ok(());
        };
        if resolve_link_target(&linked.link_path, &current) != linked.target_path {
            return Ok(());
        }
        match &linked.previous {
            Some(previous) => replace_atomically(&linked.link_path, previous),
            None => fs::remove_file(&linked.link_path).map_err(|e| Error::fs(&linked.link_path, e)),
        }
    }

    /// Exclusive lock on one link path, released on drop. Blocks.
    fn lock(&self, link: &Path) -> Result<File, Error> {
        let lock_path = self.locks_dir.join(lock_file_name(link));
        let file = File::create(&lock_path).map_err(|e| Error::fs(&lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| Error::fs(&lock_path, format!("failed to acquire lock: {e}")))?;
        Ok(file)
    }
}

/// `bin-<link>.lock` with `/` escaped, so nested names map one to one.
fn lock_file_name(link: &Path) -> String {
    let escaped = link
        .to_string_lossy()
        .replace('%', "%25")
        .replace(['/', '\\'], "%2F");
    format!("bin-{escaped}.lock")
}

fn resolve_link_target(link_path: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        link_path
            .parent()
            .map(|p| p.join(target))
            .unwrap_or_else(|| target.to_path_buf())
    }
}

/// Create the link under a temp name and rename it over `link_path`.
fn replace_atomically(link_path: &Path, target: &Path) -> Result<(), Error> {
    let file_name = link_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = NEXT_TMP.fetch_add(1, Ordering::Relaxed);
    let tmp = link_path.with_file_name(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));
    let _ = fs::remove_file(&tmp);

    make_symlink(target, &tmp)?;
    fs::rename(&tmp, link_path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::fs(link_path, e)
    })
}

#[cfg(unix)]
pub(crate) fn make_symlink(target: &Path, link: &Path) -> Result<(), Error> {
    std::os::unix::fs::symlink(target, link).map_err(|e| Error::fs(link, e))
}

#[cfg(not(unix))]
pub(crate) fn make_symlink(_target: &Path, link: &Path) -> Result<(), Error> {
    Err(Error::fs(link, "symlinks are not supported on this platform"))
}
