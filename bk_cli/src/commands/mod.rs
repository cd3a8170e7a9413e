//! Command implementations for the brewkit CLI.
//!
//! Each submodule handles a specific command or group of related commands.

pub mod deps;
pub mod info;
pub mod install;

use bk_core::{Error, Formula, PlatformFingerprint, ResolutionError, Universe};
use bk_io::{EngineConfig, Layout};

/// Everything a command needs: configuration, manifests and the platform.
pub struct Session {
    pub config: EngineConfig,
    pub universe: Universe,
    pub platform: PlatformFingerprint,
}

impl Session {
    pub fn formula(&self, name: &str) -> Result<&Formula, Error> {
        self.universe.get(name).ok_or_else(|| {
            Error::Resolution(ResolutionError::MissingDependency {
                name: name.to_string(),
                path: vec![name.to_string()],
            })
        })
    }

    /// Read-only view of the install root.
    pub fn layout(&self) -> Layout {
        Layout::inspect(&self.config.install_root())
    }
}
