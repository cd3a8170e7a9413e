pub mod bottle;
pub mod errors;
pub mod formula;
pub mod platform;
pub mod resolve;
pub mod version;

pub use bottle::{ArtifactPlan, select_artifact, source_artifact};
pub use errors::{Error, LinkConflictType, ResolutionError, VersionDemand};
pub use formula::{
    Assertion, BottleFile, BottleTable, Cellar, CommandSpec, Dependency, DependencyKind, Formula,
    InstallStep, LinkScope, SourceSpec, TestCommand, TestStep,
};
pub use platform::{Arch, OsFamily, PlatformFingerprint};
pub use resolve::{InstallGraph, ResolveOptions, Universe, plan, resolve};
pub use version::{PkgVersion, Version, VersionReq};
