pub mod blob;
pub mod config;
pub mod environment;
pub mod extract;
pub mod fetch;
pub mod install;
pub mod layout;
pub mod link;
pub mod manifest;
pub mod progress;
pub mod test_runner;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use blob::BlobCache;
pub use config::{EngineConfig, RetryPolicy};
pub use environment::{BuildEnvironment, Placeholders};
pub use extract::extract_archive;
pub use fetch::{FetchRequest, Fetcher};
pub use install::{
    ClosureReport, InstallOptions, InstallOutcome, InstallReport, Installer, NodeOutcome,
    NodeReport,
};
pub use layout::{InstallReceipt, Layout, RECEIPT_FILE};
pub use link::{LinkOutcome, Linker};
pub use manifest::{load_formula, load_universe};
pub use progress::{InstallEvent, ProgressCallback};
pub use test_runner::{TestFailure, TestResult, TestRunner};
pub use traits::{
    CommandRunner, HttpClient, Invocation, ProcessRecord, ReqwestHttpClient, StdCommandRunner,
};
