//! Test utilities for brewkit
//!
//! Shared infrastructure for unit tests in this crate and the integration
//! tests of `bk_cli` (behind the `test-utils` feature):
//!
//! - `TestContext` - Wraps TempDir, MockServer, config and Installer setup
//! - Archive fixtures - Bottle and source tarballs built in memory
//! - Formula fixtures - Bottled and source-only manifests served by the mock server
//!
//! # Example
//!
//! ```ignore
//! use bk_io::test_utils::{TestContext, test_platform};
//!
//! #[tokio::test]
//! async fn installs_a_bottle() {
//!     let ctx = TestContext::new().await;
//!     let hello = ctx.bottled_formula("hello", "2.12", &[]).await;
//!     let universe = TestContext::universe([hello.clone()]);
//!
//!     let report = ctx
//!         .installer()
//!         .install_closure(&hello, &universe, &test_platform(), &Default::default())
//!         .await
//!         .unwrap();
//!     assert!(report.succeeded());
//! }
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bk_core::{
    Arch, BottleFile, BottleTable, Dependency, Formula, InstallStep, LinkScope,
    PlatformFingerprint, SourceSpec, Universe,
};

use crate::config::{EngineConfig, RetryPolicy};
use crate::install::Installer;
use crate::progress::{InstallEvent, ProgressCallback};

pub use crate::blob::sha256_hex;

// ============================================================================
// Platform helpers
// ============================================================================

/// The fingerprint every fixture bottle is tagged for.
pub fn test_platform() -> PlatformFingerprint {
    PlatformFingerprint::linux(Arch::X86_64)
}

// ============================================================================
// Archive fixtures
// ============================================================================

/// Gzipped tar of `files` (relative path, content, mode) under `top`.
pub fn tarball(top: &str, files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for (rel_path, content, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(format!("{top}/{rel_path}")).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append(&header, *content).unwrap();
    }

    let tar_data = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_data).unwrap();
    encoder.finish().unwrap()
}

/// A bottle laid out as `<name>/<version>/...`.
pub fn bottle_tarball(name: &str, version: &str, files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    tarball(&format!("{name}/{version}"), files)
}

/// A bottle holding one executable `bin/<name>` that prints its name.
pub fn simple_bottle(name: &str, version: &str) -> Vec<u8> {
    let script = format!("#!/bin/sh\necho {name}\n");
    bottle_tarball(name, version, &[(&format!("bin/{name}"), script.as_bytes(), 0o755)])
}

/// A source release laid out as `<name>-<version>/...`.
pub fn source_tarball(name: &str, version: &str, files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    tarball(&format!("{name}-{version}"), files)
}

// ============================================================================
// Formula fixtures
// ============================================================================

/// A manifest with only a name, version and runtime dependencies.
pub fn formula(name: &str, version: &str, deps: &[&str]) -> Formula {
    Formula {
        name: name.to_string(),
        version: version.to_string(),
        dependencies: deps.iter().map(|d| Dependency::runtime(d)).collect(),
        ..Default::default()
    }
}

/// Link `bin/<name>` into the shared bin directory.
pub fn link_step(name: &str) -> InstallStep {
    InstallStep::Symlink {
        target: format!("bin/{name}"),
        link: name.to_string(),
        scope: LinkScope::SharedBin,
    }
}

// ============================================================================
// TestContext
// ============================================================================

/// A temp install root plus a mock server for artifacts.
pub struct TestContext {
    pub tmp: TempDir,
    pub server: MockServer,
    pub config: EngineConfig,
    events: Arc<Mutex<Vec<InstallEvent>>>,
}

impl TestContext {
    pub async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let server = MockServer::start().await;
        let mut config = EngineConfig::with_root(tmp.path().join("brewkit"));
        config.retry = RetryPolicy::none();
        config.jobs = 4;

        Self {
            tmp,
            server,
            config,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn install_root(&self) -> PathBuf {
        self.config.install_root()
    }

    pub fn shared_bin(&self) -> PathBuf {
        self.config.shared_bin()
    }

    /// Installer with real HTTP and processes, recording progress events.
    pub fn installer(&self) -> Installer {
        let events = self.events.clone();
        let progress: ProgressCallback = Arc::new(move |event| {
            events.lock().unwrap().push(event);
        });
        Installer::from_config(&self.config)
            .unwrap()
            .with_progress(progress)
    }

    pub fn events(&self) -> Vec<InstallEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Serve `body` at `url_path` and return its full URL.
    pub async fn serve(&self, url_path: &str, body: Vec<u8>) -> String {
        Mock::given(method("GET"))
            .and(path(url_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&self.server)
            .await;
        format!("{}{url_path}", self.server.uri())
    }

    /// Serve `status` at `url_path` and return its full URL.
    pub async fn serve_status(&self, url_path: &str, status: u16) -> String {
        Mock::given(method("GET"))
            .and(path(url_path))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
        format!("{}{url_path}", self.server.uri())
    }

    /// A formula with a served bottle for [`test_platform`] that links `bin/<name>`.
    pub async fn bottled_formula(&self, name: &str, version: &str, deps: &[&str]) -> Formula {
        let bottle = simple_bottle(name, version);
        let sha = sha256_hex(&bottle);
        let url = self
            .serve(&format!("/bottles/{name}-{version}.tar.gz"), bottle)
            .await;

        let mut formula = formula(name, version, deps);
        formula.bottle = bottle_table(&sha, &url);
        formula.install_steps = vec![link_step(name)];
        formula
    }

    /// A formula whose bottle is served with the wrong checksum.
    pub async fn corrupt_bottled_formula(
        &self,
        name: &str,
        version: &str,
        deps: &[&str],
    ) -> Formula {
        let bottle = simple_bottle(name, version);
        let url = self
            .serve(&format!("/bottles/{name}-{version}.tar.gz"), bottle)
            .await;

        let mut formula = formula(name, version, deps);
        formula.bottle = bottle_table(&"0".repeat(64), &url);
        formula
    }

    /// A source-only formula; the archive holds `files` under `<name>-<version>/`.
    pub async fn source_formula(
        &self,
        name: &str,
        version: &str,
        files: &[(&str, &[u8], u32)],
        steps: Vec<InstallStep>,
    ) -> Formula {
        let archive = source_tarball(name, version, files);
        let sha = sha256_hex(&archive);
        let url = self
            .serve(&format!("/src/{name}-{version}.tar.gz"), archive)
            .await;

        let mut formula = formula(name, version, &[]);
        formula.source = Some(SourceSpec { url, sha256: sha });
        formula.install_steps = steps;
        formula
    }

    pub fn universe(formulas: impl IntoIterator<Item = Formula>) -> Universe {
        formulas.into_iter().map(|f| (f.name.clone(), f)).collect()
    }
}

/// Bottle table with one file for [`test_platform`].
pub fn bottle_table(sha: &str, url: &str) -> BottleTable {
    let mut table = BottleTable::default();
    table.files.insert(
        test_platform().tag(),
        BottleFile {
            sha256: sha.to_string(),
            cellar: Default::default(),
            url: Some(url.to_string()),
        },
    );
    table
}
