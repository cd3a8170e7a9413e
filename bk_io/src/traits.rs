//! Trait abstractions for I/O operations to enable mocking in tests.
//!
//! Network transfers and child processes are the two effects the engine
//! cannot perform deterministically in a unit test, so both sit behind a
//! trait with a real implementation and a `mockall` mock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Command;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
#[cfg(test)]
use mockall::automock;

use bk_core::Error;

/// Body of a successful GET, delivered in chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, Error>> + Send>>;

/// HTTP client trait for abstracting network operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Start a GET request; non-success statuses are errors.
    async fn get_stream(&self, url: &str) -> Result<ByteStream, Error>;
}

/// Real HTTP client implementation using reqwest.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("brewkit/0.1")
                .pool_max_idle_per_host(10)
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get_stream(&self, url: &str) -> Result<ByteStream, Error> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::NetworkFailure {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::NetworkFailure {
                message: format!("HTTP {} for {url}", response.status()),
            });
        }

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map(|b| b.to_vec()).map_err(|e| Error::NetworkFailure {
                message: e.to_string(),
            })
        });
        Ok(Box::pin(stream))
    }
}

/// A fully expanded external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// The complete child environment; nothing is inherited
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessRecord {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Process runner trait; the error case means the process never started.
#[cfg_attr(test, automock)]
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<ProcessRecord, Error>;
}

/// Runs processes with `std::process::Command` and a cleared environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdCommandRunner;

impl CommandRunner for StdCommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessRecord, Error> {
        let started = Instant::now();
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .env_clear()
            .envs(&invocation.env)
            .output()
            .map_err(|e| Error::Filesystem {
                path: PathBuf::from(&invocation.program),
                message: format!("failed to start process: {e}"),
            })?;

        Ok(ProcessRecord {
            argv: invocation.argv(),
            cwd: invocation.cwd.clone(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn invocation(program: &str, args: &[&str], cwd: PathBuf) -> Invocation {
        Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd,
            env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
        }
    }

    #[tokio::test]
    async fn mock_http_client_returns_error() {
        let mut mock = MockHttpClient::new();
        mock.expect_get_stream().returning(|_| {
            Err(Error::NetworkFailure {
                message: "connection timeout".into(),
            })
        });

        match mock.get_stream("https://example.com/file").await {
            Err(Error::NetworkFailure { message }) => assert!(message.contains("timeout")),
            _ => panic!("expected NetworkFailure"),
        }
    }

    #[tokio::test]
    async fn mock_http_client_streams_chunks() {
        let mut mock = MockHttpClient::new();
        mock.expect_get_stream()
            .withf(|url| url.starts_with("https://"))
            .times(1)
            .returning(|_| {
                let chunks = vec![Ok(b"hello ".to_vec()), Ok(b"world".to_vec())];
                Ok(Box::pin(futures::stream::iter(chunks)) as ByteStream)
            });

        let stream = mock.get_stream("https://example.com/file").await.unwrap();
        let body: Vec<Vec<u8>> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(body.concat(), b"hello world");
    }

    #[test]
    fn mock_command_runner_reports_failure() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(|inv| {
            Ok(ProcessRecord {
                argv: inv.argv(),
                cwd: inv.cwd.clone(),
                exit_code: Some(2),
                stdout: String::new(),
                stderr: "boom".to_string(),
                duration: Duration::ZERO,
            })
        });

        let record = mock
            .run(&invocation("make", &["install"], PathBuf::from("/tmp")))
            .unwrap();
        assert!(!record.success());
        assert_eq!(record.argv, vec!["make", "install"]);
    }

    #[cfg(unix)]
    #[test]
    fn std_runner_captures_output_and_exit_code() {
        let tmp = TempDir::new().unwrap();
        let record = StdCommandRunner
            .run(&invocation(
                "/bin/sh",
                &["-c", "pwd; echo oops >&2; exit 3"],
                tmp.path().to_path_buf(),
            ))
            .unwrap();

        assert_eq!(record.exit_code, Some(3));
        assert!(record.stdout.trim_end().ends_with(
            tmp.path().file_name().unwrap().to_str().unwrap()
        ));
        assert_eq!(record.stderr, "oops\n");
    }

    #[cfg(unix)]
    #[test]
    fn std_runner_does_not_inherit_environment() {
        let tmp = TempDir::new().unwrap();
        let mut inv = invocation("/bin/sh", &["-c", "env"], tmp.path().to_path_buf());
        inv.env.insert("ONLY_THIS".to_string(), "1".to_string());

        let record = StdCommandRunner.run(&inv).unwrap();
        let names: Vec<&str> = record
            .stdout
            .lines()
            .filter_map(|l| l.split('=').next())
            .filter(|n| !matches!(*n, "PWD" | "SHLVL" | "_" | "OLDPWD"))
            .collect();
        assert_eq!(names.len(), 2, "unexpected environment: {names:?}");
        assert!(names.contains(&"ONLY_THIS"));
        assert!(names.contains(&"PATH"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let result = StdCommandRunner.run(&invocation(
            "/nonexistent/definitely-not-here",
            &[],
            tmp.path().to_path_buf(),
        ));
        assert!(matches!(result, Err(Error::Filesystem { .. })));
    }
}
