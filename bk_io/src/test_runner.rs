//! Runs a formula's self-test against its installed prefix.
//!
//! Failed assertions, unexpected exit codes and commands that never start are
//! all recorded as [`TestFailure`]s. None of them stop later steps.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use bk_core::{Assertion, Formula, TestCommand, TestStep};

use crate::environment::BuildEnvironment;
use crate::traits::{CommandRunner, ProcessRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    /// 1-based test step number; 0 when the test directory could not be set up
    pub step: usize,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub passed: bool,
    pub failures: Vec<TestFailure>,
    pub records: Vec<ProcessRecord>,
}

impl TestResult {
    pub(crate) fn setup_failure(message: String) -> Self {
        Self {
            passed: false,
            failures: vec![TestFailure {
                step: 0,
                expected: "a usable test directory".to_string(),
                actual: message,
            }],
            records: Vec::new(),
        }
    }
}

pub struct TestRunner {
    runner: Arc<dyn CommandRunner>,
    env_allowlist: Arc<[String]>,
}

impl TestRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, env_allowlist: Arc<[String]>) -> Self {
        Self {
            runner,
            env_allowlist,
        }
    }

    /// Execute every test step of `formula` in a fresh scratch directory.
    ///
    /// `deps` maps runtime and test dependencies to their prefixes.
    pub fn run_tests(
        &self,
        formula: &Formula,
        prefix: &Path,
        deps: &BTreeMap<String, PathBuf>,
    ) -> TestResult {
        let testpath = match tempfile::Builder::new()
            .prefix(&format!("{}-test-", formula.name))
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => return TestResult::setup_failure(e.to_string()),
        };
        let env = BuildEnvironment::for_test(
            formula,
            prefix,
            testpath.path(),
            deps,
            &self.env_allowlist,
        );

        let mut result = TestResult::default();
        for (idx, step) in formula.test_steps.iter().enumerate() {
            let number = idx + 1;
            match step {
                TestStep::WriteFile { path, contents } => {
                    if let Err(actual) = write_fixture(&env, path, contents) {
                        result.failures.push(TestFailure {
                            step: number,
                            expected: format!("fixture '{path}' written"),
                            actual,
                        });
                    }
                }
                TestStep::Run(test) => self.run_step(number, test, &env, &mut result),
            }
        }

        result.passed = result.failures.is_empty();
        debug!(
            name = %formula.name,
            passed = result.passed,
            failures = result.failures.len(),
            "tests finished"
        );
        result
    }

    fn run_step(
        &self,
        number: usize,
        test: &TestCommand,
        env: &BuildEnvironment,
        result: &mut TestResult,
    ) {
        let invocation = match env.invocation(&test.command) {
            Ok(invocation) => invocation,
            Err(e) => {
                result.failures.push(TestFailure {
                    step: number,
                    expected: format!("runnable command '{}'", test.command),
                    actual: e.to_string(),
                });
                return;
            }
        };
        if let Err(e) = fs::create_dir_all(&invocation.cwd) {
            warn!(cwd = %invocation.cwd.display(), error = %e, "failed to create test cwd");
        }

        let record = match self.runner.run(&invocation) {
            Ok(record) => record,
            Err(e) => {
                result.failures.push(TestFailure {
                    step: number,
                    expected: format!("'{}' to start", invocation.command_line()),
                    actual: e.to_string(),
                });
                return;
            }
        };

        if record.success() != test.expect_success {
            let expected = if test.expect_success {
                "exit status 0"
            } else {
                "non-zero exit status"
            };
            let actual = match record.exit_code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            };
            result.failures.push(TestFailure {
                step: number,
                expected: expected.to_string(),
                actual,
            });
        }

        for assertion in &test.assertions {
            if let Some((expected, actual)) = check(assertion, env, &record.stdout) {
                result.failures.push(TestFailure {
                    step: number,
                    expected,
                    actual,
                });
            }
        }
        result.records.push(record);
    }
}

fn write_fixture(env: &BuildEnvironment, path: &str, contents: &str) -> Result<(), String> {
    let path = env.confined(env.workdir(), path).map_err(|e| e.to_string())?;
    let contents = env.expand(contents).map_err(|e| e.to_string())?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::write(&path, contents).map_err(|e| e.to_string())
}

/// Evaluate one assertion; `Some((expected, actual))` on failure.
fn check(assertion: &Assertion, env: &BuildEnvironment, stdout: &str) -> Option<(String, String)> {
    let expand = |value: &str| env.expand(value);
    match assertion {
        Assertion::Contains { value } => {
            let value = match expand(value) {
                Ok(v) => v,
                Err(e) => return Some((format!("output containing '{value}'"), e.to_string())),
            };
            (!stdout.contains(&value))
                .then(|| (format!("output containing '{value}'"), stdout.to_string()))
        }
        Assertion::Equals { value } => {
            let value = match expand(value) {
                Ok(v) => v,
                Err(e) => return Some((value.clone(), e.to_string())),
            };
            let trimmed = strip_trailing_newline(stdout);
            (trimmed != value).then(|| (value, trimmed.to_string()))
        }
        Assertion::Matches { pattern } => match Regex::new(pattern) {
            Ok(re) => (!re.is_match(stdout))
                .then(|| (format!("output matching /{pattern}/"), stdout.to_string())),
            Err(e) => Some((format!("valid pattern /{pattern}/"), e.to_string())),
        },
        Assertion::Line { index, equals } => {
            let equals = match expand(equals) {
                Ok(v) => v,
                Err(e) => return Some((equals.clone(), e.to_string())),
            };
            match stdout.lines().nth(*index) {
                Some(line) if line == equals => None,
                Some(line) => Some((format!("line {index}: {equals}"), line.to_string())),
                None => Some((
                    format!("line {index}: {equals}"),
                    format!("only {} lines of output", stdout.lines().count()),
                )),
            }
        }
    }
}

fn strip_trailing_newline(s: &str) -> &str {
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockCommandRunner, StdCommandRunner};
    use bk_core::{CommandSpec, Error};
    use std::time::Duration;
    use tempfile::TempDir;

    fn formula_with(steps: Vec<TestStep>) -> Formula {
        Formula {
            name: "hello".to_string(),
            version: "2.12".to_string(),
            test_steps: steps,
            ..Default::default()
        }
    }

    fn run(program: &str, args: &[&str], assertions: Vec<Assertion>) -> TestStep {
        TestStep::Run(TestCommand {
            command: CommandSpec::new(program, args),
            expect_success: true,
            assertions,
        })
    }

    fn record(exit_code: Option<i32>, stdout: &str) -> ProcessRecord {
        ProcessRecord {
            argv: vec!["hello".to_string()],
            cwd: PathBuf::from("/"),
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        }
    }

    fn runner_with(mock: MockCommandRunner) -> TestRunner {
        TestRunner::new(Arc::new(mock), Arc::from(Vec::<String>::new()))
    }

    #[test]
    fn all_assertions_pass() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(|_| Ok(record(Some(0), "Hello, world!\nsecond\n")));
        let formula = formula_with(vec![run(
            "{bin}/hello",
            &[],
            vec![
                Assertion::Contains {
                    value: "world".to_string(),
                },
                Assertion::Equals {
                    value: "Hello, world!\nsecond".to_string(),
                },
                Assertion::Matches {
                    pattern: r"^Hello, \w+!".to_string(),
                },
                Assertion::Line {
                    index: 1,
                    equals: "second".to_string(),
                },
            ],
        )]);

        let result =
            runner_with(mock).run_tests(&formula, Path::new("/opt/hello"), &BTreeMap::new());
        assert!(result.passed, "{:?}", result.failures);
        assert_eq!(result.records.len(), 1);
    }

    #[test]
    fn every_failing_assertion_is_reported() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(|_| Ok(record(Some(0), "Hello\n")));
        let formula = formula_with(vec![run(
            "hello",
            &[],
            vec![
                Assertion::Contains {
                    value: "Goodbye".to_string(),
                },
                Assertion::Equals {
                    value: "Hello".to_string(),
                },
                Assertion::Line {
                    index: 3,
                    equals: "x".to_string(),
                },
            ],
        )]);

        let result =
            runner_with(mock).run_tests(&formula, Path::new("/opt/hello"), &BTreeMap::new());
        assert!(!result.passed);
        assert_eq!(result.failures.len(), 2);
        assert!(result.failures.iter().all(|f| f.step == 1));
        assert!(result.failures[0].expected.contains("Goodbye"));
    }

    #[test]
    fn crashes_do_not_stop_later_steps() {
        let mut mock = MockCommandRunner::new();
        let mut calls = 0;
        mock.expect_run().times(3).returning(move |inv| {
            calls += 1;
            match calls {
                1 => Err(Error::Filesystem {
                    path: PathBuf::from(&inv.program),
                    message: "No such file or directory".to_string(),
                }),
                2 => Ok(record(Some(2), "")),
                _ => Ok(record(Some(0), "ok\n")),
            }
        });
        let formula = formula_with(vec![
            run("missing", &[], vec![]),
            run("crashes", &[], vec![]),
            run(
                "works",
                &[],
                vec![Assertion::Equals {
                    value: "ok".to_string(),
                }],
            ),
        ]);

        let result =
            runner_with(mock).run_tests(&formula, Path::new("/opt/hello"), &BTreeMap::new());
        assert!(!result.passed);
        let steps: Vec<usize> = result.failures.iter().map(|f| f.step).collect();
        assert_eq!(steps, vec![1, 2]);
        assert_eq!(result.failures[1].actual, "exit status 2");
    }

    #[test]
    fn expected_failure_is_a_pass() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(|_| Ok(record(Some(1), "usage\n")));
        let formula = formula_with(vec![TestStep::Run(TestCommand {
            command: CommandSpec::new("hello", &["--bogus"]),
            expect_success: false,
            assertions: vec![Assertion::Contains {
                value: "usage".to_string(),
            }],
        })]);

        let result =
            runner_with(mock).run_tests(&formula, Path::new("/opt/hello"), &BTreeMap::new());
        assert!(result.passed);
    }

    #[test]
    fn invalid_pattern_is_a_failure() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(|_| Ok(record(Some(0), "x")));
        let formula = formula_with(vec![run(
            "hello",
            &[],
            vec![Assertion::Matches {
                pattern: "(".to_string(),
            }],
        )]);

        let result =
            runner_with(mock).run_tests(&formula, Path::new("/opt/hello"), &BTreeMap::new());
        assert!(!result.passed);
        assert!(result.failures[0].expected.contains("valid pattern"));
    }

    #[test]
    fn commands_see_expanded_placeholders() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|inv| inv.program == "/opt/hello/bin/hello" && inv.env.contains_key("PATH"))
            .returning(|_| Ok(record(Some(0), "")));
        let formula = formula_with(vec![run("{bin}/hello", &[], vec![])]);

        let result =
            runner_with(mock).run_tests(&formula, Path::new("/opt/hello"), &BTreeMap::new());
        assert!(result.passed);
    }

    #[cfg(unix)]
    #[test]
    fn runs_real_commands_in_testpath() {
        let prefix = TempDir::new().unwrap();
        let formula = formula_with(vec![
            TestStep::WriteFile {
                path: "input.txt".to_string(),
                contents: "brewkit {version}\n".to_string(),
            },
            run(
                "/bin/sh",
                &["-c", "cat input.txt && cat {testpath}/input.txt"],
                vec![
                    Assertion::Line {
                        index: 0,
                        equals: "brewkit 2.12".to_string(),
                    },
                    Assertion::Line {
                        index: 1,
                        equals: "brewkit {version}".to_string(),
                    },
                ],
            ),
        ]);
        let runner = TestRunner::new(Arc::new(StdCommandRunner), Arc::from(Vec::<String>::new()));

        let result = runner.run_tests(&formula, prefix.path(), &BTreeMap::new());
        assert!(result.passed, "{:?}", result.failures);
    }
}
