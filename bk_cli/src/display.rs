//! Display utilities for progress bars and formatting helpers.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bk_io::{ClosureReport, InstallEvent, NodeOutcome, ProgressCallback, TestResult};

/// Progress styles used by install and test runs.
pub struct ProgressStyles {
    pub spinner: ProgressStyle,
    pub done: ProgressStyle,
}

impl Default for ProgressStyles {
    fn default() -> Self {
        Self {
            spinner: ProgressStyle::default_spinner()
                .template("    {prefix:<16} {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            done: ProgressStyle::default_spinner()
                .template("    {prefix:<16} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        }
    }
}

pub type ProgressBars = Arc<Mutex<HashMap<String, ProgressBar>>>;

/// Render install events as one spinner line per formula.
pub fn create_progress_callback(
    multi: MultiProgress,
    styles: ProgressStyles,
) -> (ProgressCallback, ProgressBars) {
    let bars: ProgressBars = Arc::new(Mutex::new(HashMap::new()));
    let bars_clone = bars.clone();
    let spinner_style = styles.spinner;
    let done_style = styles.done;

    let callback: ProgressCallback = Arc::new(move |event: InstallEvent| {
        let Ok(mut bars) = bars_clone.lock() else {
            return;
        };
        let name = event.name().to_string();
        let pb = bars.entry(name.clone()).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(spinner_style.clone());
            pb.set_prefix(name);
            pb.enable_steady_tick(Duration::from_millis(80));
            pb
        });

        match event_message(&event) {
            EventMessage::Working(msg) => {
                pb.set_style(spinner_style.clone());
                pb.set_message(msg);
            }
            EventMessage::Done(msg) => {
                pb.set_style(done_style.clone());
                pb.finish_with_message(msg);
            }
        }
    });

    (callback, bars)
}

enum EventMessage {
    Working(String),
    Done(String),
}

fn event_message(event: &InstallEvent) -> EventMessage {
    use EventMessage::{Done, Working};
    match event {
        InstallEvent::FetchStarted { .. } => Working("downloading...".to_string()),
        InstallEvent::FetchCompleted { .. } => Working("downloaded".to_string()),
        InstallEvent::InstallStarted { from_source, .. } => Working(if *from_source {
            "building...".to_string()
        } else {
            "pouring...".to_string()
        }),
        InstallEvent::StepStarted {
            step,
            total,
            description,
            ..
        } => Working(format!("[{step}/{total}] {description}")),
        InstallEvent::TestStarted { .. } => Working("testing...".to_string()),
        InstallEvent::InstallCompleted { .. } => {
            Done(format!("{} installed", style("✓").green()))
        }
        InstallEvent::AlreadySatisfied { .. } => {
            Done(format!("{} already installed", style("✓").green()))
        }
        InstallEvent::Failed { .. } => Done(format!("{} failed", style("✗").red())),
        InstallEvent::Skipped { dependency, .. } => Done(format!(
            "{} skipped ({dependency} failed)",
            style("-").yellow()
        )),
        InstallEvent::TestCompleted { passed: true, .. } => {
            Done(format!("{} tests passed", style("✓").green()))
        }
        InstallEvent::TestCompleted { passed: false, .. } => {
            Done(format!("{} tests failed", style("✗").red()))
        }
    }
}

/// Finish any remaining progress bars.
pub fn finish_progress_bars(bars: &ProgressBars) {
    let Ok(bars) = bars.lock() else {
        return;
    };
    for pb in bars.values() {
        if !pb.is_finished() {
            pb.finish();
        }
    }
}

// ============================================================================
// Report formatting
// ============================================================================

/// Short, unstyled description of a node outcome.
pub fn format_outcome(outcome: &NodeOutcome) -> String {
    match outcome {
        NodeOutcome::Installed => "installed".to_string(),
        NodeOutcome::AlreadySatisfied => "already installed".to_string(),
        NodeOutcome::Failed { .. } => "failed".to_string(),
        NodeOutcome::SkippedDueToDependencyFailure { dependency } => {
            format!("skipped, dependency {dependency} failed")
        }
    }
}

/// Counts of each outcome, e.g. "2 installed, 1 already installed".
pub fn format_summary(report: &ClosureReport, elapsed_secs: f64) -> String {
    let count = |pred: fn(&NodeOutcome) -> bool| {
        report.nodes.iter().filter(|n| pred(&n.outcome)).count()
    };
    let installed = count(|o| matches!(o, NodeOutcome::Installed));
    let satisfied = count(|o| matches!(o, NodeOutcome::AlreadySatisfied));
    let failed = count(|o| matches!(o, NodeOutcome::Failed { .. }));
    let skipped = count(|o| matches!(o, NodeOutcome::SkippedDueToDependencyFailure { .. }));

    let mut parts = vec![format!("{installed} installed")];
    if satisfied > 0 {
        parts.push(format!("{satisfied} already installed"));
    }
    if failed > 0 {
        parts.push(format!("{failed} failed"));
    }
    if skipped > 0 {
        parts.push(format!("{skipped} skipped"));
    }
    format!("{} in {elapsed_secs:.2}s", parts.join(", "))
}

/// Print every failed node with its full error.
pub fn print_failures(report: &ClosureReport) {
    for node in &report.nodes {
        if let NodeOutcome::Failed { reason } = &node.outcome {
            eprintln!();
            eprintln!(
                "{} {} {}",
                style("==>").red().bold(),
                style(&node.name).bold(),
                style(&node.pkg_version).dim()
            );
            for line in reason.lines() {
                eprintln!("    {line}");
            }
        }
    }
}

pub fn print_test_result(name: &str, result: &TestResult) {
    if result.passed {
        println!(
            "{} Tests for {} passed",
            style("==>").cyan().bold(),
            style(name).green()
        );
        return;
    }
    println!(
        "{} Tests for {} failed",
        style("==>").red().bold(),
        style(name).bold()
    );
    for failure in &result.failures {
        println!("    step {}:", failure.step);
        println!("      expected: {}", failure.expected);
        println!("      actual:   {}", failure.actual.trim_end());
    }
}

// ============================================================================
// Dependency trees
// ============================================================================

/// Calculate the tree connector string based on position.
pub fn tree_connector(is_last: bool, is_root: bool) -> &'static str {
    if is_root {
        ""
    } else if is_last {
        "└── "
    } else {
        "├── "
    }
}

/// Calculate the prefix for child nodes.
pub fn tree_child_prefix(prefix: &str, is_last: bool, is_root: bool) -> String {
    if is_root {
        String::new()
    } else if is_last {
        format!("{prefix}    ")
    } else {
        format!("{prefix}│   ")
    }
}

/// Format the installed marker.
pub fn installed_marker(installed: bool) -> String {
    if installed {
        style("✓").green().to_string()
    } else {
        style("✗").red().to_string()
    }
}

/// Format a single tree line (without children).
pub fn format_tree_line(
    label: &str,
    installed: bool,
    prefix: &str,
    is_last: bool,
    is_root: bool,
) -> String {
    let connector = tree_connector(is_last, is_root);
    let marker = installed_marker(installed);
    format!("{prefix}{connector}{marker} {label}")
}
