//! Install and test command implementations.

use console::style;
use indicatif::MultiProgress;
use std::time::Instant;

use bk_io::{ClosureReport, InstallOptions, Installer, NodeOutcome};

use super::Session;
use crate::display::{
    ProgressStyles, create_progress_callback, finish_progress_bars, format_outcome,
    format_summary, print_failures, print_test_result,
};

/// Run the install command; `Ok(false)` when any node or test failed.
pub async fn run(
    session: &Session,
    formula: &str,
    options: &InstallOptions,
) -> Result<bool, bk_core::Error> {
    let target = session.formula(formula)?;
    let start = Instant::now();

    let label = if options.build_from_source {
        "Building"
    } else {
        "Installing"
    };
    println!(
        "{} {} {} {} for {}...",
        style("==>").cyan().bold(),
        label,
        style(&target.name).bold(),
        style(target.pkg_version().keg_name()).dim(),
        session.platform
    );

    let multi = MultiProgress::new();
    let (callback, bars) = create_progress_callback(multi, ProgressStyles::default());
    let installer = Installer::from_config(&session.config)?.with_progress(callback);

    let report = installer
        .install_closure(target, &session.universe, &session.platform, options)
        .await;
    finish_progress_bars(&bars);
    let report = report?;

    print_report(&report, start.elapsed().as_secs_f64());
    Ok(report.succeeded())
}

/// Run the test command: install what the tests need, then run them.
pub async fn run_test(session: &Session, formula: &str) -> Result<bool, bk_core::Error> {
    let options = InstallOptions {
        run_tests: true,
        ..Default::default()
    };
    run(session, formula, &options).await
}

fn print_report(report: &ClosureReport, elapsed_secs: f64) {
    println!();
    for node in &report.nodes {
        let marker = match node.outcome {
            NodeOutcome::Installed | NodeOutcome::AlreadySatisfied => style("✓").green(),
            NodeOutcome::Failed { .. } => style("✗").red(),
            NodeOutcome::SkippedDueToDependencyFailure { .. } => style("-").yellow(),
        };
        println!(
            "    {} {} {} {}",
            marker,
            style(&node.name).bold(),
            style(&node.pkg_version).dim(),
            format_outcome(&node.outcome)
        );
    }
    print_failures(report);

    if let Some(test) = &report.test {
        println!();
        print_test_result(&report.target, test);
    }

    println!();
    let arrow = if report.succeeded() {
        style("==>").cyan().bold()
    } else {
        style("==>").red().bold()
    };
    println!("{} {}", arrow, format_summary(report, elapsed_secs));
}
