//! Info and bottle command implementations.

use console::style;
use serde_json::{Value, json};

use bk_core::{ArtifactPlan, Dependency, Formula, PlatformFingerprint, select_artifact};
use bk_io::InstallReceipt;
use bk_io::layout::ArtifactKind;

use super::Session;
use crate::display::installed_marker;

/// Run the bottle command: show which artifact this platform would install.
pub fn run_bottle(session: &Session, formula: &str) -> Result<(), bk_core::Error> {
    let formula = session.formula(formula)?;
    let artifact = select_artifact(formula, &session.platform)?;

    println!(
        "{} {} {} on {}",
        style("==>").cyan().bold(),
        style(&formula.name).bold(),
        style(formula.pkg_version().keg_name()).dim(),
        session.platform
    );
    for line in format_artifact_lines(&artifact, &session.platform) {
        println!("  {line}");
    }
    Ok(())
}

/// Unstyled description of an artifact plan.
pub fn format_artifact_lines(
    artifact: &ArtifactPlan,
    platform: &PlatformFingerprint,
) -> Vec<String> {
    match artifact {
        ArtifactPlan::UseBottle {
            tag,
            sha256,
            url,
            cellar,
        } => {
            let mut kind = format!("bottle {tag}");
            if *tag != platform.tag() {
                kind.push_str(&format!(" (fallback for {})", platform.tag()));
            }
            vec![
                kind,
                format!("url:    {url}"),
                format!("sha256: {sha256}"),
                format!("cellar: {}", String::from(cellar.clone())),
            ]
        }
        ArtifactPlan::BuildFromSource { sha256, url } => vec![
            format!("source build (no bottle for {})", platform.tag()),
            format!("url:    {url}"),
            format!("sha256: {sha256}"),
        ],
    }
}

/// Run the info command.
pub fn run_info(session: &Session, formula: &str, json: bool) -> Result<(), bk_core::Error> {
    let formula = session.formula(formula)?;
    let layout = session.layout();
    let receipt = layout.read_receipt(&layout.prefix_for(formula));

    if json {
        let info = build_info_json(formula, receipt.as_ref(), &session.platform);
        let text = serde_json::to_string_pretty(&info).map_err(|e| bk_core::Error::Config {
            message: format!("failed to serialize info: {e}"),
        })?;
        println!("{text}");
        return Ok(());
    }

    println!(
        "{} {} {}",
        style("==>").cyan().bold(),
        style(&formula.name).bold(),
        style(formula.pkg_version().keg_name()).dim()
    );
    if let Some(desc) = &formula.desc {
        println!("{}", style(desc).dim());
    }
    if let Some(homepage) = &formula.homepage {
        println!("{}", style(homepage).cyan().underlined());
    }
    println!();

    match &receipt {
        Some(receipt) => println!(
            "{} {}",
            style("Installed:").dim(),
            style(format_receipt(receipt)).green()
        ),
        None => println!("{} Not installed", style("Installed:").dim()),
    }
    if let Some(license) = &formula.license {
        println!("{} {}", style("License:").dim(), license);
    }

    let tags: Vec<&str> = formula.bottle.files.keys().map(String::as_str).collect();
    let bottles = if tags.is_empty() {
        "none".to_string()
    } else {
        tags.join(", ")
    };
    println!("{} {}", style("Bottles:").dim(), bottles);
    if formula.source.is_some() {
        println!("{} available", style("Source:").dim());
    }

    if !formula.dependencies.is_empty() {
        println!();
        println!("{}", style("Dependencies:").dim());
        for dep in &formula.dependencies {
            let installed = session
                .universe
                .get(&dep.name)
                .is_some_and(|f| layout.is_installed(f));
            println!("  {} {}", installed_marker(installed), format_dependency(dep));
        }
    }
    Ok(())
}

/// `name (>= 3, build, runtime, macos only)` style summary of a declaration.
pub fn format_dependency(dep: &Dependency) -> String {
    let mut notes: Vec<String> = Vec::new();
    if let Some(version) = &dep.version {
        notes.push(version.clone());
    }
    notes.extend(dep.kinds.iter().map(ToString::to_string));
    if let Some(os) = dep.os {
        notes.push(format!("{os} only"));
    }
    format!("{} ({})", dep.name, notes.join(", "))
}

/// `1.2.3 (bottle arm64_sonoma)` or `1.2.3 (built from source)`.
pub fn format_receipt(receipt: &InstallReceipt) -> String {
    let version = if receipt.revision > 0 {
        format!("{}_{}", receipt.version, receipt.revision)
    } else {
        receipt.version.clone()
    };
    match &receipt.artifact {
        ArtifactKind::Bottle { tag } => format!("{version} (bottle {tag})"),
        ArtifactKind::Source => format!("{version} (built from source)"),
    }
}

pub fn build_info_json(
    formula: &Formula,
    receipt: Option<&InstallReceipt>,
    platform: &PlatformFingerprint,
) -> Value {
    let dependencies: Vec<Value> = formula
        .dependencies
        .iter()
        .map(|dep| {
            json!({
                "name": dep.name,
                "kinds": dep.kinds,
                "version": dep.version,
                "os": dep.os,
            })
        })
        .collect();

    let artifact = match select_artifact(formula, platform) {
        Ok(ArtifactPlan::UseBottle { tag, url, .. }) => {
            json!({ "kind": "bottle", "tag": tag, "url": url })
        }
        Ok(ArtifactPlan::BuildFromSource { url, .. }) => json!({ "kind": "source", "url": url }),
        Err(_) => Value::Null,
    };

    json!({
        "name": formula.name,
        "version": formula.version,
        "revision": formula.revision,
        "pkg_version": formula.pkg_version().to_string(),
        "desc": formula.desc,
        "homepage": formula.homepage,
        "license": formula.license,
        "dependencies": dependencies,
        "bottles": formula.bottle.files.keys().collect::<Vec<_>>(),
        "artifact": artifact,
        "installed": receipt,
    })
}
