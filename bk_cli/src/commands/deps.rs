//! Deps command implementation.

use console::style;

use bk_core::{Formula, InstallGraph, ResolveOptions, plan};
use bk_io::Layout;

use super::Session;
use crate::display::{format_tree_line, installed_marker, tree_child_prefix};

// ============================================================================
// Formatting helpers (pure functions for testability)
// ============================================================================

/// Format the header for deps command.
pub fn format_deps_header(formula: &str, tree: bool) -> String {
    let suffix = if tree { " (tree view)" } else { " (install order)" };
    format!(
        "{} Dependencies for {}{}:",
        style("==>").cyan().bold(),
        style(formula).bold(),
        suffix
    )
}

/// Format the "no dependencies" message.
pub fn format_no_deps_message(formula: &str) -> String {
    format!(
        "{} {} has no dependencies.",
        style("==>").cyan().bold(),
        style(formula).bold()
    )
}

/// `name pkg_version`, as shown in lists and trees.
pub fn format_label(formula: &Formula) -> String {
    format!("{} {}", formula.name, formula.pkg_version().keg_name())
}

/// Render the tree below `name` as lines, depth first in declaration order.
///
/// A formula reached through several parents is expanded each time it
/// appears; the graph is acyclic so this terminates.
pub fn tree_lines(
    graph: &InstallGraph<'_>,
    name: &str,
    is_installed: &dyn Fn(&Formula) -> bool,
) -> Vec<String> {
    let mut lines = Vec::new();
    push_tree(graph, name, is_installed, "", true, true, &mut lines);
    lines
}

fn push_tree(
    graph: &InstallGraph<'_>,
    name: &str,
    is_installed: &dyn Fn(&Formula) -> bool,
    prefix: &str,
    is_last: bool,
    is_root: bool,
    lines: &mut Vec<String>,
) {
    let Some(formula) = graph.get(name) else {
        return;
    };
    lines.push(format_tree_line(
        &format_label(formula),
        is_installed(formula),
        prefix,
        is_last,
        is_root,
    ));

    let child_prefix = tree_child_prefix(prefix, is_last, is_root);
    let mut children: Vec<&str> = graph.dependencies(name).iter().map(String::as_str).collect();
    if is_root {
        for dep in graph.test_dependencies() {
            if !children.contains(&dep.as_str()) {
                children.push(dep);
            }
        }
    }
    for (i, child) in children.iter().enumerate() {
        let last = i == children.len() - 1;
        push_tree(graph, child, is_installed, &child_prefix, last, false, lines);
    }
}

// ============================================================================
// Command implementations
// ============================================================================

/// Run the deps command.
pub fn run_deps(
    session: &Session,
    formula: &str,
    tree: bool,
    test: bool,
) -> Result<(), bk_core::Error> {
    let target = session.formula(formula)?;
    let options = ResolveOptions::for_platform(&session.platform).with_tests(test);
    let graph = plan(target, &session.universe, &options)?;
    let layout = session.layout();
    let is_installed = |f: &Formula| layout.is_installed(f);

    if graph.order().len() == 1 {
        println!("{}", format_no_deps_message(formula));
        return Ok(());
    }

    println!("{}", format_deps_header(formula, tree));
    println!();
    if tree {
        for line in tree_lines(&graph, formula, &is_installed) {
            println!("{line}");
        }
    } else {
        print_order(&graph, &layout);
    }
    Ok(())
}

fn print_order(graph: &InstallGraph<'_>, layout: &Layout) {
    for (i, formula) in graph.order().iter().enumerate() {
        println!(
            "  {:>3}. {} {}",
            i + 1,
            installed_marker(layout.is_installed(formula)),
            format_label(formula)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_core::{Dependency, DependencyKind, Universe};

    fn formula(name: &str, deps: Vec<Dependency>) -> Formula {
        Formula {
            name: name.to_string(),
            version: "1.0".to_string(),
            dependencies: deps,
            ..Default::default()
        }
    }

    fn universe(formulas: Vec<Formula>) -> Universe {
        formulas.into_iter().map(|f| (f.name.clone(), f)).collect()
    }

    fn strip(line: &str) -> String {
        console::strip_ansi_codes(line).to_string()
    }

    #[test]
    fn labels_include_revision() {
        let mut f = formula("zlib", vec![]);
        f.revision = 2;
        assert_eq!(format_label(&f), "zlib 1.0_2");
    }

    #[test]
    fn tree_nests_dependencies_in_declaration_order() {
        let universe = universe(vec![
            formula("zlib", vec![]),
            formula("openssl", vec![Dependency::runtime("zlib")]),
            formula("pcre", vec![]),
            formula(
                "app",
                vec![Dependency::runtime("openssl"), Dependency::build("pcre")],
            ),
        ]);
        let graph = plan(&universe["app"], &universe, &ResolveOptions::default()).unwrap();
        let lines: Vec<String> = tree_lines(&graph, "app", &|f| f.name == "zlib")
            .iter()
            .map(|l| strip(l))
            .collect();

        assert_eq!(
            lines,
            vec![
                "✗ app 1.0",
                "├── ✗ openssl 1.0",
                "│   └── ✓ zlib 1.0",
                "└── ✗ pcre 1.0",
            ]
        );
    }

    #[test]
    fn tree_shows_test_dependencies_under_the_root_only_when_requested() {
        let universe = universe(vec![
            formula("bats", vec![]),
            formula(
                "app",
                vec![Dependency::new("bats", &[DependencyKind::Test])],
            ),
        ]);

        let graph = plan(&universe["app"], &universe, &ResolveOptions::default()).unwrap();
        assert_eq!(tree_lines(&graph, "app", &|_| false).len(), 1);

        let options = ResolveOptions::default().with_tests(true);
        let graph = plan(&universe["app"], &universe, &options).unwrap();
        let lines: Vec<String> = tree_lines(&graph, "app", &|_| false)
            .iter()
            .map(|l| strip(l))
            .collect();
        assert_eq!(lines, vec!["✗ app 1.0", "└── ✗ bats 1.0"]);
    }

    #[test]
    fn header_names_the_view() {
        assert!(strip(&format_deps_header("wget", true)).ends_with("wget (tree view):"));
        assert!(strip(&format_deps_header("wget", false)).ends_with("wget (install order):"));
        assert!(strip(&format_no_deps_message("zlib")).contains("zlib has no dependencies"));
    }
}
