//! Dependency resolution using a post-order depth-first traversal.
//!
//! Starting from the target, every in-scope dependency edge is followed in
//! declaration order and a formula is emitted only after all of its own
//! dependencies have been emitted. The result is a topological install order
//! that is fully determined by the manifests.
//!
//! # Edge scope
//!
//! - `build` and `runtime` edges are always followed
//! - `test` edges are followed for the target only, and only when requested
//! - `recommended` / `optional` edges are followed only when requested
//! - declarations guarded to another OS family are ignored
//!
//! # Failures
//!
//! A formula revisited while it is still on the traversal stack closes a
//! cycle. A name missing from the universe, or version requirements that
//! cannot all hold, abort resolution instead of being papered over.

use std::collections::{BTreeMap, HashMap};

use crate::errors::{ResolutionError, VersionDemand};
use crate::formula::{Dependency, DependencyKind};
use crate::platform::{OsFamily, PlatformFingerprint};
use crate::version::VersionReq;
use crate::Formula;

/// Every formula the resolver may draw from, keyed by name.
pub type Universe = BTreeMap<String, Formula>;

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// OS family used to evaluate guarded declarations; guarded
    /// declarations are skipped when unset
    pub os: Option<OsFamily>,
    /// Follow the target's `test` dependencies
    pub include_test: bool,
    pub include_recommended: bool,
    pub include_optional: bool,
}

impl ResolveOptions {
    pub fn for_platform(platform: &PlatformFingerprint) -> Self {
        Self {
            os: Some(platform.os),
            ..Default::default()
        }
    }

    pub fn with_tests(mut self, include: bool) -> Self {
        self.include_test = include;
        self
    }

    fn follows(&self, dep: &Dependency, is_target: bool) -> bool {
        let os_ok = match (dep.os, self.os) {
            (None, _) => true,
            (Some(only), Some(os)) => only == os,
            (Some(_), None) => false,
        };
        os_ok && dep.kinds.iter().any(|kind| self.follows_kind(*kind, is_target))
    }

    fn follows_kind(&self, kind: DependencyKind, is_target: bool) -> bool {
        match kind {
            DependencyKind::Build | DependencyKind::Runtime => true,
            DependencyKind::Test => is_target && self.include_test,
            DependencyKind::Recommended => self.include_recommended,
            DependencyKind::Optional => self.include_optional,
        }
    }

    /// Edges the dependent must wait on before it can be installed.
    fn is_install_edge(&self, dep: &Dependency) -> bool {
        dep.kinds
            .iter()
            .any(|kind| *kind != DependencyKind::Test && self.follows_kind(*kind, false))
    }

    /// Edges the dependent still needs once installed, so not build-only.
    fn is_runtime_edge(&self, dep: &Dependency) -> bool {
        dep.kinds.iter().any(|kind| {
            !matches!(kind, DependencyKind::Build | DependencyKind::Test)
                && self.follows_kind(*kind, false)
        })
    }
}

/// A resolved install plan: the order plus the edges between its nodes.
#[derive(Debug, Clone)]
pub struct InstallGraph<'a> {
    target: String,
    order: Vec<&'a Formula>,
    /// name -> names it must wait for before installing
    install_edges: BTreeMap<String, Vec<String>>,
    /// name -> names it needs at run time, a subset of `install_edges`
    runtime_edges: BTreeMap<String, Vec<String>>,
    /// names (build/runtime) whose prefixes must be visible when testing the target
    test_dependencies: Vec<String>,
}

impl<'a> InstallGraph<'a> {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Formulas in install order, dependencies first.
    pub fn order(&self) -> &[&'a Formula] {
        &self.order
    }

    pub fn into_order(self) -> Vec<&'a Formula> {
        self.order
    }

    pub fn get(&self, name: &str) -> Option<&'a Formula> {
        self.order.iter().copied().find(|f| f.name == name)
    }

    /// Direct install dependencies of `name`.
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.install_edges
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Direct test dependencies of the target.
    pub fn test_dependencies(&self) -> &[String] {
        &self.test_dependencies
    }

    /// Transitive install dependencies of `name`, in install order.
    pub fn closure_of(&self, name: &str) -> Vec<&'a Formula> {
        self.transitive(name, &self.install_edges)
    }

    /// Transitive run-time dependencies of `name`, in install order.
    ///
    /// Build-only edges are not followed at any depth.
    pub fn runtime_closure_of(&self, name: &str) -> Vec<&'a Formula> {
        self.transitive(name, &self.runtime_edges)
    }

    fn transitive(&self, name: &str, edges: &BTreeMap<String, Vec<String>>) -> Vec<&'a Formula> {
        let mut wanted = std::collections::HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            for dep in edges.get(&current).into_iter().flatten() {
                if wanted.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }
        self.order
            .iter()
            .copied()
            .filter(|f| wanted.contains(&f.name))
            .collect()
    }
}

/// Resolve the dependency closure of `target` into install order.
///
/// # Errors
/// - `Cycle` naming every formula on the cycle, first one repeated last
/// - `MissingDependency` with the path from the target to the missing name
/// - `VersionConflict` when requirements on one name cannot all hold
pub fn resolve<'a>(
    target: &'a Formula,
    universe: &'a Universe,
    options: &ResolveOptions,
) -> Result<Vec<&'a Formula>, ResolutionError> {
    plan(target, universe, options).map(InstallGraph::into_order)
}

/// Like [`resolve`], but keeps the edges for scheduling.
pub fn plan<'a>(
    target: &'a Formula,
    universe: &'a Universe,
    options: &ResolveOptions,
) -> Result<InstallGraph<'a>, ResolutionError> {
    let mut walker = Walker {
        target,
        universe,
        options,
        marks: HashMap::new(),
        stack: Vec::new(),
        order: Vec::new(),
        install_edges: BTreeMap::new(),
        runtime_edges: BTreeMap::new(),
        demands: HashMap::new(),
    };
    walker.visit(&target.name)?;

    let test_dependencies = if options.include_test {
        unique_names(
            target
                .dependencies
                .iter()
                .filter(|d| d.has_kind(DependencyKind::Test) && options.follows(d, true)),
        )
    } else {
        Vec::new()
    };

    Ok(InstallGraph {
        target: target.name.clone(),
        order: walker.order,
        install_edges: walker.install_edges,
        runtime_edges: walker.runtime_edges,
        test_dependencies,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

struct Walker<'a, 'o> {
    target: &'a Formula,
    universe: &'a Universe,
    options: &'o ResolveOptions,
    marks: HashMap<String, Mark>,
    stack: Vec<String>,
    order: Vec<&'a Formula>,
    install_edges: BTreeMap<String, Vec<String>>,
    runtime_edges: BTreeMap<String, Vec<String>>,
    /// name -> requirements recorded so far
    demands: HashMap<String, Vec<(VersionDemand, VersionReq)>>,
}

impl<'a> Walker<'a, '_> {
    fn lookup(&self, name: &str) -> Option<&'a Formula> {
        if name == self.target.name {
            Some(self.target)
        } else {
            self.universe.get(name)
        }
    }

    fn visit(&mut self, name: &str) -> Result<(), ResolutionError> {
        match self.marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::OnStack) => {
                let start = self.stack.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle = self.stack[start..].to_vec();
                cycle.push(name.to_string());
                return Err(ResolutionError::Cycle { cycle });
            }
            None => {}
        }

        let Some(formula) = self.lookup(name) else {
            let mut path = self.stack.clone();
            path.push(name.to_string());
            return Err(ResolutionError::MissingDependency {
                name: name.to_string(),
                path,
            });
        };

        self.marks.insert(name.to_string(), Mark::OnStack);
        self.stack.push(name.to_string());

        let is_target = self.stack.len() == 1;
        let deps: Vec<&Dependency> = formula
            .dependencies
            .iter()
            .filter(|d| self.options.follows(d, is_target))
            .collect();

        for dep in &deps {
            self.record_demand(formula, dep)?;
            self.visit(&dep.name)?;
        }

        let edges = unique_names(deps.iter().copied().filter(|d| self.options.is_install_edge(d)));
        self.install_edges.insert(name.to_string(), edges);
        let runtime =
            unique_names(deps.iter().copied().filter(|d| self.options.is_runtime_edge(d)));
        self.runtime_edges.insert(name.to_string(), runtime);

        self.stack.pop();
        self.marks.insert(name.to_string(), Mark::Done);
        self.order.push(formula);
        Ok(())
    }

    fn record_demand(
        &mut self,
        dependent: &Formula,
        dep: &Dependency,
    ) -> Result<(), ResolutionError> {
        let Some(requirement) = dep.requirement() else {
            return Ok(());
        };

        let demand = VersionDemand {
            required_by: dependent.name.clone(),
            requirement: requirement.to_string(),
        };
        let available = self.lookup(&dep.name).map(|f| f.parsed_version());
        let previous = self.demands.entry(dep.name.clone()).or_default();

        let clashes = previous
            .iter()
            .any(|(_, earlier)| !earlier.is_compatible_with(&requirement));
        let unsatisfied = available
            .as_ref()
            .is_some_and(|version| !requirement.matches(version));

        previous.push((demand, requirement));

        if clashes || unsatisfied {
            return Err(ResolutionError::VersionConflict {
                name: dep.name.clone(),
                available: available.map(|v| v.to_string()),
                demands: previous.iter().map(|(d, _)| d.clone()).collect(),
            });
        }
        Ok(())
    }
}

fn unique_names<'d>(deps: impl Iterator<Item = &'d Dependency>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for dep in deps {
        if !names.contains(&dep.name) {
            names.push(dep.name.clone());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Arch;
    use proptest::prelude::*;

    fn formula(name: &str, deps: &[&str]) -> Formula {
        formula_with(name, deps.iter().map(|d| Dependency::runtime(d)).collect())
    }

    fn formula_with(name: &str, dependencies: Vec<Dependency>) -> Formula {
        Formula {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            dependencies,
            ..Default::default()
        }
    }

    fn universe(formulas: Vec<Formula>) -> Universe {
        formulas.into_iter().map(|f| (f.name.clone(), f)).collect()
    }

    fn names(order: &[&Formula]) -> Vec<String> {
        order.iter().map(|f| f.name.clone()).collect()
    }

    fn resolve_names(target: &str, universe: &Universe) -> Result<Vec<String>, ResolutionError> {
        let target = &universe[target];
        resolve(target, universe, &ResolveOptions::default()).map(|o| names(&o))
    }

    #[test]
    fn single_formula_resolves_to_itself() {
        let u = universe(vec![formula("x", &[])]);
        assert_eq!(resolve_names("x", &u).unwrap(), vec!["x"]);
    }

    #[test]
    fn independent_dependencies_keep_declaration_order() {
        let u = universe(vec![
            formula_with(
                "y",
                vec![Dependency::runtime("x"), Dependency::build("z")],
            ),
            formula("x", &[]),
            formula("z", &[]),
        ]);

        assert_eq!(resolve_names("y", &u).unwrap(), vec!["x", "z", "y"]);
    }

    #[test]
    fn resolves_transitive_closure_in_stable_order() {
        let u = universe(vec![
            formula("foo", &["baz", "bar"]),
            formula("bar", &["qux"]),
            formula("baz", &["qux"]),
            formula("qux", &[]),
        ]);

        assert_eq!(resolve_names("foo", &u).unwrap(), vec!["qux", "baz", "bar", "foo"]);
    }

    #[test]
    fn detects_cycles_naming_every_member() {
        let u = universe(vec![
            formula("root", &["alpha"]),
            formula("alpha", &["beta"]),
            formula("beta", &["gamma"]),
            formula("gamma", &["alpha"]),
        ]);

        let err = resolve_names("root", &u).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::Cycle {
                cycle: vec![
                    "alpha".to_string(),
                    "beta".to_string(),
                    "gamma".to_string(),
                    "alpha".to_string()
                ]
            }
        );
    }

    #[test]
    fn missing_dependency_reports_path() {
        let u = universe(vec![formula("curl", &["openssl"]), formula("openssl", &["zlib"])]);

        let err = resolve_names("curl", &u).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::MissingDependency {
                name: "zlib".to_string(),
                path: vec!["curl".to_string(), "openssl".to_string(), "zlib".to_string()],
            }
        );
    }

    #[test]
    fn test_dependencies_only_when_requested() {
        let u = universe(vec![
            formula_with(
                "app",
                vec![
                    Dependency::runtime("lib"),
                    Dependency::new("checker", &[DependencyKind::Test]),
                ],
            ),
            formula("lib", &[]),
            formula("checker", &["lib"]),
        ]);
        let target = &u["app"];

        let order = resolve(target, &u, &ResolveOptions::default()).unwrap();
        assert_eq!(names(&order), vec!["lib", "app"]);

        let graph = plan(target, &u, &ResolveOptions::default().with_tests(true)).unwrap();
        assert_eq!(names(graph.order()), vec!["lib", "checker", "app"]);
        assert_eq!(graph.dependencies("app"), ["lib"]);
        assert_eq!(graph.test_dependencies(), ["checker"]);
    }

    #[test]
    fn test_edges_of_dependencies_are_never_followed() {
        let u = universe(vec![
            formula("app", &["lib"]),
            formula_with("lib", vec![Dependency::new("checker", &[DependencyKind::Test])]),
        ]);
        let target = &u["app"];

        let order = resolve(target, &u, &ResolveOptions::default().with_tests(true)).unwrap();
        assert_eq!(names(&order), vec!["lib", "app"]);
    }

    #[test]
    fn recommended_and_optional_are_opt_in() {
        let u = universe(vec![
            formula_with(
                "app",
                vec![
                    Dependency::new("rec", &[DependencyKind::Recommended]),
                    Dependency::new("opt", &[DependencyKind::Optional]),
                ],
            ),
            formula("rec", &[]),
            formula("opt", &[]),
        ]);
        let target = &u["app"];

        assert_eq!(resolve_names("app", &u).unwrap(), vec!["app"]);

        let options = ResolveOptions {
            include_recommended: true,
            include_optional: true,
            ..Default::default()
        };
        let order = resolve(target, &u, &options).unwrap();
        assert_eq!(names(&order), vec!["rec", "opt", "app"]);
    }

    #[test]
    fn os_guards_follow_the_platform() {
        let mut mesa = Dependency::runtime("mesa");
        mesa.os = Some(OsFamily::Linux);
        let u = universe(vec![formula_with("occt", vec![mesa]), formula("mesa", &[])]);
        let target = &u["occt"];

        let linux = ResolveOptions::for_platform(&PlatformFingerprint::linux(Arch::X86_64));
        assert_eq!(names(&resolve(target, &u, &linux).unwrap()), vec!["mesa", "occt"]);

        let macos =
            ResolveOptions::for_platform(&PlatformFingerprint::macos(Arch::Arm64, "sonoma"));
        assert_eq!(names(&resolve(target, &u, &macos).unwrap()), vec!["occt"]);
    }

    #[test]
    fn incompatible_requirements_conflict() {
        let mut exact = Dependency::runtime("tbb");
        exact.version = Some("=2021.11".to_string());
        let mut newer = Dependency::runtime("tbb");
        newer.version = Some(">=2022".to_string());

        let mut tbb = formula("tbb", &[]);
        tbb.version = "2022.0".to_string();

        let u = universe(vec![
            formula("app", &["occt", "vdb"]),
            formula_with("occt", vec![exact]),
            formula_with("vdb", vec![newer]),
            tbb,
        ]);

        let err = resolve_names("app", &u).unwrap_err();
        let ResolutionError::VersionConflict {
            name,
            available,
            demands,
        } = err
        else {
            panic!("expected version conflict, got {err:?}");
        };
        assert_eq!(name, "tbb");
        assert_eq!(available.as_deref(), Some("2022.0"));
        assert_eq!(demands[0].required_by, "occt");
    }

    #[test]
    fn satisfied_requirements_resolve() {
        let mut dep = Dependency::runtime("node");
        dep.version = Some(">=20".to_string());
        let mut node = formula("node", &[]);
        node.version = "23.9.0".to_string();

        let u = universe(vec![formula_with("aws-cdk", vec![dep]), node]);
        assert_eq!(resolve_names("aws-cdk", &u).unwrap(), vec!["node", "aws-cdk"]);
    }

    #[test]
    fn closure_of_collects_transitive_install_deps() {
        let u = universe(vec![
            formula("app", &["a", "b"]),
            formula("a", &["c"]),
            formula("b", &[]),
            formula("c", &[]),
        ]);
        let graph = plan(&u["app"], &u, &ResolveOptions::default()).unwrap();

        assert_eq!(names(&graph.closure_of("a")), vec!["c"]);
        assert_eq!(names(&graph.closure_of("app")), vec!["c", "a", "b"]);
    }

    #[test]
    fn runtime_closure_skips_build_only_edges() {
        let u = universe(vec![
            formula_with(
                "app",
                vec![Dependency::runtime("lib"), Dependency::build("cmake")],
            ),
            formula_with(
                "lib",
                vec![Dependency::runtime("zlib"), Dependency::build("pkgconf")],
            ),
            formula("cmake", &[]),
            formula("pkgconf", &[]),
            formula("zlib", &[]),
        ]);
        let graph = plan(&u["app"], &u, &ResolveOptions::default()).unwrap();

        assert_eq!(
            names(&graph.closure_of("app")),
            vec!["zlib", "pkgconf", "lib", "cmake"]
        );
        assert_eq!(names(&graph.runtime_closure_of("app")), vec!["zlib", "lib"]);
        assert_eq!(names(&graph.runtime_closure_of("cmake")), Vec::<String>::new());
    }

    #[test]
    fn resolves_fixture_closure_on_linux() {
        let occt: Formula =
            serde_json::from_str(include_str!("../fixtures/opencascade.json")).unwrap();
        let deps: Vec<Formula> = occt
            .dependencies
            .iter()
            .map(|d| formula(&d.name, &[]))
            .collect();
        let u = universe(deps);

        let linux = ResolveOptions::for_platform(&PlatformFingerprint::linux(Arch::X86_64));
        let order = resolve(&occt, &u, &linux).unwrap();
        assert_eq!(order.last().unwrap().name, "opencascade");
        assert_eq!(order.len(), 10);
        assert_eq!(order[0].name, "cmake");
    }

    /// Random DAG: node `i` may only depend on nodes with a smaller index.
    fn dag_strategy() -> impl Strategy<Value = Vec<Vec<(usize, bool)>>> {
        (1usize..14).prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::collection::vec((0..i.max(1), any::<bool>()), 0..=i.min(4)))
                .collect::<Vec<_>>()
        })
    }

    fn build_universe(edges: &[Vec<(usize, bool)>]) -> Universe {
        let formulas = edges.iter().enumerate().map(|(i, deps)| {
            let deps = deps
                .iter()
                .filter(|(d, _)| *d < i)
                .map(|(d, build)| {
                    let name = format!("f{d}");
                    if *build {
                        Dependency::build(&name)
                    } else {
                        Dependency::runtime(&name)
                    }
                })
                .collect();
            formula_with(&format!("f{i}"), deps)
        });
        universe(formulas.collect())
    }

    proptest! {
        #[test]
        fn order_is_topologically_valid(edges in dag_strategy()) {
            let u = build_universe(&edges);
            let target = format!("f{}", edges.len() - 1);
            let order = resolve(&u[&target], &u, &ResolveOptions::default()).unwrap();

            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, f)| (f.name.as_str(), i)).collect();
            prop_assert_eq!(order.last().unwrap().name.as_str(), target.as_str());
            for formula in &order {
                for dep in &formula.dependencies {
                    prop_assert!(position[dep.name.as_str()] < position[formula.name.as_str()]);
                }
            }
            let unique: std::collections::HashSet<_> = order.iter().map(|f| &f.name).collect();
            prop_assert_eq!(unique.len(), order.len());
        }

        #[test]
        fn cycles_name_every_member(len in 2usize..8, entry in 0usize..8) {
            let mut formulas: Vec<Formula> = (0..len)
                .map(|i| formula(&format!("c{i}"), &[&format!("c{}", (i + 1) % len)]))
                .collect();
            formulas.push(formula("root", &[&format!("c{}", entry % len)]));
            let u = universe(formulas);

            let err = resolve(&u["root"], &u, &ResolveOptions::default()).unwrap_err();
            let ResolutionError::Cycle { cycle } = err else {
                return Err(TestCaseError::fail("expected a cycle"));
            };
            prop_assert_eq!(cycle.first(), cycle.last());
            for i in 0..len {
                let member = format!("c{i}");
                prop_assert!(cycle.contains(&member));
            }
            prop_assert!(!cycle.contains(&"root".to_string()));
        }
    }
}
