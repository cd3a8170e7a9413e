//! Controlled environment for install and test processes.
//!
//! Child processes never inherit the caller's environment. Each one gets a
//! map assembled from an allow-list of ambient variables, the install
//! prefix, and search paths derived from resolved dependency prefixes.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use bk_core::{CommandSpec, Error, Formula};

use crate::traits::Invocation;

const SYSTEM_PATH: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Values substituted for `{name}` tokens in step arguments.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<String, String>,
    opt: BTreeMap<String, String>,
    formula: String,
}

impl Placeholders {
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Replace known placeholders in `input`.
    ///
    /// Unknown `{...}` sequences are left alone so shell snippets survive;
    /// `{opt:NAME}` for a name outside the resolved closure is an error.
    pub fn expand(&self, input: &str) -> Result<String, Error> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(len) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let key = &after[..len];

            if let Some(dep) = key.strip_prefix("opt:") {
                let prefix = self.opt.get(dep).ok_or_else(|| Error::InvalidManifest {
                    name: self.formula.clone(),
                    message: format!(
                        "'{{opt:{dep}}}' names a formula outside the dependency closure"
                    ),
                })?;
                out.push_str(prefix);
            } else if let Some(value) = self.values.get(key) {
                out.push_str(value);
            } else {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
            rest = &after[len + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// Environment for the steps of one formula.
#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    formula: String,
    prefix: PathBuf,
    /// Scratch directory every relative path resolves against
    workdir: PathBuf,
    /// Default working directory for `run` steps
    default_cwd: PathBuf,
    placeholders: Placeholders,
    env: BTreeMap<String, String>,
}

impl BuildEnvironment {
    /// Environment for install steps.
    ///
    /// `deps` maps every formula of the dependency closure to its prefix.
    pub fn for_install(
        formula: &Formula,
        prefix: &Path,
        workdir: &Path,
        srcdir: Option<&Path>,
        deps: &BTreeMap<String, PathBuf>,
        allowlist: &[String],
        jobs: usize,
    ) -> Self {
        let default_cwd = srcdir.unwrap_or(workdir).to_path_buf();
        let mut env = Self::base(formula, prefix, workdir, deps, allowlist, jobs);
        env.default_cwd = default_cwd.clone();
        env.placeholders
            .insert("srcdir", default_cwd.to_string_lossy().into_owned());
        env
    }

    /// Environment for test steps; `{testpath}` is the scratch directory.
    pub fn for_test(
        formula: &Formula,
        prefix: &Path,
        testpath: &Path,
        deps: &BTreeMap<String, PathBuf>,
        allowlist: &[String],
    ) -> Self {
        let mut env = Self::base(formula, prefix, testpath, deps, allowlist, 1);
        env.placeholders
            .insert("testpath", testpath.to_string_lossy().into_owned());
        env
    }

    fn base(
        formula: &Formula,
        prefix: &Path,
        workdir: &Path,
        deps: &BTreeMap<String, PathBuf>,
        allowlist: &[String],
        jobs: usize,
    ) -> Self {
        let mut placeholders = Placeholders {
            formula: formula.name.clone(),
            ..Default::default()
        };
        let display = |p: &Path| p.to_string_lossy().into_owned();
        placeholders.insert("prefix", display(prefix));
        placeholders.insert("bin", display(&prefix.join("bin")));
        placeholders.insert("lib", display(&prefix.join("lib")));
        placeholders.insert("include", display(&prefix.join("include")));
        placeholders.insert("share", display(&prefix.join("share")));
        placeholders.insert("workdir", display(workdir));
        placeholders.insert("version", formula.version.clone());
        placeholders.insert("name", formula.name.clone());
        placeholders.insert("jobs", jobs.to_string());
        placeholders.opt = deps
            .iter()
            .map(|(name, path)| (name.clone(), display(path)))
            .collect();

        let env = controlled_env(prefix, workdir, deps, allowlist, jobs);

        Self {
            formula: formula.name.clone(),
            prefix: prefix.to_path_buf(),
            workdir: workdir.to_path_buf(),
            default_cwd: workdir.to_path_buf(),
            placeholders,
            env,
        }
    }

    pub fn placeholders(&self) -> &Placeholders {
        &self.placeholders
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn expand(&self, input: &str) -> Result<String, Error> {
        self.placeholders.expand(input)
    }

    /// Resolve a manifest-relative path under `base`, refusing escapes.
    pub fn confined(&self, base: &Path, relative: &str) -> Result<PathBuf, Error> {
        let expanded = self.expand(relative)?;
        let rel = Path::new(&expanded);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
        if escapes {
            return Err(Error::InvalidManifest {
                name: self.formula.clone(),
                message: format!("path '{expanded}' escapes {}", base.display()),
            });
        }
        Ok(base.join(rel))
    }

    /// Turn a manifest command into a concrete invocation.
    pub fn invocation(&self, spec: &CommandSpec) -> Result<Invocation, Error> {
        let program = self.expand(&spec.program)?;
        let args = spec
            .args
            .iter()
            .map(|a| self.expand(a))
            .collect::<Result<Vec<_>, _>>()?;
        let cwd = match &spec.cwd {
            Some(cwd) => self.confined(&self.default_cwd, cwd)?,
            None => self.default_cwd.clone(),
        };

        let mut env = self.env.clone();
        for (key, value) in &spec.env {
            env.insert(key.clone(), self.expand(value)?);
        }

        Ok(Invocation {
            program,
            args,
            cwd,
            env,
        })
    }
}

fn controlled_env(
    prefix: &Path,
    workdir: &Path,
    deps: &BTreeMap<String, PathBuf>,
    allowlist: &[String],
    jobs: usize,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = allowlist
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
        .collect();

    let mut path_dirs = Vec::new();
    let mut pkg_config = Vec::new();
    let mut cppflags = Vec::new();
    let mut ldflags = Vec::new();
    let mut cmake_prefixes = Vec::new();

    for dep_prefix in deps.values() {
        let bin = dep_prefix.join("bin");
        let include = dep_prefix.join("include");
        let lib = dep_prefix.join("lib");
        if bin.is_dir() {
            path_dirs.push(bin.to_string_lossy().into_owned());
        }
        if include.is_dir() {
            cppflags.push(format!("-I{}", include.display()));
        }
        if lib.is_dir() {
            ldflags.push(format!("-L{}", lib.display()));
            let pc = lib.join("pkgconfig");
            if pc.is_dir() {
                pkg_config.push(pc.to_string_lossy().into_owned());
            }
        }
        cmake_prefixes.push(dep_prefix.to_string_lossy().into_owned());
    }
    path_dirs.push(prefix.join("bin").to_string_lossy().into_owned());
    path_dirs.extend(SYSTEM_PATH.iter().map(|d| d.to_string()));

    env.insert("PATH".to_string(), path_dirs.join(":"));
    env.insert("HOME".to_string(), workdir.to_string_lossy().into_owned());
    env.insert("TMPDIR".to_string(), workdir.to_string_lossy().into_owned());
    env.insert("PREFIX".to_string(), prefix.to_string_lossy().into_owned());
    env.insert("BK_PREFIX".to_string(), prefix.to_string_lossy().into_owned());
    env.insert("MAKEFLAGS".to_string(), format!("-j{jobs}"));
    if !pkg_config.is_empty() {
        env.insert("PKG_CONFIG_PATH".to_string(), pkg_config.join(":"));
    }
    if !cppflags.is_empty() {
        env.insert("CPPFLAGS".to_string(), cppflags.join(" "));
    }
    if !ldflags.is_empty() {
        env.insert("LDFLAGS".to_string(), ldflags.join(" "));
    }
    if !cmake_prefixes.is_empty() {
        env.insert("CMAKE_PREFIX_PATH".to_string(), cmake_prefixes.join(";"));
    }
    env
}
