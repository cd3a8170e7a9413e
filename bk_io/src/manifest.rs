//! Loading formula manifests from a directory of `<name>.json` files.

use std::fs;
use std::path::Path;

use tracing::debug;

use bk_core::{Error, Formula, Universe};

/// Parse and validate one manifest file.
pub fn load_formula(path: &Path) -> Result<Formula, Error> {
    let json = fs::read_to_string(path).map_err(|e| Error::fs(path, e))?;
    let formula: Formula = serde_json::from_str(&json).map_err(|e| Error::InvalidManifest {
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        message: format!("failed to parse {}: {e}", path.display()),
    })?;
    formula.validate()?;
    Ok(formula)
}

/// Every `*.json` manifest in `dir`, keyed by formula name.
///
/// A file must be named after the formula it declares.
pub fn load_universe(dir: &Path) -> Result<Universe, Error> {
    let mut universe = Universe::new();

    for entry in fs::read_dir(dir).map_err(|e| Error::fs(dir, e))? {
        let entry = entry.map_err(|e| Error::fs(dir, e))?;
        let path = entry.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        let formula = load_formula(&path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem != formula.name {
            return Err(Error::InvalidManifest {
                name: formula.name,
                message: format!("declared in {}, expected {stem}.json", path.display()),
            });
        }
        universe.insert(formula.name.clone(), formula);
    }

    debug!(dir = %dir.display(), formulas = universe.len(), "loaded manifests");
    Ok(universe)
}
