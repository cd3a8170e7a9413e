use crate::formula::Cellar;
use crate::platform::PlatformFingerprint;
use crate::{Error, Formula};

/// Where a formula's files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactPlan {
    UseBottle {
        tag: String,
        sha256: String,
        url: String,
        cellar: Cellar,
    },
    BuildFromSource {
        sha256: String,
        url: String,
    },
}

impl ArtifactPlan {
    pub fn sha256(&self) -> &str {
        match self {
            ArtifactPlan::UseBottle { sha256, .. }
            | ArtifactPlan::BuildFromSource { sha256, .. } => sha256,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ArtifactPlan::UseBottle { url, .. } | ArtifactPlan::BuildFromSource { url, .. } => url,
        }
    }

    pub fn is_bottle(&self) -> bool {
        matches!(self, ArtifactPlan::UseBottle { .. })
    }
}

/// Pick the bottle for `platform`, falling back to a source build.
///
/// Candidate tags are tried in the order given by
/// [`PlatformFingerprint::candidate_tags`]: the exact tag, compatible older
/// releases, then the universal bottle. Bottles without a resolvable URL are
/// skipped.
pub fn select_artifact(
    formula: &Formula,
    platform: &PlatformFingerprint,
) -> Result<ArtifactPlan, Error> {
    for tag in platform.candidate_tags() {
        let Some(file) = formula.bottle.files.get(&tag) else {
            continue;
        };
        let Some(url) = formula.bottle_url(file) else {
            continue;
        };
        return Ok(ArtifactPlan::UseBottle {
            tag,
            sha256: file.sha256.clone(),
            url,
            cellar: file.cellar.clone(),
        });
    }

    source_artifact(formula).map_err(|_| Error::UnsupportedBottle {
        name: formula.name.clone(),
        platform: platform.tag(),
        available_platforms: formula.bottle.files.keys().cloned().collect(),
    })
}

/// Plan a source build regardless of available bottles.
pub fn source_artifact(formula: &Formula) -> Result<ArtifactPlan, Error> {
    let source = formula
        .source
        .as_ref()
        .ok_or_else(|| Error::InvalidManifest {
            name: formula.name.clone(),
            message: "no source archive to build from".to_string(),
        })?;

    Ok(ArtifactPlan::BuildFromSource {
        sha256: source.sha256.clone(),
        url: source.url.clone(),
    })
}
