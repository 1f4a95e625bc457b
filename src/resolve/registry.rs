//! crates.io-compatible registry client.

use serde::Deserialize;
use tracing::debug;

use super::ResolutionOutcome;
use crate::config::Timeouts;
use crate::version::{select_latest, CanonicalVersion};

#[derive(Debug)]
pub struct RegistryClient {
    base: String,
    agent: ureq::Agent,
}

/// Highest published versions of one package, yanked releases excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryVersions {
    pub latest: Option<CanonicalVersion>,
    pub latest_stable: Option<CanonicalVersion>,
}

impl RegistryVersions {
    /// Build from raw version numbers, dropping anything that is not a release.
    pub fn from_numbers<'a>(numbers: impl IntoIterator<Item = &'a str>) -> Self {
        let parsed: Vec<CanonicalVersion> = numbers
            .into_iter()
            .map(CanonicalVersion::parse)
            .filter(|v| v.release().is_some())
            .collect();
        Self {
            latest: select_latest(&parsed, true).cloned(),
            latest_stable: select_latest(&parsed, false).cloned(),
        }
    }

    pub fn pick(self, include_prerelease: bool) -> Option<CanonicalVersion> {
        if include_prerelease {
            self.latest.or(self.latest_stable)
        } else {
            self.latest_stable
        }
    }
}

#[derive(Debug, Deserialize)]
struct CrateResponse {
    #[serde(rename = "crate")]
    krate: CrateInfo,
    #[serde(default)]
    versions: Vec<VersionInfo>,
}

#[derive(Debug, Deserialize)]
struct CrateInfo {
    #[serde(default)]
    max_version: Option<String>,
    #[serde(default)]
    max_stable_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    num: String,
    #[serde(default)]
    yanked: bool,
}

impl RegistryClient {
    pub fn new(base: &str, timeouts: &Timeouts) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeouts.registry_connect)
            .timeout_read(timeouts.registry_read)
            .timeout_write(timeouts.registry_read)
            .build();
        Self {
            base: base.trim_end_matches('/').to_string(),
            agent,
        }
    }

    /// Query `GET {base}/crates/{name}`. Any failure, network or HTTP, is
    /// `NotFound`.
    pub fn versions(&self, name: &str) -> Result<RegistryVersions, ResolutionOutcome> {
        let url = format!("{}/crates/{}", self.base, name);
        let resp = match self
            .agent
            .get(&url)
            .set("Accept", "application/json")
            .set("User-Agent", "ecoscan (dependency ecosystem analysis)")
            .call()
        {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) => {
                debug!(%url, code, "registry returned error status");
                return Err(ResolutionOutcome::NotFound);
            }
            Err(e) => {
                debug!(%url, error = %e, "registry request failed");
                return Err(ResolutionOutcome::NotFound);
            }
        };

        let body: CrateResponse = resp.into_json().map_err(|e| {
            debug!(%url, error = %e, "registry response was not valid JSON");
            ResolutionOutcome::NotFound
        })?;
        Ok(body.into_versions())
    }
}

impl CrateResponse {
    fn into_versions(self) -> RegistryVersions {
        let live = self
            .versions
            .iter()
            .filter(|v| !v.yanked)
            .map(|v| v.num.as_str());
        let versions = RegistryVersions::from_numbers(live);
        if versions.latest.is_some() {
            return versions;
        }
        // Some mirrors omit the versions list; fall back to the summary fields.
        let parse = |s: Option<String>| {
            s.map(|s| CanonicalVersion::parse(&s))
                .filter(|v| v.release().is_some())
        };
        RegistryVersions {
            latest: parse(self.krate.max_version),
            latest_stable: parse(self.krate.max_stable_version),
        }
    }
}
