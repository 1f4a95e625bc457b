//! Version Resolver.
//!
//! Registry dependencies ask the registry for the highest published version.
//! Version-control dependencies go through a bounded fallback chain:
//! hosted file API, then `git archive` of the manifest, then `git ls-remote`.
//! Every step carries its own timeout and never prompts for credentials.
//! Failures come back as [`ResolutionOutcome`] variants rather than errors.

pub mod git;
pub mod hosted;
pub mod registry;

use serde::Serialize;
use tracing::debug;

use crate::config::ScanConfig;
use crate::manifest::package_version_from_str;
use crate::model::{GitRef, Source, DEFAULT_REGISTRY};
use crate::version::{CanonicalVersion, Sentinel};

pub use git::GitCli;
pub use hosted::HostedProvider;
pub use registry::{RegistryClient, RegistryVersions};

/// One unit of resolution work. Equal requests share one result.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub name: &'a str,
    pub source: &'a Source,
}

/// Result of one resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "kebab-case")]
pub enum ResolutionOutcome {
    /// A manifest or registry answer produced a real version.
    Version(CanonicalVersion),
    /// The remote answered but no manifest version could be read.
    Revision(String),
    AuthRequired,
    NotFound,
    TimedOut,
    /// Nothing could be attempted (offline, unsupported source, spawn failure).
    Unknown,
}

impl ResolutionOutcome {
    pub fn into_canonical(self) -> CanonicalVersion {
        match self {
            Self::Version(v) => v,
            Self::Revision(rev) => CanonicalVersion::Revision(rev),
            Self::AuthRequired => CanonicalVersion::Sentinel(Sentinel::AuthRequired),
            Self::NotFound => CanonicalVersion::Sentinel(Sentinel::NotFound),
            Self::TimedOut => CanonicalVersion::Sentinel(Sentinel::Timeout),
            Self::Unknown => CanonicalVersion::Sentinel(Sentinel::Unknown),
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Version(_) | Self::Revision(_))
    }
}

/// Anything that can resolve dependencies. The scanner only sees this trait, so
/// tests can substitute a deterministic implementation.
pub trait Resolve: Send + Sync {
    fn resolve(&self, request: &ResolveRequest<'_>) -> ResolutionOutcome;

    /// Reachability only: one `ls-remote`-equivalent call, no manifest reads.
    fn probe_remote(&self, url: &str, reference: &GitRef) -> ResolutionOutcome;
}

/// Outcome of [`Resolve::probe_remote`] for one distinct remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReachabilityReport {
    pub url: String,
    pub reference: String,
    /// Packages in the scan that depend on this remote.
    pub packages: Vec<String>,
    pub status: CanonicalVersion,
}

/// The network-backed resolver.
pub struct VersionResolver {
    registry: RegistryClient,
    hosted: Option<HostedProvider>,
    git: GitCli,
    offline: bool,
    include_prerelease: bool,
}

impl VersionResolver {
    pub fn from_config(config: &ScanConfig) -> std::io::Result<Self> {
        let registry = RegistryClient::new(&config.registry_url, &config.timeouts);
        let hosted = config
            .hosted_api
            .then(|| HostedProvider::new(config.timeouts.api));
        let git = GitCli::new(config.timeouts.git)?;
        Ok(Self {
            registry,
            hosted,
            git,
            offline: config.offline,
            include_prerelease: config.include_prerelease,
        })
    }

    fn resolve_remote(&self, name: &str, url: &str, reference: &GitRef) -> ResolutionOutcome {
        if let Some(text) = self
            .hosted
            .as_ref()
            .and_then(|h| h.fetch_manifest(url, reference))
        {
            if let Some(v) = release_from_manifest(&text) {
                debug!(dependency = %name, %url, "resolved from hosted API");
                return ResolutionOutcome::Version(v);
            }
        }

        match self.git.archive_manifest(url, reference) {
            Ok(text) => {
                if let Some(v) = release_from_manifest(&text) {
                    debug!(dependency = %name, %url, "resolved from git archive");
                    return ResolutionOutcome::Version(v);
                }
            }
            // Credentials and timeouts will not improve on a second call.
            Err(outcome @ (ResolutionOutcome::AuthRequired | ResolutionOutcome::TimedOut)) => {
                return outcome;
            }
            Err(_) => {}
        }

        self.git.ls_remote(url, reference)
    }
}

fn release_from_manifest(text: &str) -> Option<CanonicalVersion> {
    let v = CanonicalVersion::parse(&package_version_from_str(text)?);
    v.release().is_some().then_some(v)
}

impl Resolve for VersionResolver {
    fn resolve(&self, request: &ResolveRequest<'_>) -> ResolutionOutcome {
        if self.offline {
            return ResolutionOutcome::Unknown;
        }
        let outcome = match request.source {
            // Only the default registry's index is configured.
            Source::Registry { registry } if registry.as_str() != DEFAULT_REGISTRY => {
                ResolutionOutcome::Unknown
            }
            Source::Registry { .. } => {
                match self.registry.versions(request.name) {
                    Ok(versions) => versions
                        .pick(self.include_prerelease)
                        .map(ResolutionOutcome::Version)
                        .unwrap_or(ResolutionOutcome::NotFound),
                    Err(outcome) => outcome,
                }
            }
            Source::VersionControl { url, reference } => {
                self.resolve_remote(request.name, url, reference)
            }
            Source::LocalPath { .. } => ResolutionOutcome::Version(CanonicalVersion::Local),
        };
        debug!(
            dependency = %request.name,
            source = %request.source.location(),
            ?outcome,
            "resolved"
        );
        outcome
    }

    fn probe_remote(&self, url: &str, reference: &GitRef) -> ResolutionOutcome {
        if self.offline {
            return ResolutionOutcome::Unknown;
        }
        self.git.ls_remote(url, reference)
    }
}
