//! Ecosystem Aggregator: read-only views over a hydrated snapshot.
//!
//! Every view reads from one usage table built in [`Ecosystem::new`], so
//! per-package usage counts agree across conflicts, hub, package and summary
//! output. The hub is looked up by name each time an `Ecosystem` is built.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::model::{DependencyKind, EcosystemSnapshot, RepoId, RepositoryRecord, SourceKind};
use crate::version::{
    is_breaking, select_latest, stability, CanonicalVersion, Sentinel, Stability,
};

/// Default minimum non-hub usage for a gap to count as an opportunity.
pub const DEFAULT_OPPORTUNITY_THRESHOLD: usize = 5;

/// Per-package usage, the single source for every count in this module.
#[derive(Debug, Clone, Default)]
struct PackageUsage {
    /// Distinct non-hub repositories depending on the package (local markers excluded).
    users: BTreeSet<RepoId>,
    /// Canonical version in use → repositories, hub included. Sentinels and
    /// local markers are left out.
    versions: BTreeMap<CanonicalVersion, BTreeSet<RepoId>>,
    /// Highest release any resolution produced. Pre-releases only count when
    /// the ecosystem opts in.
    latest: Option<CanonicalVersion>,
    /// Version the hub pins, if the hub depends on the package.
    hub_version: Option<CanonicalVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub name: String,
    /// Canonical version → repository names using it.
    pub versions: BTreeMap<String, Vec<String>>,
    pub usage_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubGapRecord {
    pub name: String,
    pub usage_count: usize,
    pub in_hub: bool,
}

/// Opportunities are gaps at or above the usage threshold.
pub type OpportunityRecord = HubGapRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubPackageRecord {
    pub name: String,
    pub usage_count: usize,
    pub hub_version: String,
    pub latest: Option<String>,
    pub breaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubReport {
    pub hub: String,
    pub current: Vec<HubPackageRecord>,
    pub outdated: Vec<HubPackageRecord>,
    /// Hub pins a release newer than any resolved latest.
    pub ahead: Vec<HubPackageRecord>,
    /// Ranked by usage, highest first.
    pub gaps: Vec<HubGapRecord>,
    pub unused: Vec<HubPackageRecord>,
    pub opportunities: Vec<OpportunityRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedRecord {
    pub name: String,
    pub repository: String,
    pub current: String,
    pub latest: String,
    pub breaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedRecord {
    pub name: String,
    pub status: Sentinel,
    pub source: String,
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageUse {
    pub repository: String,
    pub declared: String,
    pub in_use: String,
    pub resolved: String,
    pub kind: DependencyKind,
    pub source_kind: SourceKind,
    pub source: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageDetail {
    pub name: String,
    pub usage_count: usize,
    pub in_hub: bool,
    pub hub_version: Option<String>,
    pub latest: Option<String>,
    pub stability: Stability,
    pub versions: BTreeMap<String, Vec<String>>,
    pub uses: Vec<PackageUse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubTotals {
    pub current: usize,
    pub outdated: usize,
    pub ahead: usize,
    pub gaps: usize,
    pub unused: usize,
    pub opportunities: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub repositories: usize,
    pub internal_repositories: usize,
    pub parse_errors: usize,
    pub dependencies: usize,
    pub packages: usize,
    pub by_source_kind: BTreeMap<String, usize>,
    pub conflicts: usize,
    pub outdated: usize,
    pub unresolved_dependencies: usize,
    pub hub: Option<String>,
    pub hub_totals: Option<HubTotals>,
}

/// Aggregation over one snapshot. Cheap to build; holds no locks.
pub struct Ecosystem<'a> {
    snapshot: &'a EcosystemSnapshot,
    hub: Option<&'a RepositoryRecord>,
    opportunity_threshold: usize,
    include_prerelease: bool,
    usage: BTreeMap<String, PackageUsage>,
}

impl<'a> Ecosystem<'a> {
    pub fn new(snapshot: &'a EcosystemSnapshot, hub_name: Option<&str>) -> Self {
        let hub = hub_name.and_then(|n| snapshot.repository_by_name(n));
        let usage = build_usage(snapshot, hub.map(|h| h.id), false);
        Self {
            snapshot,
            hub,
            opportunity_threshold: DEFAULT_OPPORTUNITY_THRESHOLD,
            include_prerelease: false,
            usage,
        }
    }

    pub fn with_opportunity_threshold(mut self, threshold: usize) -> Self {
        self.opportunity_threshold = threshold;
        self
    }

    /// Let pre-release versions count as a package's latest.
    pub fn with_include_prerelease(mut self, include: bool) -> Self {
        if include != self.include_prerelease {
            self.include_prerelease = include;
            self.usage = build_usage(self.snapshot, self.hub.map(|h| h.id), include);
        }
        self
    }

    pub fn hub(&self) -> Option<&'a RepositoryRecord> {
        self.hub
    }

    /// Distinct non-hub repositories using `name`.
    pub fn usage_count(&self, name: &str) -> usize {
        self.usage.get(name).map_or(0, |u| u.users.len())
    }

    fn repo_names(&self, ids: &BTreeSet<RepoId>) -> Vec<String> {
        let mut names: Vec<String> = ids
            .iter()
            .filter_map(|id| self.snapshot.repository(*id))
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    fn version_map(&self, u: &PackageUsage) -> BTreeMap<String, Vec<String>> {
        u.versions
            .iter()
            .map(|(v, ids)| (v.to_string(), self.repo_names(ids)))
            .collect()
    }

    /// Packages used at more than one distinct canonical version.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.usage
            .iter()
            .filter(|(_, u)| u.versions.len() > 1)
            .map(|(name, u)| ConflictRecord {
                name: name.clone(),
                versions: self.version_map(u),
                usage_count: u.users.len(),
            })
            .collect()
    }

    /// `None` when no hub was named or the named hub is not in the snapshot.
    pub fn hub_report(&self) -> Option<HubReport> {
        let hub = self.hub?;
        let mut report = HubReport {
            hub: hub.name.clone(),
            current: Vec::new(),
            outdated: Vec::new(),
            ahead: Vec::new(),
            gaps: Vec::new(),
            unused: Vec::new(),
            opportunities: Vec::new(),
        };

        for (name, u) in &self.usage {
            let usage_count = u.users.len();
            match &u.hub_version {
                Some(hub_version) => {
                    let (behind, breaking) = behind_latest(hub_version, u.latest.as_ref());
                    let record = HubPackageRecord {
                        name: name.clone(),
                        usage_count,
                        hub_version: hub_version.to_string(),
                        latest: u.latest.as_ref().map(ToString::to_string),
                        breaking,
                    };
                    if usage_count == 0 {
                        report.unused.push(record);
                    } else if behind {
                        report.outdated.push(record);
                    } else if is_ahead(hub_version, u.latest.as_ref()) {
                        report.ahead.push(record);
                    } else {
                        report.current.push(record);
                    }
                }
                None if usage_count > 0 => {
                    let gap = HubGapRecord {
                        name: name.clone(),
                        usage_count,
                        in_hub: false,
                    };
                    if usage_count >= self.opportunity_threshold {
                        report.opportunities.push(gap.clone());
                    }
                    report.gaps.push(gap);
                }
                None => {}
            }
        }

        let rank = |a: &HubGapRecord, b: &HubGapRecord| {
            b.usage_count.cmp(&a.usage_count).then_with(|| a.name.cmp(&b.name))
        };
        report.gaps.sort_by(rank);
        report.opportunities.sort_by(rank);
        Some(report)
    }

    /// Dependency edges whose version in use is below the package's latest.
    pub fn outdated(&self) -> Vec<OutdatedRecord> {
        let mut out = Vec::new();
        for repo in &self.snapshot.repositories {
            for dep in repo.all_dependencies() {
                let Some(latest) = self.usage.get(&dep.name).and_then(|u| u.latest.as_ref()) else {
                    continue;
                };
                let in_use = dep.version_in_use();
                let (behind, breaking) = behind_latest(&in_use, Some(latest));
                if behind {
                    out.push(OutdatedRecord {
                        name: dep.name.clone(),
                        repository: repo.name.clone(),
                        current: in_use.to_string(),
                        latest: latest.to_string(),
                        breaking,
                    });
                }
            }
        }
        out.sort_by(|a, b| (&a.name, &a.repository).cmp(&(&b.name, &b.repository)));
        out.dedup();
        out
    }

    /// Resolution failures grouped by package, outcome and source.
    pub fn unresolved(&self) -> Vec<UnresolvedRecord> {
        let mut groups: BTreeMap<(String, Sentinel, String), BTreeSet<RepoId>> = BTreeMap::new();
        for dep in self.snapshot.dependencies() {
            if let Some(status) = dep.resolved.sentinel() {
                groups
                    .entry((dep.name.clone(), status, dep.source.location()))
                    .or_default()
                    .insert(dep.repo);
            }
        }
        groups
            .into_iter()
            .map(|((name, status, source), ids)| UnresolvedRecord {
                name,
                status,
                source,
                repositories: self.repo_names(&ids),
            })
            .collect()
    }

    /// Everything known about one package. `None` if nothing depends on it.
    pub fn package_detail(&self, name: &str) -> Option<PackageDetail> {
        let u = self.usage.get(name)?;
        let mut uses: Vec<PackageUse> = self
            .snapshot
            .repositories
            .iter()
            .flat_map(|r| r.all_dependencies().map(move |d| (r, d)))
            .filter(|(_, d)| d.name == name)
            .map(|(r, d)| PackageUse {
                repository: r.name.clone(),
                declared: d.declared.clone(),
                in_use: d.version_in_use().to_string(),
                resolved: d.resolved.to_string(),
                kind: d.kind,
                source_kind: d.source_kind(),
                source: d.source.location(),
                features: d.features.clone(),
            })
            .collect();
        uses.sort_by(|a, b| a.repository.cmp(&b.repository));

        let reference = u
            .latest
            .clone()
            .or_else(|| u.versions.keys().next_back().cloned());
        Some(PackageDetail {
            name: name.to_string(),
            usage_count: u.users.len(),
            in_hub: u.hub_version.is_some(),
            hub_version: u.hub_version.as_ref().map(ToString::to_string),
            latest: u.latest.as_ref().map(ToString::to_string),
            stability: reference
                .as_ref()
                .map_or(Stability::Unknown, stability),
            versions: self.version_map(u),
            uses,
        })
    }

    pub fn summary(&self) -> Summary {
        let mut by_source_kind = BTreeMap::new();
        let mut unresolved_dependencies = 0;
        for dep in self.snapshot.dependencies() {
            *by_source_kind
                .entry(dep.source_kind().to_string())
                .or_insert(0usize) += 1;
            if dep.resolved.is_sentinel() {
                unresolved_dependencies += 1;
            }
        }

        let hub_totals = self.hub_report().map(|r| HubTotals {
            current: r.current.len(),
            outdated: r.outdated.len(),
            ahead: r.ahead.len(),
            gaps: r.gaps.len(),
            unused: r.unused.len(),
            opportunities: r.opportunities.len(),
        });

        Summary {
            repositories: self.snapshot.repository_count(),
            internal_repositories: self
                .snapshot
                .repositories
                .iter()
                .filter(|r| r.is_internal)
                .count(),
            parse_errors: self
                .snapshot
                .repositories
                .iter()
                .filter(|r| r.parse_error.is_some())
                .count(),
            dependencies: self.snapshot.dependency_count(),
            packages: self.usage.len(),
            by_source_kind,
            conflicts: self.conflicts().len(),
            outdated: self.outdated().len(),
            unresolved_dependencies,
            hub: self.hub.map(|h| h.name.clone()),
            hub_totals,
        }
    }
}

/// Whether `current` trails `latest`, and whether catching up is breaking.
fn behind_latest(current: &CanonicalVersion, latest: Option<&CanonicalVersion>) -> (bool, bool) {
    match (current.release(), latest.and_then(CanonicalVersion::release)) {
        (Some(cur), Some(lat)) if lat > cur => (true, is_breaking(cur, lat)),
        _ => (false, false),
    }
}

/// The hub pins a release above the package's latest (for example a
/// pre-release while pre-releases are excluded from latest).
fn is_ahead(hub_version: &CanonicalVersion, latest: Option<&CanonicalVersion>) -> bool {
    match (hub_version.release(), latest.and_then(CanonicalVersion::release)) {
        (Some(hub), Some(lat)) => hub > lat,
        _ => false,
    }
}

fn build_usage(
    snapshot: &EcosystemSnapshot,
    hub: Option<RepoId>,
    include_prerelease: bool,
) -> BTreeMap<String, PackageUsage> {
    let mut usage: BTreeMap<String, PackageUsage> = BTreeMap::new();
    for repo in &snapshot.repositories {
        let is_hub = Some(repo.id) == hub;
        for dep in repo.all_dependencies() {
            let entry = usage.entry(dep.name.clone()).or_default();
            let in_use = dep.version_in_use();

            if is_hub && entry.hub_version.is_none() {
                entry.hub_version = Some(in_use.clone());
            }
            if !dep.counts_toward_usage() {
                continue;
            }
            if !is_hub {
                entry.users.insert(repo.id);
            }
            if !in_use.is_sentinel() {
                entry.versions.entry(in_use).or_default().insert(repo.id);
            }
        }
    }

    for dep in snapshot.dependencies() {
        if let Some(entry) = usage.get_mut(&dep.name) {
            let candidates = entry.latest.iter().chain(std::iter::once(&dep.resolved));
            entry.latest = select_latest(candidates, include_prerelease).cloned();
        }
    }
    usage
}
