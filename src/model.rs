//! Snapshot data model: repositories, dependency edges, and the snapshot itself.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CacheIntegrityError;
use crate::version::CanonicalVersion;

/// Stable (per snapshot) repository identifier. Assigned in discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub u32);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Runtime,
    Dev,
    Build,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Registry,
    VersionControl,
    LocalPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LibraryType {
    Workspace,
    Library,
    Binary,
    #[default]
    Project,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other:?}", stringify!($ty))),
                }
            }
        }
    };
}

str_enum!(DependencyKind {
    Runtime => "runtime",
    Dev => "dev",
    Build => "build",
    Optional => "optional",
});

str_enum!(SourceKind {
    Registry => "registry",
    VersionControl => "version-control",
    LocalPath => "local-path",
});

str_enum!(LibraryType {
    Workspace => "workspace",
    Library => "library",
    Binary => "binary",
    Project => "project",
});

/// A git reference as declared next to a remote URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum GitRef {
    Rev(String),
    Tag(String),
    Branch(String),
    DefaultBranch,
}

impl GitRef {
    /// The ref as git accepts it on the command line.
    pub fn as_arg(&self) -> &str {
        match self {
            Self::Rev(s) | Self::Tag(s) | Self::Branch(s) => s,
            Self::DefaultBranch => "HEAD",
        }
    }
}

/// Where a dependency comes from. Two dependencies with equal `(name, Source)`
/// share one resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Source {
    Registry { registry: String },
    VersionControl { url: String, reference: GitRef },
    LocalPath { path: String },
}

pub const DEFAULT_REGISTRY: &str = "crates-io";

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Registry { .. } => SourceKind::Registry,
            Self::VersionControl { .. } => SourceKind::VersionControl,
            Self::LocalPath { .. } => SourceKind::LocalPath,
        }
    }

    /// Registry name, `url#ref`, or path: the single-string form stored in the cache.
    pub fn location(&self) -> String {
        match self {
            Self::Registry { registry } => registry.clone(),
            Self::VersionControl { url, reference } => match reference {
                GitRef::DefaultBranch => url.clone(),
                GitRef::Rev(r) => format!("{url}#rev={r}"),
                GitRef::Tag(t) => format!("{url}#tag={t}"),
                GitRef::Branch(b) => format!("{url}#branch={b}"),
            },
            Self::LocalPath { path } => path.clone(),
        }
    }

    /// Inverse of [`Source::location`].
    pub fn from_location(kind: SourceKind, location: &str) -> Self {
        match kind {
            SourceKind::Registry => Self::Registry {
                registry: if location.is_empty() {
                    DEFAULT_REGISTRY.to_string()
                } else {
                    location.to_string()
                },
            },
            SourceKind::LocalPath => Self::LocalPath {
                path: location.to_string(),
            },
            SourceKind::VersionControl => {
                let (url, reference) = match location.rsplit_once('#') {
                    Some((url, r)) => {
                        let reference = if let Some(v) = r.strip_prefix("rev=") {
                            GitRef::Rev(v.to_string())
                        } else if let Some(v) = r.strip_prefix("tag=") {
                            GitRef::Tag(v.to_string())
                        } else if let Some(v) = r.strip_prefix("branch=") {
                            GitRef::Branch(v.to_string())
                        } else {
                            GitRef::Rev(r.to_string())
                        };
                        (url, reference)
                    }
                    None => (location, GitRef::DefaultBranch),
                };
                Self::VersionControl {
                    url: url.to_string(),
                    reference,
                }
            }
        }
    }
}

/// One dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub id: u32,
    pub name: String,
    /// Constraint exactly as written in the manifest (or a marker such as `WORKSPACE`).
    pub declared: String,
    pub kind: DependencyKind,
    pub source: Source,
    /// Latest/resolved version in canonical form. Local-path sources are `LOCAL`.
    pub resolved: CanonicalVersion,
    pub features: Vec<String>,
    /// Owning repository (lookup only).
    pub repo: RepoId,
}

impl DependencyRecord {
    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    /// The version this repository actually pins, canonicalized.
    ///
    /// Registry dependencies pin their declared constraint. Version-control
    /// dependencies pin whatever the remote resolved to, so an unreachable remote
    /// yields a sentinel here. Local paths are always `LOCAL`.
    pub fn version_in_use(&self) -> CanonicalVersion {
        match self.source {
            Source::LocalPath { .. } => CanonicalVersion::Local,
            Source::VersionControl { .. } => {
                let declared = CanonicalVersion::parse(&self.declared);
                if declared.release().is_some() {
                    declared
                } else {
                    self.resolved.clone()
                }
            }
            Source::Registry { .. } => CanonicalVersion::parse(&self.declared),
        }
    }

    /// Whether this edge participates in conflict grouping and usage counts.
    pub fn counts_toward_usage(&self) -> bool {
        !self.version_in_use().is_local_marker()
    }
}

/// One discovered repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: RepoId,
    /// Directory relative to the scan root, `/`-separated.
    pub path: String,
    pub name: String,
    /// Declared package version, if any.
    pub version: Option<String>,
    pub is_internal: bool,
    pub org: String,
    pub group: String,
    pub library_type: LibraryType,
    pub dependencies: Vec<DependencyRecord>,
    pub dev_dependencies: Vec<DependencyRecord>,
    pub parse_error: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

pub const META_HUB_SYNC: &str = "hub_sync";
pub const META_PRIORITY: &str = "priority";

impl RepositoryRecord {
    pub fn new(id: RepoId, path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            name: name.into(),
            version: None,
            is_internal: false,
            org: String::new(),
            group: String::new(),
            library_type: LibraryType::Project,
            dependencies: Vec::new(),
            dev_dependencies: Vec::new(),
            parse_error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// All dependency edges, runtime list first, manifest order preserved.
    pub fn all_dependencies(&self) -> impl Iterator<Item = &DependencyRecord> {
        self.dependencies.iter().chain(self.dev_dependencies.iter())
    }

    pub fn all_dependencies_mut(&mut self) -> impl Iterator<Item = &mut DependencyRecord> {
        self.dependencies
            .iter_mut()
            .chain(self.dev_dependencies.iter_mut())
    }

    /// `hub_sync = false` in `[package.metadata.hub]`.
    pub fn hub_sync_opted_out(&self) -> bool {
        self.metadata
            .get(META_HUB_SYNC)
            .is_some_and(|v| v.eq_ignore_ascii_case("false"))
    }

    pub fn priority(&self) -> Option<&str> {
        self.metadata.get(META_PRIORITY).map(String::as_str)
    }
}

/// All repositories of one scan plus the tree hash they were built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcosystemSnapshot {
    pub schema_version: u32,
    pub tree_hash: String,
    pub root: PathBuf,
    pub repositories: Vec<RepositoryRecord>,
}

impl EcosystemSnapshot {
    pub fn repository_count(&self) -> usize {
        self.repositories.len()
    }

    pub fn dependency_count(&self) -> usize {
        self.repositories
            .iter()
            .map(|r| r.dependencies.len() + r.dev_dependencies.len())
            .sum()
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &DependencyRecord> {
        self.repositories.iter().flat_map(|r| r.all_dependencies())
    }

    pub fn repository(&self, id: RepoId) -> Option<&RepositoryRecord> {
        self.repositories.iter().find(|r| r.id == id)
    }

    /// Name-based lookup. When several repositories share a name, the first in
    /// path order wins.
    pub fn repository_by_name(&self, name: &str) -> Option<&RepositoryRecord> {
        self.repositories
            .iter()
            .filter(|r| r.name == name)
            .min_by(|a, b| a.path.cmp(&b.path))
    }

    /// Every dependency's repository reference must resolve inside this snapshot.
    pub fn validate(&self) -> Result<(), CacheIntegrityError> {
        let ids: HashSet<RepoId> = self.repositories.iter().map(|r| r.id).collect();
        for dep in self.dependencies() {
            if !ids.contains(&dep.repo) {
                return Err(CacheIntegrityError::OrphanDependency {
                    dep: dep.id,
                    repo: dep.repo.0,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(id: u32, repo: u32, declared: &str, source: Source) -> DependencyRecord {
        DependencyRecord {
            id,
            name: "serde".into(),
            declared: declared.into(),
            kind: DependencyKind::Runtime,
            source,
            resolved: CanonicalVersion::parse("1.0.200"),
            features: vec![],
            repo: RepoId(repo),
        }
    }

    fn registry() -> Source {
        Source::Registry {
            registry: DEFAULT_REGISTRY.into(),
        }
    }

    #[test]
    fn source_location_round_trips() {
        let sources = [
            registry(),
            Source::LocalPath {
                path: "../core".into(),
            },
            Source::VersionControl {
                url: "https://github.com/o/r".into(),
                reference: GitRef::DefaultBranch,
            },
            Source::VersionControl {
                url: "ssh://git@gitlab.com/o/r.git".into(),
                reference: GitRef::Tag("v1.2.0".into()),
            },
            Source::VersionControl {
                url: "https://github.com/o/r".into(),
                reference: GitRef::Rev("abc123".into()),
            },
        ];
        for s in sources {
            assert_eq!(Source::from_location(s.kind(), &s.location()), s);
        }
    }

    #[test]
    fn version_in_use_depends_on_source() {
        let d = dep(1, 1, "1.0", registry());
        assert_eq!(d.version_in_use(), CanonicalVersion::parse("1.0.0"));

        let d = dep(
            2,
            1,
            "",
            Source::LocalPath {
                path: "../x".into(),
            },
        );
        assert_eq!(d.version_in_use(), CanonicalVersion::Local);
        assert!(!d.counts_toward_usage());

        let mut d = dep(
            3,
            1,
            "",
            Source::VersionControl {
                url: "https://example.com/r".into(),
                reference: GitRef::DefaultBranch,
            },
        );
        d.resolved = CanonicalVersion::parse("TIMEOUT");
        assert!(d.version_in_use().is_sentinel());
    }

    #[test]
    fn validate_detects_orphans() {
        let mut repo = RepositoryRecord::new(RepoId(1), "a", "a");
        repo.dependencies.push(dep(1, 1, "1", registry()));
        let mut snap = EcosystemSnapshot {
            schema_version: 2,
            tree_hash: "h".into(),
            root: PathBuf::from("/r"),
            repositories: vec![repo],
        };
        assert!(snap.validate().is_ok());

        snap.repositories[0].dependencies.push(dep(2, 9, "1", registry()));
        match snap.validate() {
            Err(CacheIntegrityError::OrphanDependency { dep, repo }) => {
                assert_eq!((dep, repo), (2, 9));
            }
            other => panic!("expected orphan error, got {other:?}"),
        }
    }

    #[test]
    fn enum_strings_parse_back() {
        for k in [
            DependencyKind::Runtime,
            DependencyKind::Dev,
            DependencyKind::Build,
            DependencyKind::Optional,
        ] {
            assert_eq!(k.as_str().parse::<DependencyKind>().unwrap(), k);
        }
        assert_eq!(
            "version-control".parse::<SourceKind>().unwrap(),
            SourceKind::VersionControl
        );
        assert!("nope".parse::<LibraryType>().is_err());
    }
}
