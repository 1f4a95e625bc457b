//! `Cargo.toml` parsing into dependency records.
//!
//! Source kind is decided from the shape of each entry:
//! - `"1.0"` or `{ version = "1.0" }` → registry
//! - `{ git = "...", rev/tag/branch = "..." }` → version control
//! - `{ path = "../sibling" }` → local path (never resolved remotely)
//! - `{ workspace = true }` → inherited; see [`inherit_workspace`]

use std::collections::BTreeMap;
use std::path::Path;

use toml::{Table, Value};
use tracing::debug;

use crate::error::ManifestParseError;
use crate::model::{
    DependencyKind, DependencyRecord, GitRef, LibraryType, RepoId, Source, DEFAULT_REGISTRY,
};
use crate::version::{CanonicalVersion, Sentinel, WORKSPACE_MARKER};

pub const MANIFEST_FILE: &str = "Cargo.toml";

/// Everything the scanner needs from one manifest.
#[derive(Debug, Clone, Default)]
pub struct ParsedManifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub is_internal: bool,
    pub library_type: LibraryType,
    /// Scalar values of `[package.metadata.hub]`, stringified.
    pub metadata: BTreeMap<String, String>,
    /// Manifest order: `[dependencies]`, `[dev-dependencies]`,
    /// `[build-dependencies]`, then target-specific tables.
    pub dependencies: Vec<DependencyRecord>,
    /// `[workspace.dependencies]`, for members that inherit with `workspace = true`.
    pub workspace_dependencies: Vec<DependencyRecord>,
}

/// Read and parse one manifest file.
pub fn parse_manifest(path: &Path, repo: RepoId) -> Result<ParsedManifest, ManifestParseError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ManifestParseError::io(path.to_path_buf(), &e))?;
    parse_manifest_str(&text, path, repo)
}

/// Parse manifest text. `path` is only used for error reporting.
pub fn parse_manifest_str(
    text: &str,
    path: &Path,
    repo: RepoId,
) -> Result<ParsedManifest, ManifestParseError> {
    let doc: Table = text
        .parse()
        .map_err(|e| ManifestParseError::from_toml(path.to_path_buf(), text, &e))?;

    let package = doc.get("package").and_then(Value::as_table);
    let name = package
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let version = package
        .and_then(|p| p.get("version"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut dependencies = Vec::new();
    collect_section(&doc, repo, &mut dependencies);
    if let Some(targets) = doc.get("target").and_then(Value::as_table) {
        for target in targets.values().filter_map(Value::as_table) {
            collect_section(target, repo, &mut dependencies);
        }
    }

    let workspace_dependencies = doc
        .get("workspace")
        .and_then(|w| w.get("dependencies"))
        .and_then(Value::as_table)
        .map(|t| parse_table(t, DependencyKind::Runtime, repo))
        .unwrap_or_default();

    Ok(ParsedManifest {
        name,
        version,
        is_internal: detect_internal(package),
        library_type: detect_library_type(&doc),
        metadata: hub_metadata(package),
        dependencies,
        workspace_dependencies,
    })
}

/// `package.version` of a manifest fetched from a remote, falling back to
/// `workspace.package.version` for inherited or virtual manifests.
pub fn package_version_from_str(text: &str) -> Option<String> {
    let doc: Table = text.parse().ok()?;
    let direct = doc
        .get("package")
        .and_then(|p| p.get("version"))
        .and_then(Value::as_str);
    let inherited = || {
        doc.get("workspace")
            .and_then(|w| w.get("package"))
            .and_then(|p| p.get("version"))
            .and_then(Value::as_str)
    };
    direct.or_else(inherited).map(str::to_string)
}

fn collect_section(table: &Table, repo: RepoId, out: &mut Vec<DependencyRecord>) {
    const SECTIONS: &[(&str, DependencyKind)] = &[
        ("dependencies", DependencyKind::Runtime),
        ("dev-dependencies", DependencyKind::Dev),
        ("dev_dependencies", DependencyKind::Dev),
        ("build-dependencies", DependencyKind::Build),
        ("build_dependencies", DependencyKind::Build),
    ];
    for (key, kind) in SECTIONS {
        if let Some(deps) = table.get(*key).and_then(Value::as_table) {
            out.extend(parse_table(deps, *kind, repo));
        }
    }
}

fn parse_table(deps: &Table, kind: DependencyKind, repo: RepoId) -> Vec<DependencyRecord> {
    deps.iter()
        .filter_map(|(key, value)| {
            let dep = parse_entry(key, value, kind, repo);
            if dep.is_none() {
                debug!(
                    dependency = %key,
                    "skipping dependency entry without version, git, path or workspace"
                );
            }
            dep
        })
        .collect()
}

fn record(
    name: &str,
    declared: String,
    kind: DependencyKind,
    source: Source,
    features: Vec<String>,
    repo: RepoId,
) -> DependencyRecord {
    let resolved = match source {
        Source::LocalPath { .. } => CanonicalVersion::Local,
        _ if declared == WORKSPACE_MARKER => CanonicalVersion::Workspace,
        _ => CanonicalVersion::Sentinel(Sentinel::Unknown),
    };
    DependencyRecord {
        id: 0,
        name: name.to_string(),
        declared,
        kind,
        source,
        resolved,
        features,
        repo,
    }
}

fn parse_entry(
    key: &str,
    value: &Value,
    kind: DependencyKind,
    repo: RepoId,
) -> Option<DependencyRecord> {
    match value {
        Value::String(v) => Some(record(
            key,
            v.clone(),
            kind,
            Source::Registry {
                registry: DEFAULT_REGISTRY.to_string(),
            },
            Vec::new(),
            repo,
        )),
        Value::Table(t) => {
            // `foo = { package = "bar" }` depends on crate `bar`.
            let name = t.get("package").and_then(Value::as_str).unwrap_or(key);
            let kind = if kind == DependencyKind::Runtime
                && t.get("optional").and_then(Value::as_bool) == Some(true)
            {
                DependencyKind::Optional
            } else {
                kind
            };
            let features: Vec<String> = t
                .get("features")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let declared = t
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string);

            let source = if let Some(url) = t.get("git").and_then(Value::as_str) {
                Source::VersionControl {
                    url: url.to_string(),
                    reference: git_ref(t),
                }
            } else if let Some(path) = t.get("path").and_then(Value::as_str) {
                Source::LocalPath {
                    path: path.to_string(),
                }
            } else if t.get("workspace").and_then(Value::as_bool) == Some(true) {
                return Some(record(
                    name,
                    WORKSPACE_MARKER.to_string(),
                    kind,
                    Source::Registry {
                        registry: DEFAULT_REGISTRY.to_string(),
                    },
                    features,
                    repo,
                ));
            } else if declared.is_some() {
                Source::Registry {
                    registry: t
                        .get("registry")
                        .and_then(Value::as_str)
                        .unwrap_or(DEFAULT_REGISTRY)
                        .to_string(),
                }
            } else {
                return None;
            };

            Some(record(
                name,
                declared.unwrap_or_default(),
                kind,
                source,
                features,
                repo,
            ))
        }
        _ => None,
    }
}

fn git_ref(t: &Table) -> GitRef {
    let get = |k: &str| t.get(k).and_then(Value::as_str).map(str::to_string);
    if let Some(rev) = get("rev") {
        GitRef::Rev(rev)
    } else if let Some(tag) = get("tag") {
        GitRef::Tag(tag)
    } else if let Some(branch) = get("branch") {
        GitRef::Branch(branch)
    } else {
        GitRef::DefaultBranch
    }
}

/// Replace a `workspace = true` placeholder with the workspace's declaration.
/// Member-level kind is kept and features are unioned. Returns false when the
/// workspace does not declare the dependency.
pub fn inherit_workspace(dep: &mut DependencyRecord, workspace: &[DependencyRecord]) -> bool {
    if dep.declared != WORKSPACE_MARKER {
        return false;
    }
    let Some(decl) = workspace.iter().find(|w| w.name == dep.name) else {
        return false;
    };
    dep.declared = decl.declared.clone();
    dep.source = decl.source.clone();
    dep.resolved = decl.resolved.clone();
    for f in &decl.features {
        if !dep.features.contains(f) {
            dep.features.push(f.clone());
        }
    }
    true
}

/// Unpublished or privately hosted packages count as internal.
fn detect_internal(package: Option<&Table>) -> bool {
    let Some(package) = package else {
        return false;
    };

    match package.get("publish") {
        Some(Value::Boolean(b)) => return !b,
        Some(Value::Array(a)) if a.is_empty() => return true,
        _ => {}
    }

    let license = package
        .get("license")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    if license.contains("private") || license.contains("none") {
        return true;
    }

    let repository = package
        .get("repository")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    ["gitlab", "ssh://", "internal", "private"]
        .iter()
        .any(|m| repository.contains(m))
}

fn detect_library_type(doc: &Table) -> LibraryType {
    if doc.contains_key("workspace") {
        LibraryType::Workspace
    } else if doc.contains_key("lib") {
        LibraryType::Library
    } else if doc
        .get("bin")
        .and_then(Value::as_array)
        .is_some_and(|b| !b.is_empty())
    {
        LibraryType::Binary
    } else {
        LibraryType::Project
    }
}

fn hub_metadata(package: Option<&Table>) -> BTreeMap<String, String> {
    let Some(hub) = package
        .and_then(|p| p.get("metadata"))
        .and_then(|m| m.get("hub"))
        .and_then(Value::as_table)
    else {
        return BTreeMap::new();
    };
    hub.iter()
        .filter_map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                Value::Boolean(b) => b.to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Float(f) => f.to_string(),
                _ => return None,
            };
            Some((k.clone(), s))
        })
        .collect()
}
