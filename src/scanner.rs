//! Scanner/Orchestrator.
//!
//! One scan: discover manifests, hash them, reuse the cache when the hash
//! matches, otherwise parse every manifest and resolve each distinct
//! `(name, source)` pair exactly once on a bounded worker pool.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{self, CacheStore, SCHEMA_VERSION};
use crate::config::ScanConfig;
use crate::error::{CacheIntegrityError, CacheWriteError, Error, ManifestParseError, Result};
use crate::manifest::{inherit_workspace, parse_manifest, ParsedManifest, MANIFEST_FILE};
use crate::model::{
    DependencyKind, DependencyRecord, EcosystemSnapshot, RepoId, RepositoryRecord, Source,
};
use crate::resolve::{ReachabilityReport, Resolve, ResolveRequest, VersionResolver};
use crate::version::{CanonicalVersion, WORKSPACE_MARKER};

/// A directory holding a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRepo {
    /// Relative to the scan root, `/`-separated; `.` for the root itself.
    pub rel_path: String,
    pub manifest: PathBuf,
}

impl DiscoveredRepo {
    fn manifest_rel(&self) -> String {
        if self.rel_path == "." {
            MANIFEST_FILE.to_string()
        } else {
            format!("{}/{MANIFEST_FILE}", self.rel_path)
        }
    }
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub snapshot: EcosystemSnapshot,
    /// Served from a cache whose tree hash matched.
    pub from_cache: bool,
    /// Per-repository parse failures and cache recovery notes.
    pub warnings: Vec<String>,
    /// Persisting failed; `snapshot` is still complete.
    pub cache_error: Option<CacheWriteError>,
    /// Calls made into the resolver during this scan.
    pub resolution_calls: usize,
}

pub struct Scanner {
    config: ScanConfig,
    resolver: Arc<dyn Resolve>,
    store: CacheStore,
}

impl Scanner {
    pub fn new(config: ScanConfig, resolver: Arc<dyn Resolve>) -> Self {
        let store = CacheStore::new(config.cache_file());
        Self {
            config,
            resolver,
            store,
        }
    }

    /// Scanner backed by the registry/git resolver built from `config`.
    pub fn with_network_resolver(config: ScanConfig) -> Result<Self> {
        let resolver = VersionResolver::from_config(&config)?;
        Ok(Self::new(config, Arc::new(resolver)))
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.store
    }

    fn root(&self) -> Result<PathBuf> {
        if !self.config.root.is_dir() {
            return Err(Error::InvalidRoot(self.config.root.clone()));
        }
        Ok(self.config.root.canonicalize()?)
    }

    /// Every directory under the root that holds a manifest, in path order.
    /// Symlinked duplicates collapse onto one entry.
    pub fn discover(&self) -> Result<Vec<DiscoveredRepo>> {
        let root = self.root()?;
        discover_in(&root, &self.config)
    }

    /// Full scan, or cache hydration when nothing changed.
    pub fn scan(&self) -> Result<ScanOutcome> {
        let root = self.root()?;
        let repos = discover_in(&root, &self.config)?;
        let manifests: Vec<(String, PathBuf)> = repos
            .iter()
            .map(|r| (r.manifest_rel(), r.manifest.clone()))
            .collect();
        let tree_hash = cache::tree_hash(&manifests, &self.config.fingerprint());
        info!(repositories = repos.len(), root = %root.display(), "discovered repositories");

        let mut warnings = Vec::new();
        if self.config.refresh {
            debug!("refresh requested, skipping cache");
        } else {
            match self.store.load(&root) {
                Ok(snapshot) if snapshot.tree_hash == tree_hash => {
                    info!(path = %self.store.path().display(), "tree unchanged, using cache");
                    return Ok(ScanOutcome {
                        snapshot,
                        from_cache: true,
                        warnings,
                        cache_error: None,
                        resolution_calls: 0,
                    });
                }
                Ok(_) => debug!("tree hash changed, rebuilding"),
                Err(CacheIntegrityError::Missing(_)) => debug!("no cache yet"),
                Err(e) => {
                    warn!(error = %e, "cache unusable, rebuilding");
                    warnings.push(format!("cache ignored: {e}"));
                }
            }
        }

        let mut repositories = self.collect_repositories(&repos, &mut warnings);
        let resolution_calls = self.resolve_all(&mut repositories);

        let snapshot = EcosystemSnapshot {
            schema_version: SCHEMA_VERSION,
            tree_hash,
            root,
            repositories,
        };
        snapshot.validate()?;

        let cache_error = match self.store.save(&snapshot) {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "cache not written");
                Some(e)
            }
        };

        info!(
            repositories = snapshot.repository_count(),
            dependencies = snapshot.dependency_count(),
            resolution_calls,
            "scan complete"
        );
        Ok(ScanOutcome {
            snapshot,
            from_cache: false,
            warnings,
            cache_error,
            resolution_calls,
        })
    }

    /// Reachability of every distinct version-control remote in the tree.
    /// Reads manifests only; the cache is neither read nor written.
    pub fn check_git(&self) -> Result<Vec<ReachabilityReport>> {
        let root = self.root()?;
        let repos = discover_in(&root, &self.config)?;
        let mut warnings = Vec::new();
        let repositories = self.collect_repositories(&repos, &mut warnings);

        let mut remotes: BTreeMap<(String, String), (Source, BTreeSet<String>)> = BTreeMap::new();
        for dep in repositories.iter().flat_map(|r| r.all_dependencies()) {
            if let Source::VersionControl { url, reference } = &dep.source {
                remotes
                    .entry((url.clone(), reference.as_arg().to_string()))
                    .or_insert_with(|| (dep.source.clone(), BTreeSet::new()))
                    .1
                    .insert(dep.name.clone());
            }
        }
        info!(remotes = remotes.len(), "checking remote reachability");

        let jobs: Vec<_> = remotes.into_iter().collect();
        let resolver = &self.resolver;
        let reports = run_pooled(self.config.jobs, &jobs, |((url, reference), (source, packages))| {
            let status = match source {
                Source::VersionControl { reference, .. } => {
                    resolver.probe_remote(url, reference).into_canonical()
                }
                _ => CanonicalVersion::Sentinel(crate::version::Sentinel::Unknown),
            };
            ReachabilityReport {
                url: url.clone(),
                reference: reference.clone(),
                packages: packages.iter().cloned().collect(),
                status,
            }
        });
        Ok(reports)
    }

    /// Parse, classify and inherit; no resolution yet.
    fn collect_repositories(
        &self,
        repos: &[DiscoveredRepo],
        warnings: &mut Vec<String>,
    ) -> Vec<RepositoryRecord> {
        let indexed: Vec<(usize, &DiscoveredRepo)> = repos.iter().enumerate().collect();
        let parsed: Vec<std::result::Result<ParsedManifest, ManifestParseError>> =
            run_pooled(self.config.jobs, &indexed, |(i, repo)| {
                parse_manifest(&repo.manifest, repo_id(*i))
            });

        let workspaces: HashMap<&str, &ParsedManifest> = repos
            .iter()
            .zip(&parsed)
            .filter_map(|(repo, p)| match p {
                Ok(m) if !m.workspace_dependencies.is_empty() => Some((repo.rel_path.as_str(), m)),
                _ => None,
            })
            .collect();

        let mut out = Vec::with_capacity(repos.len());
        let mut next_dep_id = 1u32;
        for (i, (repo, parsed)) in repos.iter().zip(&parsed).enumerate() {
            let dir_name = match repo.rel_path.rsplit('/').next() {
                Some(".") | None => root_dir_name(&self.config.root),
                Some(n) => n.to_string(),
            };
            let (org, group) = org_and_group(&repo.rel_path, &dir_name);

            let mut record = match parsed {
                Ok(m) => {
                    let mut r = RepositoryRecord::new(
                        repo_id(i),
                        repo.rel_path.clone(),
                        m.name.clone().unwrap_or_else(|| dir_name.clone()),
                    );
                    r.version = m.version.clone();
                    r.is_internal = m.is_internal;
                    r.library_type = m.library_type;
                    r.metadata = m.metadata.clone();
                    if r.hub_sync_opted_out() {
                        debug!(repository = %r.name, "hub_sync disabled, skipping dependencies");
                    } else {
                        for mut dep in m.dependencies.iter().cloned() {
                            if dep.declared == WORKSPACE_MARKER {
                                inherit_from_ancestors(&mut dep, &repo.rel_path, &workspaces);
                            }
                            match dep.kind {
                                DependencyKind::Runtime | DependencyKind::Optional => {
                                    r.dependencies.push(dep)
                                }
                                DependencyKind::Dev | DependencyKind::Build => {
                                    r.dev_dependencies.push(dep)
                                }
                            }
                        }
                    }
                    r
                }
                Err(e) => {
                    warn!(repository = %repo.rel_path, error = %e, "manifest parse failed");
                    warnings.push(e.to_string());
                    let mut r =
                        RepositoryRecord::new(repo_id(i), repo.rel_path.clone(), dir_name.clone());
                    r.parse_error = Some(e.to_string());
                    r
                }
            };
            record.org = org;
            record.group = group;
            for dep in record.all_dependencies_mut() {
                dep.id = next_dep_id;
                next_dep_id += 1;
            }
            out.push(record);
        }
        out
    }

    /// Fill in `resolved` for every dependency. Returns the number of resolver
    /// calls made.
    fn resolve_all(&self, repositories: &mut [RepositoryRecord]) -> usize {
        let mut local_versions: HashMap<String, CanonicalVersion> = HashMap::new();
        if self.config.prefer_local_checkouts {
            local_versions.extend(repositories.iter().filter(|r| r.is_internal).filter_map(|r| {
                let v = CanonicalVersion::parse(r.version.as_deref()?);
                v.release().is_some().then(|| (r.name.clone(), v))
            }));
        }

        let mut pending: BTreeSet<(String, Source)> = BTreeSet::new();
        for dep in repositories.iter().flat_map(|r| r.all_dependencies()) {
            if needs_resolution(dep) && !is_local_checkout(dep, &local_versions) {
                pending.insert((dep.name.clone(), dep.source.clone()));
            }
        }

        let jobs: Vec<(String, Source)> = pending.into_iter().collect();
        let resolver = &self.resolver;
        let outcomes = run_pooled(self.config.jobs, &jobs, |(name, source)| {
            resolver
                .resolve(&ResolveRequest { name, source })
                .into_canonical()
        });
        let resolved: HashMap<&(String, Source), CanonicalVersion> =
            jobs.iter().zip(outcomes).collect();

        let mut seen = HashSet::new();
        for repo in repositories.iter_mut() {
            for dep in repo.all_dependencies_mut() {
                if !needs_resolution(dep) {
                    continue;
                }
                if is_local_checkout(dep, &local_versions) {
                    if let Some(v) = local_versions.get(&dep.name) {
                        dep.resolved = v.clone();
                    }
                    continue;
                }
                let key = (dep.name.clone(), dep.source.clone());
                if let Some(v) = resolved.get(&key) {
                    if v.is_sentinel() && seen.insert(key.clone()) {
                        debug!(dependency = %dep.name, outcome = %v, "unresolved");
                    }
                    dep.resolved = v.clone();
                }
            }
        }
        jobs.len()
    }
}

fn repo_id(index: usize) -> RepoId {
    RepoId(u32::try_from(index + 1).unwrap_or(u32::MAX))
}

fn needs_resolution(dep: &DependencyRecord) -> bool {
    !matches!(dep.source, Source::LocalPath { .. }) && dep.declared != WORKSPACE_MARKER
}

fn is_local_checkout(dep: &DependencyRecord, local: &HashMap<String, CanonicalVersion>) -> bool {
    matches!(dep.source, Source::VersionControl { .. }) && local.contains_key(&dep.name)
}

/// Nearest ancestor (the repository itself included) with
/// `[workspace.dependencies]` supplies the declaration.
fn inherit_from_ancestors(
    dep: &mut DependencyRecord,
    rel_path: &str,
    workspaces: &HashMap<&str, &ParsedManifest>,
) {
    let mut current = rel_path.to_string();
    loop {
        if let Some(ws) = workspaces.get(current.as_str()) {
            if inherit_workspace(dep, &ws.workspace_dependencies) {
                return;
            }
        }
        current = match current.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None if current != "." => ".".to_string(),
            None => return,
        };
    }
}

/// Organization is the parent directory, group the repository directory.
fn org_and_group(rel_path: &str, dir_name: &str) -> (String, String) {
    let segments: Vec<&str> = rel_path.split('/').filter(|s| *s != ".").collect();
    let org = match segments.len() {
        0 | 1 => "root".to_string(),
        n => segments[n - 2].to_string(),
    };
    (org, dir_name.to_string())
}

fn root_dir_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "root".to_string())
}

fn discover_in(root: &Path, config: &ScanConfig) -> Result<Vec<DiscoveredRepo>> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !config.is_excluded_dir(&e.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        if !seen.insert(canonical) {
            debug!(path = %dir.display(), "duplicate repository via symlink");
            continue;
        }
        let rel = dir.strip_prefix(root).unwrap_or(dir);
        let rel_path = if rel.as_os_str().is_empty() {
            ".".to_string()
        } else {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        };
        found.push(DiscoveredRepo {
            rel_path,
            manifest: entry.path().to_path_buf(),
        });
    }
    found.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(found)
}

/// Map `f` over `items` on a pool of `jobs` threads, preserving order. Falls
/// back to the calling thread if the pool cannot be built.
fn run_pooled<T, R, F>(jobs: usize, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    match rayon::ThreadPoolBuilder::new().num_threads(jobs.max(1)).build() {
        Ok(pool) => pool.install(|| items.par_iter().map(&f).collect()),
        Err(e) => {
            warn!(error = %e, "worker pool unavailable, running sequentially");
            items.iter().map(f).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GitRef;
    use crate::resolve::ResolutionOutcome;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        calls: AtomicUsize,
    }

    impl Resolve for Fixed {
        fn resolve(&self, request: &ResolveRequest<'_>) -> ResolutionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match request.source {
                Source::VersionControl { .. } => ResolutionOutcome::TimedOut,
                _ => ResolutionOutcome::Version(CanonicalVersion::parse("9.9.9")),
            }
        }

        fn probe_remote(&self, _url: &str, _reference: &GitRef) -> ResolutionOutcome {
            ResolutionOutcome::Revision("cafebabe".into())
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    }

    fn scanner(root: &Path) -> (Scanner, Arc<Fixed>) {
        let fixed = Arc::new(Fixed {
            calls: AtomicUsize::new(0),
        });
        let cfg = ScanConfig::new(root).with_jobs(2);
        (Scanner::new(cfg, fixed.clone()), fixed)
    }

    #[test]
    fn discovery_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b", "[package]\nname = \"b\"\n");
        write(dir.path(), "a", "[package]\nname = \"a\"\n");
        write(dir.path(), "a/target/debug", "[package]\nname = \"junk\"\n");
        write(dir.path(), ".hidden", "[package]\nname = \"junk\"\n");
        let (s, _) = scanner(dir.path());
        let found: Vec<String> = s.discover().unwrap().into_iter().map(|r| r.rel_path).collect();
        assert_eq!(found, ["a", "b"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_repository_is_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "real", "[package]\nname = \"real\"\n");
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
        let (s, _) = scanner(dir.path());
        assert_eq!(s.discover().unwrap().len(), 1);
    }

    #[test]
    fn each_distinct_pair_resolved_once() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            write(
                dir.path(),
                name,
                &format!(
                    "[package]\nname = \"{name}\"\n[dependencies]\nserde = \"1\"\nanyhow = \"1\"\n"
                ),
            );
        }
        let (s, fixed) = scanner(dir.path());
        let out = s.scan().unwrap();
        assert_eq!(out.resolution_calls, 2);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 2);
        assert!(out
            .snapshot
            .dependencies()
            .all(|d| d.resolved == CanonicalVersion::parse("9.9.9")));
        let ids: Vec<u32> = out.snapshot.dependencies().map(|d| d.id).collect();
        assert_eq!(ids, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn parse_failure_is_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good", "[package]\nname = \"good\"\n[dependencies]\nlog = \"0.4\"\n");
        write(dir.path(), "bad", "[package\nname = ");
        let (s, _) = scanner(dir.path());
        let out = s.scan().unwrap();
        assert_eq!(out.snapshot.repository_count(), 2);
        let bad = out.snapshot.repository_by_name("bad").unwrap();
        assert!(bad.parse_error.is_some());
        assert!(bad.dependencies.is_empty());
        assert_eq!(out.warnings.len(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unreadable_manifest_is_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good", "[package]\nname = \"good\"\n[dependencies]\nlog = \"0.4\"\n");
        fs::create_dir_all(dir.path().join("bad")).unwrap();
        // Reading /proc/self/mem from offset 0 fails with EIO.
        let target = dir.path().join("bad").join(MANIFEST_FILE);
        std::os::unix::fs::symlink("/proc/self/mem", target).unwrap();
        let (s, _) = scanner(dir.path());
        let out = s.scan().unwrap();
        assert_eq!(out.snapshot.repository_count(), 2);
        let bad = out.snapshot.repository_by_name("bad").unwrap();
        assert!(bad.parse_error.is_some());
        assert!(out.snapshot.repository_by_name("good").unwrap().parse_error.is_none());
        assert_eq!(out.warnings.len(), 1);

        let again = s.scan().unwrap();
        assert!(again.from_cache);
        assert_eq!(again.snapshot.repository_count(), 2);
    }

    #[test]
    fn classification_and_opt_out() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "acme/tools/cli",
            "[package]\nname = \"cli\"\npublish = false\n[package.metadata.hub]\nhub_sync = \"false\"\n[dependencies]\nserde = \"1\"\n",
        );
        let (s, fixed) = scanner(dir.path());
        let out = s.scan().unwrap();
        let repo = &out.snapshot.repositories[0];
        assert_eq!((repo.org.as_str(), repo.group.as_str()), ("tools", "cli"));
        assert!(repo.is_internal);
        assert!(repo.dependencies.is_empty());
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn workspace_members_inherit_and_local_checkouts_win() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "mono",
            "[workspace]\nmembers = [\"crates/app\"]\n[workspace.dependencies]\nregex = \"1.10\"\n",
        );
        write(
            dir.path(),
            "mono/crates/app",
            "[package]\nname = \"app\"\n[dependencies]\nregex = { workspace = true }\nshared = { git = \"https://example.com/shared\" }\n",
        );
        write(
            dir.path(),
            "shared",
            "[package]\nname = \"shared\"\nversion = \"0.7.1\"\npublish = false\n",
        );
        let (s, _) = scanner(dir.path());
        let out = s.scan().unwrap();
        let app = out.snapshot.repository_by_name("app").unwrap();
        let regex = app.dependencies.iter().find(|d| d.name == "regex").unwrap();
        assert_eq!(regex.declared, "1.10");
        let shared = app.dependencies.iter().find(|d| d.name == "shared").unwrap();
        assert_eq!(shared.resolved, CanonicalVersion::parse("0.7.1"));
        // regex only; the git dependency came from the local checkout.
        assert_eq!(out.resolution_calls, 1);
    }

    #[test]
    fn check_git_reports_each_remote_once() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            write(
                dir.path(),
                name,
                &format!(
                    "[package]\nname = \"{name}\"\n[dependencies]\n\
                     remote = {{ git = \"https://example.com/remote\", branch = \"main\" }}\n"
                ),
            );
        }
        let (s, fixed) = scanner(dir.path());
        let reports = s.check_git().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reference, "main");
        assert_eq!(reports[0].packages, ["remote"]);
        assert_eq!(reports[0].status.to_string(), "GIT#cafebabe");
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
        assert!(!s.cache().path().exists());
    }

    #[test]
    fn invalid_root_is_an_error() {
        let (s, _) = scanner(Path::new("/nonexistent/ecoscan-root"));
        assert!(matches!(s.scan(), Err(Error::InvalidRoot(_))));
    }
}
