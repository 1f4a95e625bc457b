//! Scan configuration.
//!
//! The engine never consults process environment; callers build a [`ScanConfig`]
//! and hand it to [`crate::scanner::Scanner::new`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REGISTRY_URL: &str = "https://crates.io/api/v1";

/// Directory names never descended into during discovery (in addition to
/// any dot-directory).
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "ref",
    "howto",
    "_arch",
    "archive",
    "bak",
];

/// Per-call timeouts. Every outbound call carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Each `git archive` / `git ls-remote` invocation.
    pub git: Duration,
    /// Each hosted-provider API request (GitHub/GitLab file read).
    pub api: Duration,
    pub registry_connect: Duration,
    pub registry_read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            git: Duration::from_secs(5),
            api: Duration::from_secs(5),
            registry_connect: Duration::from_secs(5),
            registry_read: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Directory whose subtree is scanned for manifests.
    pub root: PathBuf,

    /// Name of the hub repository, looked up by name at aggregation time.
    pub hub_name: Option<String>,

    /// Cache file location. `None` means `<root>/.ecoscan/deps_cache.tsv`.
    pub cache_path: Option<PathBuf>,

    /// Worker pool size for parsing and resolution.
    pub jobs: usize,

    pub timeouts: Timeouts,

    pub registry_url: String,

    /// Consider pre-release / build-tagged versions when picking "latest".
    pub include_prerelease: bool,

    /// Skip all registry and remote calls.
    pub offline: bool,

    /// Query GitHub/GitLab file APIs before falling back to git.
    pub hosted_api: bool,

    /// Resolve version-control dependencies from an internal repository of the
    /// same name when it is part of the scan.
    pub prefer_local_checkouts: bool,

    /// Minimum non-hub usage for a gap to be reported as an opportunity.
    pub opportunity_threshold: usize,

    /// Ignore a valid cache and rebuild.
    pub refresh: bool,

    pub excluded_dirs: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            hub_name: None,
            cache_path: None,
            jobs: 8,
            timeouts: Timeouts::default(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            include_prerelease: false,
            offline: false,
            hosted_api: true,
            prefer_local_checkouts: true,
            opportunity_threshold: 5,
            refresh: false,
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ScanConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_hub(mut self, name: impl Into<String>) -> Self {
        self.hub_name = Some(name.into());
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    pub fn with_prerelease(mut self, include: bool) -> Self {
        self.include_prerelease = include;
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_hosted_api(mut self, enabled: bool) -> Self {
        self.hosted_api = enabled;
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_opportunity_threshold(mut self, threshold: usize) -> Self {
        self.opportunity_threshold = threshold;
        self
    }

    pub fn cache_file(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| default_cache_path(&self.root))
    }

    /// Whether discovery should skip a directory with this name.
    pub fn is_excluded_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.excluded_dirs.iter().any(|d| d == name)
    }

    /// Settings that change the cached snapshot. Folded into the tree hash so a
    /// config change invalidates the cache. The hub is picked at aggregation
    /// time and stays out of it.
    pub fn fingerprint(&self) -> String {
        format!(
            "registry={}\nprerelease={}\noffline={}\nhosted_api={}\nlocal_checkouts={}\n",
            self.registry_url,
            self.include_prerelease,
            self.offline,
            self.hosted_api,
            self.prefer_local_checkouts,
        )
    }
}

pub fn default_cache_path(root: &Path) -> PathBuf {
    root.join(".ecoscan").join("deps_cache.tsv")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_defaults_under_root() {
        let cfg = ScanConfig::new("/dev/rust");
        assert_eq!(
            cfg.cache_file(),
            PathBuf::from("/dev/rust/.ecoscan/deps_cache.tsv")
        );
        let cfg = cfg.with_cache_path("/tmp/c.tsv");
        assert_eq!(cfg.cache_file(), PathBuf::from("/tmp/c.tsv"));
    }

    #[test]
    fn excluded_dirs_include_dot_dirs() {
        let cfg = ScanConfig::default();
        assert!(cfg.is_excluded_dir(".git"));
        assert!(cfg.is_excluded_dir("target"));
        assert!(!cfg.is_excluded_dir("src"));
    }

    #[test]
    fn fingerprint_tracks_result_affecting_settings() {
        let a = ScanConfig::new("/r");
        let b = ScanConfig::new("/r").with_prerelease(true);
        let c = ScanConfig::new("/r").with_jobs(2);
        let d = ScanConfig::new("/r").with_hub("hub");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint(), d.fingerprint());
    }
}
