//! Read-only file APIs of hosted git providers.
//!
//! Only public repositories are expected to answer; anything else falls through
//! to the git CLI, which classifies the failure.

use std::time::Duration;

use tracing::debug;

use crate::manifest::MANIFEST_FILE;
use crate::model::GitRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    GitHub,
    GitLab,
}

/// A remote URL recognized as belonging to a hosted provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedRepo {
    pub provider: Provider,
    /// `owner/repo` (GitLab: the full group path).
    pub path: String,
}

impl HostedRepo {
    /// Recognize `https://github.com/o/r(.git)`, `git@github.com:o/r.git`,
    /// `ssh://git@gitlab.com/g/sub/r.git` and similar.
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim();
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .or_else(|| url.strip_prefix("ssh://"))
            .or_else(|| url.strip_prefix("git://"))
            .unwrap_or(url);
        let rest = rest.split_once('@').map_or(rest, |(_, r)| r);
        let (host, path) = rest.split_once([':', '/'])?;
        // `host:port/path` from ssh:// URLs.
        let path = match path.split_once('/') {
            Some((port, p)) if port.chars().all(|c| c.is_ascii_digit()) => p,
            _ => path,
        };

        let provider = match host {
            "github.com" | "www.github.com" => Provider::GitHub,
            "gitlab.com" => Provider::GitLab,
            _ => return None,
        };
        let path = path.trim_end_matches('/').trim_end_matches(".git");
        if path.split('/').filter(|s| !s.is_empty()).count() < 2 {
            return None;
        }
        Some(Self {
            provider,
            path: path.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct HostedProvider {
    agent: ureq::Agent,
    timeout: Duration,
    github_api: String,
    gitlab_api: String,
}

impl HostedProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            timeout,
            github_api: "https://api.github.com".to_string(),
            gitlab_api: "https://gitlab.com/api/v4".to_string(),
        }
    }

    /// Raw `Cargo.toml` contents at `reference`, or `None` when the provider is
    /// unknown or did not answer.
    pub fn fetch_manifest(&self, url: &str, reference: &GitRef) -> Option<String> {
        let repo = HostedRepo::parse(url)?;
        let endpoint = self.endpoint(&repo, reference);
        let request = self
            .agent
            .get(&endpoint)
            .timeout(self.timeout)
            .set("User-Agent", "ecoscan (dependency ecosystem analysis)");
        let request = match repo.provider {
            Provider::GitHub => request.set("Accept", "application/vnd.github.raw"),
            Provider::GitLab => request,
        };
        match request.call() {
            Ok(resp) => resp.into_string().ok(),
            Err(e) => {
                debug!(%url, error = %e, "hosted API did not return a manifest");
                None
            }
        }
    }

    fn endpoint(&self, repo: &HostedRepo, reference: &GitRef) -> String {
        let git_ref = match reference {
            GitRef::DefaultBranch => None,
            other => Some(encode_component(other.as_arg())),
        };
        match repo.provider {
            Provider::GitHub => {
                let base = format!(
                    "{}/repos/{}/contents/{MANIFEST_FILE}",
                    self.github_api, repo.path
                );
                match git_ref {
                    Some(r) => format!("{base}?ref={r}"),
                    None => base,
                }
            }
            Provider::GitLab => format!(
                "{}/projects/{}/repository/files/{MANIFEST_FILE}/raw?ref={}",
                self.gitlab_api,
                encode_component(&repo.path),
                git_ref.as_deref().unwrap_or("HEAD"),
            ),
        }
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
