//! Version canonicalization.
//!
//! Every version string that enters a comparison goes through [`CanonicalVersion::parse`]
//! first. Releases are zero-padded to three segments (`2.0` ≡ `2.0.0`), leading
//! non-numeric prefixes and requirement operators are stripped, and pre-release
//! / build suffixes are kept for exact matching. Resolution outcomes that are not
//! versions canonicalize to themselves and never compete for "latest".

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Reserved non-version outcomes of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sentinel {
    AuthRequired,
    NotFound,
    Timeout,
    /// `0.0.0`: resolution could not even be attempted.
    Unknown,
}

impl Sentinel {
    pub const ALL: [Sentinel; 4] = [
        Sentinel::AuthRequired,
        Sentinel::NotFound,
        Sentinel::Timeout,
        Sentinel::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::NotFound => "NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "0.0.0",
        }
    }

    fn from_token(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|x| x.as_str() == s)
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const LOCAL_MARKER: &str = "LOCAL";
pub const WORKSPACE_MARKER: &str = "WORKSPACE";
pub const REVISION_PREFIX: &str = "GIT#";

/// Canonical, comparable form of a version string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalVersion {
    /// A real release, zero-padded to `major.minor.patch`.
    Release(semver::Version),
    /// Remote reachable but no manifest could be read: `GIT#<short-rev>`.
    Revision(String),
    /// Local path dependency; never resolved remotely.
    Local,
    /// Workspace-inherited dependency whose declaration could not be located.
    Workspace,
    Sentinel(Sentinel),
    /// Anything else (`*`, garbage); compared verbatim.
    Unrecognized(String),
}

impl CanonicalVersion {
    /// Canonicalize a version string or requirement.
    ///
    /// ```
    /// use ecoscan::version::CanonicalVersion;
    /// assert_eq!(CanonicalVersion::parse("2.0"), CanonicalVersion::parse("v2.0.0"));
    /// ```
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim().trim_matches('"').trim();
        if let Some(sentinel) = Sentinel::from_token(s) {
            return Self::Sentinel(sentinel);
        }
        if s == LOCAL_MARKER {
            return Self::Local;
        }
        if s == WORKSPACE_MARKER {
            return Self::Workspace;
        }
        if let Some(rev) = s.strip_prefix(REVISION_PREFIX) {
            return Self::Revision(rev.to_string());
        }

        match parse_release(s) {
            Some(v) if is_zero_release(&v) => Self::Sentinel(Sentinel::Unknown),
            Some(v) => Self::Release(v),
            None => Self::Unrecognized(s.to_string()),
        }
    }

    pub fn release(&self) -> Option<&semver::Version> {
        match self {
            Self::Release(v) => Some(v),
            _ => None,
        }
    }

    pub fn sentinel(&self) -> Option<Sentinel> {
        match self {
            Self::Sentinel(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::Sentinel(_))
    }

    /// Local and workspace markers are excluded from conflicts and usage counts.
    pub fn is_local_marker(&self) -> bool {
        matches!(self, Self::Local | Self::Workspace)
    }

    /// A stable release: no pre-release and no build metadata.
    pub fn is_stable_release(&self) -> bool {
        matches!(self, Self::Release(v) if v.pre.is_empty() && v.build.is_empty())
    }
}

impl fmt::Display for CanonicalVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release(v) => write!(f, "{v}"),
            Self::Revision(rev) => write!(f, "{REVISION_PREFIX}{rev}"),
            Self::Local => f.write_str(LOCAL_MARKER),
            Self::Workspace => f.write_str(WORKSPACE_MARKER),
            Self::Sentinel(s) => f.write_str(s.as_str()),
            Self::Unrecognized(s) => f.write_str(s),
        }
    }
}

impl Serialize for CanonicalVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CanonicalVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

// Releases order by semver; everything else sorts after releases, by display form.
impl Ord for CanonicalVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Release(a), Self::Release(b)) => a.cmp(b),
            (Self::Release(_), _) => Ordering::Less,
            (_, Self::Release(_)) => Ordering::Greater,
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl PartialOrd for CanonicalVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn is_zero_release(v: &semver::Version) -> bool {
    v.major == 0 && v.minor == 0 && v.patch == 0 && v.pre.is_empty() && v.build.is_empty()
}

fn parse_release(s: &str) -> Option<semver::Version> {
    // Requirements like ">=1.2, <2" canonicalize to their first comparator.
    let first = s.split(',').next()?.trim();
    let start = first.find(|c: char| c.is_ascii_digit())?;
    let body = &first[start..];
    let body = body.split_whitespace().next()?;

    let (rest, build) = match body.split_once('+') {
        Some((r, b)) => (r, b),
        None => (body, ""),
    };
    let (core, pre) = match rest.split_once('-') {
        Some((c, p)) => (c, p),
        None => (rest, ""),
    };

    let mut parts = [0u64; 3];
    let mut count = 0;
    for seg in core.split('.') {
        if count == 3 {
            return None;
        }
        parts[count] = match seg {
            "*" | "x" | "X" => 0,
            _ => seg.parse().ok()?,
        };
        count += 1;
    }

    let pre = if pre.is_empty() {
        semver::Prerelease::EMPTY
    } else {
        semver::Prerelease::new(pre).ok()?
    };
    let build = if build.is_empty() {
        semver::BuildMetadata::EMPTY
    } else {
        semver::BuildMetadata::new(build).ok()?
    };

    Some(semver::Version {
        major: parts[0],
        minor: parts[1],
        patch: parts[2],
        pre,
        build,
    })
}

/// Pick the highest release. Pre-releases and build-tagged versions only take
/// part when `include_prerelease` is set; non-release variants never do.
pub fn select_latest<'a, I>(versions: I, include_prerelease: bool) -> Option<&'a CanonicalVersion>
where
    I: IntoIterator<Item = &'a CanonicalVersion>,
{
    versions
        .into_iter()
        .filter(|v| match v {
            CanonicalVersion::Release(_) => include_prerelease || v.is_stable_release(),
            _ => false,
        })
        .max()
}

/// Whether moving from `from` to `to` crosses a Cargo compatibility boundary.
pub fn is_breaking(from: &semver::Version, to: &semver::Version) -> bool {
    if to.major != from.major {
        return to.major > from.major;
    }
    if from.major == 0 {
        if to.minor != from.minor {
            return to.minor > from.minor;
        }
        if from.minor == 0 {
            return to.patch > from.patch;
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stability {
    Stable,
    Unstable,
    PreRelease,
    Local,
    Unknown,
}

pub fn stability(v: &CanonicalVersion) -> Stability {
    match v {
        CanonicalVersion::Release(r) if !r.pre.is_empty() => Stability::PreRelease,
        CanonicalVersion::Release(r) if r.major == 0 => Stability::Unstable,
        CanonicalVersion::Release(_) => Stability::Stable,
        CanonicalVersion::Local | CanonicalVersion::Workspace => Stability::Local,
        _ => Stability::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cv(s: &str) -> CanonicalVersion {
        CanonicalVersion::parse(s)
    }

    #[test]
    fn zero_padding_makes_equivalent_releases_equal() {
        assert_eq!(cv("2.0"), cv("2.0.0"));
        assert_eq!(cv("2"), cv("2.0.0"));
        assert_eq!(cv("v2.0.0"), cv("2.0"));
        assert_eq!(cv("1.0"), cv("1.0.0"));
        assert_ne!(cv("1.9"), cv("1.10"));
    }

    #[test]
    fn requirement_operators_are_stripped() {
        assert_eq!(cv("^1.2"), cv("1.2.0"));
        assert_eq!(cv("~0.4.1"), cv("0.4.1"));
        assert_eq!(cv("=1.0.219"), cv("1.0.219"));
        assert_eq!(cv(">=1.5, <2"), cv("1.5"));
        assert_eq!(cv("1.*"), cv("1.0.0"));
    }

    #[test]
    fn suffixes_are_kept_for_exact_matching() {
        let rc = cv("1.0.0-rc.1");
        assert_ne!(rc, cv("1.0.0"));
        assert_eq!(rc, cv("v1.0-rc.1"));
        assert!(!rc.is_stable_release());
        assert!(!cv("1.0.0+build.5").is_stable_release());
    }

    #[test]
    fn sentinels_canonicalize_to_themselves() {
        for s in Sentinel::ALL {
            let c = cv(s.as_str());
            assert_eq!(c, CanonicalVersion::Sentinel(s));
            assert_eq!(c.to_string(), s.as_str());
            assert_eq!(cv(&c.to_string()), c);
        }
        assert_eq!(cv("0.0"), CanonicalVersion::Sentinel(Sentinel::Unknown));
    }

    #[test]
    fn sentinels_never_selected_as_latest() {
        let all: Vec<CanonicalVersion> = Sentinel::ALL
            .iter()
            .map(|s| CanonicalVersion::Sentinel(*s))
            .collect();
        assert_eq!(select_latest(&all, true), None);

        let mut mixed = all.clone();
        mixed.push(cv("0.1.0"));
        assert_eq!(select_latest(&mixed, false), Some(&cv("0.1.0")));
    }

    #[test]
    fn latest_prefers_stable_unless_opted_in() {
        let vs = vec![cv("1.2.0"), cv("1.10.0"), cv("2.0.0-beta.1"), cv("GIT#abc")];
        assert_eq!(select_latest(&vs, false), Some(&cv("1.10.0")));
        assert_eq!(select_latest(&vs, true), Some(&cv("2.0.0-beta.1")));
    }

    #[test]
    fn markers_round_trip_through_display() {
        for s in ["LOCAL", "WORKSPACE", "GIT#deadbeef", "1.2.3-alpha.1+x", "*"] {
            assert_eq!(cv(s).to_string(), s);
        }
        assert_eq!(cv("GIT#deadbeef"), CanonicalVersion::Revision("deadbeef".into()));
        assert_eq!(cv("*"), CanonicalVersion::Unrecognized("*".into()));
    }

    #[test]
    fn breaking_rules_follow_cargo_compatibility() {
        let v = |s: &str| semver::Version::parse(s).unwrap();
        assert!(is_breaking(&v("1.9.0"), &v("2.0.0")));
        assert!(!is_breaking(&v("1.2.0"), &v("1.9.3")));
        assert!(is_breaking(&v("0.3.4"), &v("0.4.0")));
        assert!(!is_breaking(&v("0.3.4"), &v("0.3.9")));
        assert!(is_breaking(&v("0.0.1"), &v("0.0.2")));
        assert!(!is_breaking(&v("2.0.0"), &v("1.0.0")));
    }

    #[test]
    fn stability_labels() {
        assert_eq!(stability(&cv("1.0")), Stability::Stable);
        assert_eq!(stability(&cv("0.9")), Stability::Unstable);
        assert_eq!(stability(&cv("1.0.0-rc.1")), Stability::PreRelease);
        assert_eq!(stability(&cv("LOCAL")), Stability::Local);
        assert_eq!(stability(&cv("TIMEOUT")), Stability::Unknown);
    }
}
