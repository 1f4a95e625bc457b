//! Cache Store: a versioned, tab-delimited snapshot file keyed by a tree hash.
//!
//! Layout:
//!
//! ```text
//! #ecoscan-cache	schema=2
//! #tree_hash	<blake3 hex>
//! #------ SECTION : SUMMARY --------#
//! KEY	VALUE
//! #------ SECTION : REPOSITORIES --------#
//! REPO_ID	NAME	PATH	...
//! #------ SECTION : DEPENDENCIES --------#
//! DEP_ID	REPO_ID	NAME	...
//! ```
//!
//! Columns are looked up by header name, so older files with fewer columns
//! still hydrate; missing columns take defaults.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CacheIntegrityError, CacheWriteError};
use crate::model::{
    DependencyKind, DependencyRecord, EcosystemSnapshot, LibraryType, RepoId, RepositoryRecord,
    Source, SourceKind,
};
use crate::version::{CanonicalVersion, Sentinel};

/// Newest schema this build writes and reads.
pub const SCHEMA_VERSION: u32 = 2;

const MAGIC: &str = "#ecoscan-cache";
const TREE_HASH: &str = "#tree_hash";
const SECTION_PREFIX: &str = "#------ SECTION : ";
const SECTION_SUFFIX: &str = " --------#";

const SUMMARY: &str = "SUMMARY";
const REPOSITORIES: &str = "REPOSITORIES";
const DEPENDENCIES: &str = "DEPENDENCIES";

const REPO_COLUMNS: &[&str] = &[
    "REPO_ID",
    "NAME",
    "PATH",
    "VERSION",
    "ORG",
    "GROUP",
    "IS_INTERNAL",
    "LIBRARY_TYPE",
    "PARSE_ERROR",
    "METADATA",
];

const DEP_COLUMNS: &[&str] = &[
    "DEP_ID",
    "REPO_ID",
    "NAME",
    "DECLARED",
    "KIND",
    "SOURCE_KIND",
    "SOURCE",
    "RESOLVED",
    "FEATURES",
];

/// Content hash over the scanned manifests plus the result-affecting config.
///
/// `manifests` are `(relative path, absolute path)` pairs; order does not
/// matter. Any edit, addition, removal or rename changes the hash. A manifest
/// that cannot be read hashes as an `io-error:<kind>` marker; the parser
/// records the failure on that repository.
pub fn tree_hash(manifests: &[(String, PathBuf)], fingerprint: &str) -> String {
    let mut sorted: Vec<&(String, PathBuf)> = manifests.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("schema={SCHEMA_VERSION}\n").as_bytes());
    hasher.update(fingerprint.as_bytes());
    for (rel, abs) in sorted {
        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        match fs::read(abs) {
            Ok(bytes) => {
                hasher.update(&(bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
            Err(e) => {
                debug!(path = %abs.display(), error = %e, "manifest unreadable while hashing");
                hasher.update(&u64::MAX.to_le_bytes());
                hasher.update(format!("io-error:{:?}", e.kind()).as_bytes());
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// One cache file on disk.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tree hash recorded in the file, reading only the header.
    pub fn stored_tree_hash(&self) -> Option<String> {
        let text = fs::read_to_string(&self.path).ok()?;
        text.lines()
            .take(2)
            .find_map(|l| l.strip_prefix(TREE_HASH)?.strip_prefix('\t'))
            .map(str::to_string)
    }

    /// Hydrate and validate the snapshot.
    pub fn load(&self, root: &Path) -> Result<EcosystemSnapshot, CacheIntegrityError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheIntegrityError::Missing(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        decode(&text, root)
    }

    /// Write atomically: temp file in the target directory, then rename.
    pub fn save(&self, snapshot: &EcosystemSnapshot) -> Result<(), CacheWriteError> {
        let wrap = |source: io::Error| CacheWriteError {
            path: self.path.clone(),
            source,
        };
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(wrap)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(wrap)?;
        tmp.write_all(encode(snapshot).as_bytes()).map_err(wrap)?;
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(&self.path).map_err(|e| wrap(e.error))?;
        debug!(path = %self.path.display(), "cache written");
        Ok(())
    }
}

/// Serialize a snapshot. Output depends only on the snapshot.
pub fn encode(snapshot: &EcosystemSnapshot) -> String {
    // Header and section marker lines are written unescaped.
    let mut text = format!(
        "{MAGIC}\tschema={SCHEMA_VERSION}\n{TREE_HASH}\t{}\n",
        snapshot.tree_hash
    );

    text.push_str(&section(SUMMARY));
    let summary_rows = [
        ["repositories".to_string(), snapshot.repository_count().to_string()],
        ["dependencies".to_string(), snapshot.dependency_count().to_string()],
    ];
    let mut rows = vec!["KEY\tVALUE".to_string()];
    rows.extend(summary_rows.iter().map(|r| join_escaped(r)));
    push_rows(&mut text, &rows);

    text.push_str(&section(REPOSITORIES));
    let mut rows = vec![REPO_COLUMNS.join("\t")];
    let mut repos: Vec<&RepositoryRecord> = snapshot.repositories.iter().collect();
    repos.sort_by_key(|r| r.id);
    for r in &repos {
        rows.push(join_escaped(&[
            r.id.to_string(),
            r.name.clone(),
            r.path.clone(),
            r.version.clone().unwrap_or_default(),
            r.org.clone(),
            r.group.clone(),
            r.is_internal.to_string(),
            r.library_type.to_string(),
            r.parse_error.clone().unwrap_or_default(),
            encode_metadata(&r.metadata),
        ]));
    }
    push_rows(&mut text, &rows);

    text.push_str(&section(DEPENDENCIES));
    let mut rows = vec![DEP_COLUMNS.join("\t")];
    for r in &repos {
        for d in r.all_dependencies() {
            rows.push(join_escaped(&[
                d.id.to_string(),
                d.repo.to_string(),
                d.name.clone(),
                d.declared.clone(),
                d.kind.to_string(),
                d.source_kind().to_string(),
                d.source.location(),
                d.resolved.to_string(),
                d.features.join(","),
            ]));
        }
    }
    push_rows(&mut text, &rows);

    text
}

fn section(name: &str) -> String {
    format!("{SECTION_PREFIX}{name}{SECTION_SUFFIX}\n")
}

fn push_rows(text: &mut String, rows: &[String]) {
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
}

fn join_escaped(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join("\t")
}

fn encode_metadata(meta: &BTreeMap<String, String>) -> String {
    if meta.is_empty() {
        String::new()
    } else {
        serde_json::to_string(meta).unwrap_or_default()
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// A section body: header names and the rows under them.
#[derive(Default)]
struct Section {
    columns: HashMap<String, usize>,
    rows: Vec<(usize, Vec<String>)>,
}

impl Section {
    fn get<'a>(&self, row: &'a [String], column: &str) -> Option<&'a str> {
        self.columns
            .get(column)
            .and_then(|i| row.get(*i))
            .map(String::as_str)
    }
}

/// Parse cache text. `root` is attached to the snapshot; it is not stored.
pub fn decode(text: &str, root: &Path) -> Result<EcosystemSnapshot, CacheIntegrityError> {
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));

    let schema = match lines.next() {
        Some((_, first)) => parse_schema(first)?,
        None => return Err(CacheIntegrityError::MissingHeader),
    };
    let tree_hash = match lines.next() {
        Some((n, l)) => l
            .strip_prefix(TREE_HASH)
            .and_then(|r| r.strip_prefix('\t'))
            .map(str::to_string)
            .ok_or_else(|| malformed(n, "expected tree hash line"))?,
        None => return Err(malformed(2, "missing tree hash line")),
    };

    let mut sections: HashMap<String, Section> = HashMap::new();
    let mut current: Option<(String, bool)> = None;
    for (n, line) in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line
            .strip_prefix(SECTION_PREFIX)
            .and_then(|r| r.strip_suffix(SECTION_SUFFIX))
        {
            sections.insert(name.to_string(), Section::default());
            current = Some((name.to_string(), false));
            continue;
        }
        let Some((name, has_header)) = current.as_mut() else {
            return Err(malformed(n, "row outside of any section"));
        };
        let Some(section) = sections.get_mut(name.as_str()) else {
            return Err(malformed(n, "row outside of any section"));
        };
        if !*has_header {
            section.columns = line
                .split('\t')
                .enumerate()
                .map(|(i, c)| (c.to_string(), i))
                .collect();
            *has_header = true;
        } else {
            section
                .rows
                .push((n, line.split('\t').map(unescape).collect()));
        }
    }

    let repositories = decode_repositories(sections.get(REPOSITORIES))?;
    let mut snapshot = EcosystemSnapshot {
        schema_version: schema,
        tree_hash,
        root: root.to_path_buf(),
        repositories,
    };
    attach_dependencies(&mut snapshot, sections.get(DEPENDENCIES))?;
    check_totals(&snapshot, sections.get(SUMMARY))?;
    snapshot.validate()?;
    Ok(snapshot)
}

fn malformed(line: usize, reason: impl Into<String>) -> CacheIntegrityError {
    CacheIntegrityError::Malformed {
        line,
        reason: reason.into(),
    }
}

fn parse_schema(first: &str) -> Result<u32, CacheIntegrityError> {
    let rest = first
        .strip_prefix(MAGIC)
        .and_then(|r| r.strip_prefix('\t'))
        .ok_or(CacheIntegrityError::MissingHeader)?;
    let found: u32 = rest
        .strip_prefix("schema=")
        .and_then(|v| v.trim().parse().ok())
        .ok_or(CacheIntegrityError::MissingHeader)?;
    if found > SCHEMA_VERSION || found == 0 {
        return Err(CacheIntegrityError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(found)
}

fn decode_repositories(
    section: Option<&Section>,
) -> Result<Vec<RepositoryRecord>, CacheIntegrityError> {
    let Some(section) = section else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(section.rows.len());
    for (n, row) in &section.rows {
        let get = |c: &str| section.get(row, c).unwrap_or_default();
        let id: u32 = get("REPO_ID")
            .parse()
            .map_err(|_| malformed(*n, "REPO_ID is not a number"))?;
        let mut repo = RepositoryRecord::new(RepoId(id), get("PATH"), get("NAME"));
        repo.version = Some(get("VERSION").to_string()).filter(|v| !v.is_empty());
        repo.org = get("ORG").to_string();
        repo.group = get("GROUP").to_string();
        repo.is_internal = get("IS_INTERNAL") == "true";
        repo.library_type = get("LIBRARY_TYPE").parse().unwrap_or(LibraryType::Project);
        repo.parse_error = Some(get("PARSE_ERROR").to_string()).filter(|v| !v.is_empty());
        let meta = get("METADATA");
        if !meta.is_empty() {
            repo.metadata = serde_json::from_str(meta)
                .map_err(|e| malformed(*n, format!("METADATA: {e}")))?;
        }
        out.push(repo);
    }
    Ok(out)
}

fn attach_dependencies(
    snapshot: &mut EcosystemSnapshot,
    section: Option<&Section>,
) -> Result<(), CacheIntegrityError> {
    let Some(section) = section else {
        return Ok(());
    };
    let index: HashMap<RepoId, usize> = snapshot
        .repositories
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id, i))
        .collect();

    for (n, row) in &section.rows {
        let get = |c: &str| section.get(row, c).unwrap_or_default();
        let id: u32 = get("DEP_ID")
            .parse()
            .map_err(|_| malformed(*n, "DEP_ID is not a number"))?;
        let repo = RepoId(
            get("REPO_ID")
                .parse()
                .map_err(|_| malformed(*n, "REPO_ID is not a number"))?,
        );
        let Some(&slot) = index.get(&repo) else {
            return Err(CacheIntegrityError::OrphanDependency { dep: id, repo: repo.0 });
        };

        let kind: DependencyKind = get("KIND").parse().unwrap_or(DependencyKind::Runtime);
        let source_kind: SourceKind = get("SOURCE_KIND").parse().unwrap_or(SourceKind::Registry);
        let resolved = match section.get(row, "RESOLVED") {
            Some(r) if !r.is_empty() => CanonicalVersion::parse(r),
            _ => CanonicalVersion::Sentinel(Sentinel::Unknown),
        };
        let features = get("FEATURES")
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();

        let dep = DependencyRecord {
            id,
            name: get("NAME").to_string(),
            declared: get("DECLARED").to_string(),
            kind,
            source: Source::from_location(source_kind, get("SOURCE")),
            resolved,
            features,
            repo,
        };
        let owner = &mut snapshot.repositories[slot];
        match kind {
            DependencyKind::Runtime | DependencyKind::Optional => owner.dependencies.push(dep),
            DependencyKind::Dev | DependencyKind::Build => owner.dev_dependencies.push(dep),
        }
    }
    Ok(())
}

fn check_totals(
    snapshot: &EcosystemSnapshot,
    summary: Option<&Section>,
) -> Result<(), CacheIntegrityError> {
    let Some(summary) = summary else {
        return Ok(());
    };
    for (_, row) in &summary.rows {
        let (Some(key), Some(value)) = (summary.get(row, "KEY"), summary.get(row, "VALUE")) else {
            continue;
        };
        let actual = match key {
            "repositories" => snapshot.repository_count(),
            "dependencies" => snapshot.dependency_count(),
            _ => continue,
        };
        let recorded: usize = value.parse().unwrap_or(usize::MAX);
        if recorded != actual {
            return Err(CacheIntegrityError::TotalsMismatch {
                key: key.to_string(),
                recorded,
                actual,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GitRef, DEFAULT_REGISTRY};

    fn sample() -> EcosystemSnapshot {
        let mut a = RepositoryRecord::new(RepoId(1), "org/grp/app", "app");
        a.version = Some("0.1.0".into());
        a.org = "org".into();
        a.group = "grp".into();
        a.is_internal = true;
        a.library_type = LibraryType::Binary;
        a.metadata.insert("priority".into(), "high".into());
        a.dependencies.push(DependencyRecord {
            id: 1,
            name: "serde".into(),
            declared: "1.0".into(),
            kind: DependencyKind::Runtime,
            source: Source::Registry {
                registry: DEFAULT_REGISTRY.into(),
            },
            resolved: CanonicalVersion::parse("1.0.210"),
            features: vec!["derive".into(), "rc".into()],
            repo: RepoId(1),
        });
        a.dev_dependencies.push(DependencyRecord {
            id: 2,
            name: "remote".into(),
            declared: String::new(),
            kind: DependencyKind::Dev,
            source: Source::VersionControl {
                url: "https://github.com/o/remote".into(),
                reference: GitRef::Branch("main".into()),
            },
            resolved: CanonicalVersion::parse("TIMEOUT"),
            features: vec![],
            repo: RepoId(1),
        });

        let mut b = RepositoryRecord::new(RepoId(2), "broken", "broken");
        b.parse_error = Some("failed to parse\tline 3".into());

        EcosystemSnapshot {
            schema_version: SCHEMA_VERSION,
            tree_hash: "abc123".into(),
            root: PathBuf::from("/r"),
            repositories: vec![a, b],
        }
    }

    #[test]
    fn encode_decode_preserves_snapshot() {
        let snap = sample();
        let text = encode(&snap);
        let back = decode(&text, Path::new("/r")).unwrap();
        assert_eq!(back, snap);
        assert_eq!(encode(&back), text);
    }

    #[test]
    fn escaping_keeps_rows_single_line() {
        let text = encode(&sample());
        assert!(text.contains("failed to parse\\tline 3"));
        assert_eq!(unescape(&escape("a\\b\tc\nd\re")), "a\\b\tc\nd\re");
    }

    #[test]
    fn schema_one_hydrates_with_defaults() {
        let text = "#ecoscan-cache\tschema=1\n\
                    #tree_hash\tdeadbeef\n\
                    #------ SECTION : REPOSITORIES --------#\n\
                    REPO_ID\tNAME\tPATH\n\
                    1\tapp\tapp\n\
                    #------ SECTION : DEPENDENCIES --------#\n\
                    DEP_ID\tREPO_ID\tNAME\tDECLARED\n\
                    1\t1\tregex\t1.9\n";
        let snap = decode(text, Path::new("/r")).unwrap();
        assert_eq!(snap.schema_version, 1);
        let repo = &snap.repositories[0];
        assert!(!repo.is_internal);
        assert_eq!(repo.library_type, LibraryType::Project);
        let dep = &repo.dependencies[0];
        assert_eq!(dep.kind, DependencyKind::Runtime);
        assert_eq!(dep.source_kind(), SourceKind::Registry);
        assert_eq!(dep.resolved, CanonicalVersion::Sentinel(Sentinel::Unknown));
        assert!(dep.features.is_empty());
    }

    #[test]
    fn integrity_failures() {
        let root = Path::new("/r");
        assert!(matches!(
            decode("", root),
            Err(CacheIntegrityError::MissingHeader)
        ));
        assert!(matches!(
            decode("#ecoscan-cache\tschema=9\n#tree_hash\tx\n", root),
            Err(CacheIntegrityError::UnsupportedSchema { found: 9, .. })
        ));

        let orphan = "#ecoscan-cache\tschema=2\n#tree_hash\tx\n\
                      #------ SECTION : REPOSITORIES --------#\nREPO_ID\tNAME\tPATH\n1\ta\ta\n\
                      #------ SECTION : DEPENDENCIES --------#\nDEP_ID\tREPO_ID\tNAME\n7\t42\tserde\n";
        assert!(matches!(
            decode(orphan, root),
            Err(CacheIntegrityError::OrphanDependency { dep: 7, repo: 42 })
        ));

        let mut text = encode(&sample());
        text = text.replace("dependencies\t2", "dependencies\t3");
        assert!(matches!(
            decode(&text, root),
            Err(CacheIntegrityError::TotalsMismatch { .. })
        ));
    }

    #[test]
    fn save_is_atomic_and_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("nested").join("deps_cache.tsv"));
        assert!(matches!(
            store.load(dir.path()),
            Err(CacheIntegrityError::Missing(_))
        ));

        let snap = sample();
        store.save(&snap).unwrap();
        assert_eq!(store.stored_tree_hash().as_deref(), Some("abc123"));
        let mut loaded = store.load(Path::new("/r")).unwrap();
        assert_eq!(loaded, snap);

        loaded.tree_hash = "second".into();
        store.save(&loaded).unwrap();
        assert_eq!(store.stored_tree_hash().as_deref(), Some("second"));
        let leftovers = fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn tree_hash_tracks_content_paths_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        fs::write(&a, "x = 1").unwrap();
        let list = vec![("a/Cargo.toml".to_string(), a.clone())];

        let h1 = tree_hash(&list, "cfg");
        assert_eq!(h1, tree_hash(&list, "cfg"));
        assert_ne!(h1, tree_hash(&list, "cfg2"));

        let renamed = vec![("b/Cargo.toml".to_string(), a.clone())];
        assert_ne!(h1, tree_hash(&renamed, "cfg"));

        fs::write(&a, "x = 2").unwrap();
        assert_ne!(h1, tree_hash(&list, "cfg"));
    }

    #[test]
    fn unreadable_manifest_hashes_to_a_stable_marker() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        fs::write(&good, "x = 1").unwrap();
        // A directory cannot be read as a file.
        let list = vec![
            ("bad/Cargo.toml".to_string(), dir.path().to_path_buf()),
            ("good/Cargo.toml".to_string(), good.clone()),
        ];
        let h1 = tree_hash(&list, "cfg");
        assert_eq!(h1, tree_hash(&list, "cfg"));
        assert_ne!(h1, tree_hash(&list[1..], "cfg"));
    }
}
