//! `ecoscan`: dependency ecosystem analysis across a tree of Cargo repositories.
//!
//! Every view command reuses the cache when the tree is unchanged and scans
//! otherwise. `check-git` queries remotes only and never touches the cache.

mod logging;

use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use ecoscan::aggregate::Ecosystem;
use ecoscan::config::{ScanConfig, Timeouts, DEFAULT_REGISTRY_URL};
use ecoscan::scanner::{ScanOutcome, Scanner};

#[derive(Parser, Debug)]
#[command(name = "ecoscan")]
#[command(about = "Cross-repository Cargo dependency ecosystem analysis")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory whose subtree is scanned for `Cargo.toml` files.
    #[arg(long, global = true, env = "ECOSCAN_ROOT", default_value = ".")]
    root: PathBuf,

    /// Name of the hub repository (shared dependency versions).
    #[arg(long, global = true, env = "ECOSCAN_HUB")]
    hub: Option<String>,

    /// Cache file (default: `<root>/.ecoscan/deps_cache.tsv`).
    #[arg(long, global = true, env = "ECOSCAN_CACHE")]
    cache: Option<PathBuf>,

    /// Worker threads for parsing and resolution.
    #[arg(long, global = true, default_value_t = 8)]
    jobs: usize,

    /// Timeout for each git invocation, in seconds.
    #[arg(long, global = true, default_value_t = 5)]
    git_timeout_secs: u64,

    /// Timeout for each hosted-API request, in seconds.
    #[arg(long, global = true, default_value_t = 5)]
    api_timeout_secs: u64,

    /// Make no registry or remote calls.
    #[arg(long, global = true)]
    offline: bool,

    /// Let pre-release versions count as "latest".
    #[arg(long, global = true)]
    include_prerelease: bool,

    #[arg(long, global = true, default_value = DEFAULT_REGISTRY_URL)]
    registry_url: String,

    /// Skip GitHub/GitLab file APIs and go straight to git.
    #[arg(long, global = true)]
    no_hosted_api: bool,

    /// Ignore a valid cache and rebuild.
    #[arg(long, global = true)]
    refresh: bool,

    /// Minimum non-hub usage for a gap to be listed as an opportunity.
    #[arg(long, global = true, default_value_t = 5)]
    opportunity_threshold: usize,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// More logging on stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the tree (or hydrate the cache) and print totals.
    Scan,
    /// Packages used at more than one canonical version.
    Conflicts,
    /// Hub coverage: current, outdated, gaps, unused, opportunities.
    Hub,
    /// Dependencies behind their package's latest version.
    Outdated {
        /// Only updates that cross a compatibility boundary.
        #[arg(long)]
        breaking_only: bool,
    },
    /// Dependencies whose resolution ended in a sentinel.
    Unresolved,
    /// Everything known about one package.
    Package { name: String },
    /// Probe every git remote for reachability (no cache reads or writes).
    CheckGit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl GlobalArgs {
    fn config(&self) -> ScanConfig {
        let mut cfg = ScanConfig::new(&self.root)
            .with_jobs(self.jobs)
            .with_timeouts(Timeouts {
                git: Duration::from_secs(self.git_timeout_secs),
                api: Duration::from_secs(self.api_timeout_secs),
                ..Timeouts::default()
            })
            .with_registry_url(&self.registry_url)
            .with_prerelease(self.include_prerelease)
            .with_offline(self.offline)
            .with_hosted_api(!self.no_hosted_api)
            .with_refresh(self.refresh)
            .with_opportunity_threshold(self.opportunity_threshold);
        if let Some(hub) = &self.hub {
            cfg = cfg.with_hub(hub);
        }
        if let Some(cache) = &self.cache {
            cfg = cfg.with_cache_path(cache);
        }
        cfg
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: u32,
    ok: bool,
    command: &'a str,
    result: T,
}

fn emit<T: Serialize>(
    format: OutputFormat,
    command: &str,
    result: &T,
    text: impl FnOnce() -> String,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let out = Envelope {
                schema_version: 1,
                ok: true,
                command,
                result,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => print!("{}", text()),
    }
    Ok(())
}

fn scan(scanner: &Scanner) -> Result<ScanOutcome> {
    // Parse failures and cache write errors are already logged at warn level.
    scanner
        .scan()
        .with_context(|| format!("scan of {} failed", scanner.config().root.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.global.verbose, cli.global.log_json);

    let config = cli.global.config();
    let hub_name = config.hub_name.clone();
    let threshold = config.opportunity_threshold;
    let include_prerelease = config.include_prerelease;
    let format = cli.global.format;
    let scanner = Scanner::with_network_resolver(config).context("failed to set up resolver")?;

    match cli.command {
        Command::CheckGit => {
            let reports = scanner.check_git()?;
            emit(format, "check-git", &reports, || {
                let mut s = String::new();
                for r in &reports {
                    let _ = writeln!(
                        s,
                        "{:<16} {} @ {} ({})",
                        r.status.to_string(),
                        r.url,
                        r.reference,
                        r.packages.join(", ")
                    );
                }
                if reports.is_empty() {
                    s.push_str("no git dependencies\n");
                }
                s
            })
        }
        command => {
            let outcome = scan(&scanner)?;
            let eco = Ecosystem::new(&outcome.snapshot, hub_name.as_deref())
                .with_opportunity_threshold(threshold)
                .with_include_prerelease(include_prerelease);
            run_view(command, &outcome, &eco, hub_name.as_deref(), format)
        }
    }
}

fn run_view(
    command: Command,
    outcome: &ScanOutcome,
    eco: &Ecosystem<'_>,
    hub_name: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    match command {
        Command::Scan => {
            #[derive(Serialize)]
            struct ScanOut<'a> {
                from_cache: bool,
                resolution_calls: usize,
                tree_hash: &'a str,
                warnings: &'a [String],
                cache_error: Option<String>,
                summary: ecoscan::aggregate::Summary,
            }
            let out = ScanOut {
                from_cache: outcome.from_cache,
                resolution_calls: outcome.resolution_calls,
                tree_hash: &outcome.snapshot.tree_hash,
                warnings: &outcome.warnings,
                cache_error: outcome.cache_error.as_ref().map(ToString::to_string),
                summary: eco.summary(),
            };
            emit(format, "scan", &out, || {
                let s = &out.summary;
                let mut t = String::new();
                let _ = writeln!(
                    t,
                    "{} repositories ({} internal, {} unparseable), {} dependencies, {} packages",
                    s.repositories,
                    s.internal_repositories,
                    s.parse_errors,
                    s.dependencies,
                    s.packages
                );
                for (kind, n) in &s.by_source_kind {
                    let _ = writeln!(t, "  {kind:<16} {n}");
                }
                let _ = writeln!(
                    t,
                    "conflicts: {}  outdated: {}  unresolved: {}",
                    s.conflicts, s.outdated, s.unresolved_dependencies
                );
                if let (Some(hub), Some(h)) = (&s.hub, &s.hub_totals) {
                    let _ = writeln!(
                        t,
                        "hub {hub}: {} current, {} outdated, {} ahead, {} gaps, {} unused, {} opportunities",
                        h.current,
                        h.outdated,
                        h.ahead,
                        h.gaps,
                        h.unused,
                        h.opportunities
                    );
                }
                let _ = writeln!(
                    t,
                    "{} (resolution calls: {})",
                    if out.from_cache { "from cache" } else { "full scan" },
                    out.resolution_calls
                );
                t
            })
        }
        Command::Conflicts => {
            let conflicts = eco.conflicts();
            emit(format, "conflicts", &conflicts, || {
                let mut t = String::new();
                for c in &conflicts {
                    let _ = writeln!(t, "{} (used by {})", c.name, c.usage_count);
                    for (v, repos) in &c.versions {
                        let _ = writeln!(t, "  {v:<14} {}", repos.join(", "));
                    }
                }
                if conflicts.is_empty() {
                    t.push_str("no version conflicts\n");
                }
                t
            })
        }
        Command::Hub => {
            let name = hub_name.ok_or_else(|| anyhow!("hub requires --hub or ECOSCAN_HUB"))?;
            let report = eco
                .hub_report()
                .ok_or_else(|| anyhow!("hub repository {name:?} not found under the scan root"))?;
            emit(format, "hub", &report, || {
                let mut t = String::new();
                let _ = writeln!(t, "hub: {}", report.hub);
                let _ = writeln!(t, "current: {}", report.current.len());
                let _ = writeln!(t, "outdated:");
                for p in &report.outdated {
                    let _ = writeln!(
                        t,
                        "  {:<24} {} -> {}{}",
                        p.name,
                        p.hub_version,
                        p.latest.as_deref().unwrap_or("?"),
                        if p.breaking { " (breaking)" } else { "" }
                    );
                }
                let _ = writeln!(t, "ahead:");
                for p in &report.ahead {
                    let _ = writeln!(
                        t,
                        "  {:<24} {} ahead of {}",
                        p.name,
                        p.hub_version,
                        p.latest.as_deref().unwrap_or("?")
                    );
                }
                let _ = writeln!(t, "gaps:");
                for g in &report.gaps {
                    let _ = writeln!(t, "  {:<24} used by {}", g.name, g.usage_count);
                }
                let _ = writeln!(t, "opportunities: {}", report.opportunities.len());
                let unused: Vec<&str> = report.unused.iter().map(|p| p.name.as_str()).collect();
                let _ = writeln!(t, "unused: {}", unused.join(", "));
                t
            })
        }
        Command::Outdated { breaking_only } => {
            let rows: Vec<_> = eco
                .outdated()
                .into_iter()
                .filter(|r| !breaking_only || r.breaking)
                .collect();
            emit(format, "outdated", &rows, || {
                let mut t = String::new();
                for r in &rows {
                    let _ = writeln!(
                        t,
                        "{:<24} {:<24} {} -> {}{}",
                        r.name,
                        r.repository,
                        r.current,
                        r.latest,
                        if r.breaking { " (breaking)" } else { "" }
                    );
                }
                t
            })
        }
        Command::Unresolved => {
            let rows = eco.unresolved();
            emit(format, "unresolved", &rows, || {
                let mut t = String::new();
                for r in &rows {
                    let _ = writeln!(
                        t,
                        "{:<14} {:<24} {} ({})",
                        r.status.as_str(),
                        r.name,
                        r.source,
                        r.repositories.join(", ")
                    );
                }
                t
            })
        }
        Command::Package { name } => {
            let detail = eco
                .package_detail(&name)
                .ok_or_else(|| anyhow!("no repository depends on {name:?}"))?;
            emit(format, "package", &detail, || {
                let mut t = String::new();
                let _ = writeln!(
                    t,
                    "{} (used by {}, latest {}, {:?})",
                    detail.name,
                    detail.usage_count,
                    detail.latest.as_deref().unwrap_or("unknown"),
                    detail.stability
                );
                if let Some(v) = &detail.hub_version {
                    let _ = writeln!(t, "hub pins {v}");
                }
                for u in &detail.uses {
                    let _ = writeln!(
                        t,
                        "  {:<24} {:<10} {:<12} {}",
                        u.repository,
                        u.kind.as_str(),
                        u.in_use,
                        u.source
                    );
                }
                t
            })
        }
        Command::CheckGit => Err(anyhow!("check-git does not read scan results")),
    }
}
