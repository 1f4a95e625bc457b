//! Timeout-bounded, non-interactive `git` invocations.

use std::ffi::OsString;
use std::io::Read;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::debug;

use super::ResolutionOutcome;
use crate::manifest::MANIFEST_FILE;
use crate::model::GitRef;

/// Length of the revision kept in `GIT#<rev>` markers.
pub const SHORT_REV_LEN: usize = 8;

pub struct GitCli {
    runtime: tokio::runtime::Runtime,
    program: OsString,
    leading_args: Vec<OsString>,
    timeout: Duration,
}

impl std::fmt::Debug for GitCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCli")
            .field("program", &self.program)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GitCli {
    pub fn new(timeout: Duration) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            program: OsString::from("git"),
            leading_args: Vec::new(),
            timeout,
        })
    }

    /// Run a different executable in place of `git`, with `leading_args`
    /// inserted before the git subcommand.
    pub fn with_command(
        mut self,
        program: impl Into<OsString>,
        leading_args: Vec<OsString>,
    ) -> Self {
        self.program = program.into();
        self.leading_args = leading_args;
        self
    }

    /// Run one git subcommand with a hard timeout. The child is killed when the
    /// timeout fires.
    fn run(&self, args: &[&str]) -> Result<Vec<u8>, ResolutionOutcome> {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.leading_args)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes -o ConnectTimeout=5")
            .env("GCM_INTERACTIVE", "never")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limit = self.timeout;
        let result = self
            .runtime
            .block_on(async move { timeout(limit, cmd.output()).await });

        let output = match result {
            Err(_) => {
                debug!(?args, timeout_ms = limit.as_millis() as u64, "git timed out");
                return Err(ResolutionOutcome::TimedOut);
            }
            Ok(Err(e)) => {
                debug!(?args, error = %e, "failed to spawn git");
                return Err(ResolutionOutcome::Unknown);
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(?args, status = %output.status, stderr = %stderr.trim(), "git failed");
            Err(classify_failure(&stderr))
        }
    }

    /// Read the manifest at `reference` through `git archive --remote`.
    pub fn archive_manifest(
        &self,
        url: &str,
        reference: &GitRef,
    ) -> Result<String, ResolutionOutcome> {
        let remote = format!("--remote={url}");
        let tar_bytes = self.run(&["archive", &remote, reference.as_arg(), MANIFEST_FILE])?;
        manifest_from_tar(&tar_bytes).ok_or(ResolutionOutcome::NotFound)
    }

    /// Confirm the remote answers and report the revision behind `reference`.
    /// Pinned revisions are reported as declared once the remote answers.
    pub fn ls_remote(&self, url: &str, reference: &GitRef) -> ResolutionOutcome {
        let query = match reference {
            GitRef::Rev(_) | GitRef::DefaultBranch => "HEAD",
            GitRef::Tag(t) | GitRef::Branch(t) => t.as_str(),
        };
        match self.run(&["ls-remote", url, query]) {
            Ok(stdout) => {
                if let GitRef::Rev(rev) = reference {
                    return ResolutionOutcome::Revision(short_rev(rev));
                }
                match first_revision(&String::from_utf8_lossy(&stdout)) {
                    Some(sha) => ResolutionOutcome::Revision(short_rev(sha)),
                    None => ResolutionOutcome::NotFound,
                }
            }
            Err(outcome) => outcome,
        }
    }
}

/// Map git's stderr onto an outcome. Credential failures are checked first:
/// "could not read Username" would otherwise read as not-found.
pub fn classify_failure(stderr: &str) -> ResolutionOutcome {
    let s = stderr.to_lowercase();
    const AUTH: &[&str] = &[
        "permission denied",
        "authentication failed",
        "could not read username",
        "terminal prompts disabled",
        "host key verification failed",
    ];
    const MISSING: &[&str] = &[
        "not found",
        "could not read",
        "does not appear",
        "does not exist",
    ];
    if AUTH.iter().any(|m| s.contains(m)) {
        ResolutionOutcome::AuthRequired
    } else if MISSING.iter().any(|m| s.contains(m)) {
        ResolutionOutcome::NotFound
    } else {
        ResolutionOutcome::Unknown
    }
}

fn first_revision(ls_remote: &str) -> Option<&str> {
    ls_remote
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .find(|sha| sha.len() >= SHORT_REV_LEN && sha.chars().all(|c| c.is_ascii_hexdigit()))
}

fn short_rev(rev: &str) -> String {
    rev.chars().take(SHORT_REV_LEN).collect()
}

fn manifest_from_tar(bytes: &[u8]) -> Option<String> {
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        let is_manifest = entry
            .path()
            .ok()
            .is_some_and(|p| p.file_name().is_some_and(|n| n == MANIFEST_FILE));
        if is_manifest {
            let mut text = String::new();
            entry.read_to_string(&mut text).ok()?;
            return Some(text);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        assert_eq!(
            classify_failure("fatal: could not read Username for 'https://github.com': terminal prompts disabled"),
            ResolutionOutcome::AuthRequired
        );
        assert_eq!(
            classify_failure("git@host: Permission denied (publickey)."),
            ResolutionOutcome::AuthRequired
        );
        assert_eq!(
            classify_failure("remote: Repository not found.\nfatal: repository 'x' not found"),
            ResolutionOutcome::NotFound
        );
        assert_eq!(
            classify_failure("fatal: 'x' does not appear to be a git repository"),
            ResolutionOutcome::NotFound
        );
        assert_eq!(
            classify_failure("fatal: operation not supported by protocol"),
            ResolutionOutcome::Unknown
        );
    }

    #[test]
    fn revision_parsing() {
        let out = "0123456789abcdef0123456789abcdef01234567\tHEAD\n";
        assert_eq!(first_revision(out), Some("0123456789abcdef0123456789abcdef01234567"));
        assert_eq!(first_revision(""), None);
        assert_eq!(short_rev("0123456789abcdef"), "01234567");
    }

    #[test]
    fn manifest_is_extracted_from_archive() {
        let body = b"[package]\nname = \"x\"\nversion = \"1.2.3\"\n";
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "Cargo.toml", &body[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();
        assert_eq!(manifest_from_tar(&bytes).as_deref(), Some(std::str::from_utf8(body).unwrap()));
        assert_eq!(manifest_from_tar(b"not a tar"), None);
    }

    #[cfg(unix)]
    mod fake_git {
        use super::super::*;
        use std::path::Path;

        // Runs `sh <script> <git args..>` so no freshly written file is exec'd.
        fn cli(dir: &Path, script: &str, timeout: Duration) -> GitCli {
            let path = dir.join("git.sh");
            std::fs::write(&path, script).unwrap();
            GitCli::new(timeout)
                .unwrap()
                .with_command("sh", vec![path.into_os_string()])
        }

        #[test]
        fn slow_remote_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let git = cli(dir.path(), "sleep 5\n", Duration::from_millis(200));
            let started = std::time::Instant::now();
            assert_eq!(
                git.ls_remote("https://example.invalid/r", &GitRef::DefaultBranch),
                ResolutionOutcome::TimedOut
            );
            assert!(started.elapsed() < Duration::from_secs(4));
        }

        #[test]
        fn auth_gated_remote() {
            let dir = tempfile::tempdir().unwrap();
            let git = cli(
                dir.path(),
                "echo \"fatal: Authentication failed for 'https://x/'\" >&2\nexit 128\n",
                Duration::from_secs(5),
            );
            assert_eq!(
                git.ls_remote("https://x/r", &GitRef::DefaultBranch),
                ResolutionOutcome::AuthRequired
            );
            assert_eq!(
                git.archive_manifest("https://x/r", &GitRef::DefaultBranch),
                Err(ResolutionOutcome::AuthRequired)
            );
        }

        #[test]
        fn reachable_remote_reports_short_revision() {
            let dir = tempfile::tempdir().unwrap();
            let git = cli(
                dir.path(),
                "printf 'deadbeefcafebabe0000000000000000000000aa\\tHEAD\\n'\n",
                Duration::from_secs(5),
            );
            assert_eq!(
                git.ls_remote("https://x/r", &GitRef::DefaultBranch),
                ResolutionOutcome::Revision("deadbeef".into())
            );
            assert_eq!(
                git.ls_remote("https://x/r", &GitRef::Rev("0badc0de99".into())),
                ResolutionOutcome::Revision("0badc0de".into())
            );
        }

        #[test]
        fn missing_program_is_unknown() {
            let git = GitCli::new(Duration::from_secs(1))
                .unwrap()
                .with_command("/nonexistent/ecoscan-git", Vec::new());
            assert_eq!(
                git.ls_remote("https://x/r", &GitRef::DefaultBranch),
                ResolutionOutcome::Unknown
            );
        }
    }
}
