use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::Path;

fn write_manifest(root: &Path, rel: &str, body: &str) {
    let dir = root.join(rel);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("Cargo.toml"), body).unwrap();
}

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "hub",
        "[package]\nname = \"hub\"\nversion = \"0.1.0\"\n[dependencies]\nserde = \"1.0\"\n",
    );
    write_manifest(
        dir.path(),
        "svc/api",
        "[package]\nname = \"api\"\n[dependencies]\nserde = \"1.0.0\"\nregex = \"1.9\"\n",
    );
    write_manifest(
        dir.path(),
        "svc/worker",
        "[package]\nname = \"worker\"\n[dependencies]\nregex = \"1.10\"\n",
    );
    dir
}

fn json_stdout(out: &std::process::Output) -> serde_json::Value {
    assert!(
        out.status.success(),
        "ecoscan failed (status={:?})\nstdout:\n{}\nstderr:\n{}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    serde_json::from_slice(&out.stdout).expect("stdout JSON parse")
}

#[test]
fn scan_json_is_versioned_envelope() {
    let dir = fixture();
    let out = cargo_bin_cmd!("ecoscan")
        .args(["scan", "--offline", "--format", "json", "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    let v = json_stdout(&out);
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["command"].as_str(), Some("scan"));
    assert_eq!(v["result"]["summary"]["repositories"].as_u64(), Some(3));
    assert_eq!(v["result"]["from_cache"].as_bool(), Some(false));
    assert!(dir.path().join(".ecoscan/deps_cache.tsv").exists());

    // Unchanged tree: served from cache without resolution.
    let out = cargo_bin_cmd!("ecoscan")
        .args(["scan", "--offline", "--format", "json", "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    let v = json_stdout(&out);
    assert_eq!(v["result"]["from_cache"].as_bool(), Some(true));
    assert_eq!(v["result"]["resolution_calls"].as_u64(), Some(0));
}

#[test]
fn conflicts_report_canonical_versions() {
    let dir = fixture();
    let out = cargo_bin_cmd!("ecoscan")
        .args(["conflicts", "--offline", "--format", "json", "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    let v = json_stdout(&out);
    let rows = v["result"].as_array().unwrap();
    assert_eq!(rows.len(), 1, "serde 1.0 and 1.0.0 are the same release");
    assert_eq!(rows[0]["name"].as_str(), Some("regex"));
    assert_eq!(rows[0]["versions"].as_object().unwrap().len(), 2);
}

#[test]
fn hub_view_uses_env_hub_name() {
    let dir = fixture();
    cargo_bin_cmd!("ecoscan")
        .args(["hub", "--offline", "--root"])
        .arg(dir.path())
        .env("ECOSCAN_HUB", "hub")
        .assert()
        .success()
        .stdout(predicate::str::contains("hub: hub"))
        .stdout(predicate::str::contains("regex"));
}

#[test]
fn hub_view_requires_a_hub() {
    let dir = fixture();
    cargo_bin_cmd!("ecoscan")
        .args(["hub", "--offline", "--root"])
        .arg(dir.path())
        .env_remove("ECOSCAN_HUB")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--hub"));
}

#[test]
fn check_git_never_writes_cache() {
    let dir = fixture();
    cargo_bin_cmd!("ecoscan")
        .args(["check-git", "--offline", "--root"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("no git dependencies"));
    assert!(!dir.path().join(".ecoscan").exists());
}

#[test]
fn unknown_package_is_an_error() {
    let dir = fixture();
    cargo_bin_cmd!("ecoscan")
        .args(["package", "nope", "--offline", "--root"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no repository depends on"));
}
