//! CLI tests driving the pgbunker binary: the advertised command
//! surface, argument validation, and the archive/profile flows against a
//! scratch catalog.

use assert_cmd::Command;
use predicates::prelude::*;

fn pgbunker() -> Command {
    Command::cargo_bin("pgbunker").expect("binary should build")
}

#[test]
fn help_shows_the_command_surface() {
    // Every command group of the engine has to be advertised, as does
    // the catalog location flag.
    pgbunker().arg("--help").assert().success().stdout(
        predicate::str::contains("archive")
            .and(predicate::str::contains("connection"))
            .and(predicate::str::contains("profile"))
            .and(predicate::str::contains("basebackup"))
            .and(predicate::str::contains("launcher"))
            .and(predicate::str::contains("retention"))
            .and(predicate::str::contains("var"))
            .and(predicate::str::contains("--catalog")),
    );
}

#[test]
fn version_reports_the_crate_version() {
    pgbunker()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn pin_without_an_action_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("catalog.db");

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["basebackup", "pin", "--archive", "A"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--id"));

    // The descriptor is never built, so no catalog was created.
    assert!(!catalog.exists());
}

#[test]
fn bogus_connection_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("catalog.db");

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["connection", "create", "--archive", "A", "--type", "bouncer"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized connection type"));
}

#[test]
fn malformed_retention_rule_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("catalog.db");

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["retention", "create", "R", "--rule", "KEEP SOMETIMES"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed retention rule"));
}

#[test]
fn create_then_list_detail() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("catalog.db");
    let archive_dir = dir.path().join("a");

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["archive", "create", "A"])
        .args(["--directory", archive_dir.to_str().unwrap()])
        .args(["--pghost", "h", "--pgport", "5432"])
        .args(["--pguser", "u", "--pgdatabase", "x"])
        .assert()
        .success();

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["archive", "list", "A"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("A")
                .and(predicate::str::contains(archive_dir.to_str().unwrap()))
                .and(predicate::str::contains("h"))
                .and(predicate::str::contains("5432"))
                .and(predicate::str::contains("u"))
                .and(predicate::str::contains("x")),
        );
}

#[test]
fn duplicate_profile_respects_exists_ok() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("catalog.db");

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["profile", "create", "P", "--compression", "gzip"])
        .assert()
        .success();

    // Recreating with a different compression fails...
    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["profile", "create", "P", "--compression", "zstd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    // ... unless exists_ok turns it into a no-op keeping the original.
    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["profile", "create", "P", "--compression", "zstd", "--exists-ok"])
        .assert()
        .success();

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["profile", "list", "P"])
        .assert()
        .success()
        .stdout(predicate::str::contains("GZIP"));
}

#[test]
fn drop_missing_archive_requires_if_exists() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("catalog.db");

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["archive", "drop", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));

    pgbunker()
        .args(["--catalog", catalog.to_str().unwrap()])
        .args(["archive", "drop", "ghost", "--if-exists"])
        .assert()
        .success();
}

#[test]
fn variables_show_set_reset() {
    let mut cmd = pgbunker();
    cmd.args(["var", "show"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("launcher_detach"));

    pgbunker()
        .args(["var", "set", "verbose", "on"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verbose = true"));

    pgbunker()
        .args(["var", "set", "verbose", "sometimes"])
        .assert()
        .failure();
}
