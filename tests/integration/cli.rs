use assert_cmd::prelude::*;
use predicates::prelude::predicate;
use std::process::Command;

#[test]
fn test_help_describes_the_converter() {
    Command::cargo_bin("svn2git")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Subversion"))
        .stdout(predicate::str::contains("--rules"));
}

#[test]
fn test_rules_argument_is_required() {
    let repo_dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("svn2git")
        .unwrap()
        .arg(repo_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("--rules"));
}

#[test]
fn test_bad_rule_file_fails_with_exit_code_one() {
    let dir = tempfile::tempdir().unwrap();
    let rules = dir.path().join("rules");
    std::fs::write(&rules, "this is not a rule file\n").unwrap();

    Command::cargo_bin("svn2git")
        .unwrap()
        .arg(dir.path())
        .arg("--rules")
        .arg(&rules)
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_missing_svn_repository_fails() {
    let dir = tempfile::tempdir().unwrap();
    let rules = dir.path().join("rules");
    std::fs::write(
        &rules,
        "create repository one.git\nend repository\n\nmatch /trunk/\n  repository one.git\n  branch master\nend match\n",
    )
    .unwrap();

    Command::cargo_bin("svn2git")
        .unwrap()
        .arg(dir.path().join("does-not-exist"))
        .arg("--rules")
        .arg(&rules)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Subversion repository"));
}
