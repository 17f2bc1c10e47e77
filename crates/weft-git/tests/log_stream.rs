use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;
use weft_git::{LogOptions, Mirror, collect_churn, log_stream};

fn run_git(workspace: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(args)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(workspace: &Path) {
    run_git(workspace, &["init"]);
    run_git(workspace, &["config", "user.email", "tester@example.com"]);
    run_git(workspace, &["config", "user.name", "Tester"]);
}

fn write_file(workspace: &Path, relative: &str, content: &str) {
    let path = workspace.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(path, content).expect("write file");
}

fn commit_all(workspace: &Path, message: &str) {
    run_git(workspace, &["add", "."]);
    run_git(workspace, &["commit", "-m", message]);
}

#[test]
fn streams_history_with_renames_and_churn() {
    let source = tempdir().expect("source");
    let data = tempdir().expect("data");
    init_repo(source.path());

    write_file(source.path(), "src/engine.rs", "fn engine() {}\n");
    write_file(source.path(), "src/utils.rs", "fn utils() {}\n");
    commit_all(source.path(), "initial");

    write_file(source.path(), "src/engine.rs", "fn engine() { run(); }\n");
    commit_all(source.path(), "tweak engine");

    run_git(source.path(), &["mv", "src/utils.rs", "src/helpers.rs"]);
    commit_all(source.path(), "rename utils");

    let mirror = Mirror::prepare(source.path(), data.path()).expect("prepare mirror");
    let commits = log_stream(&mirror, LogOptions::default())
        .expect("spawn log")
        .collect::<Result<Vec<_>, _>>()
        .expect("parse log");

    assert_eq!(commits.len(), 3);
    // newest first
    assert_eq!(commits[0].subject, "rename utils");
    assert_eq!(commits[2].subject, "initial");
    assert!(commits.iter().all(|commit| commit.issues.is_empty()));

    let rename = commits[0]
        .changes
        .iter()
        .find(|change| change.status.starts_with('R'))
        .expect("rename change");
    assert_eq!(rename.old_path.as_deref(), Some("src/utils.rs"));
    assert_eq!(rename.path, "src/helpers.rs");

    let initial = &commits[2];
    assert_eq!(initial.changes.len(), 2);
    assert!(initial.changes.iter().all(|change| change.status == "A"));

    let churn = collect_churn(&mirror).expect("collect churn");
    assert_eq!(churn["src/engine.rs"].lines_added, 2);
    assert_eq!(churn["src/engine.rs"].lines_deleted, 1);
}
