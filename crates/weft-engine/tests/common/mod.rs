#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::process::Command;

pub fn run_git(workspace: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(args)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

pub fn init_repo(workspace: &Path) {
    run_git(workspace, &["init"]);
    run_git(workspace, &["config", "user.email", "tester@example.com"]);
    run_git(workspace, &["config", "user.name", "Tester"]);
}

pub fn write_file(workspace: &Path, relative: &str, content: &str) {
    let path = workspace.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(path, content).expect("write file");
}

pub fn commit_touching(workspace: &Path, files: &[&str], message: &str) {
    for file in files {
        let marker = format!("// {message}\n");
        let path = workspace.join(file);
        let mut content = fs::read_to_string(&path).unwrap_or_default();
        content.push_str(&marker);
        write_file(workspace, file, &content);
    }
    run_git(workspace, &["add", "."]);
    run_git(workspace, &["commit", "-m", message]);
}

/// The synthetic "core" history of the seed scenarios: three coupled pairs,
/// two solo-churn files, and one isolated file.
pub fn build_core_repo(workspace: &Path) {
    init_repo(workspace);
    for index in 0..10 {
        commit_touching(
            workspace,
            &["core/engine", "core/utils"],
            &format!("engine+utils {index}"),
        );
    }
    for index in 0..10 {
        commit_touching(
            workspace,
            &["core/engine", "tests/test_engine"],
            &format!("engine+test {index}"),
        );
    }
    for index in 0..10 {
        commit_touching(
            workspace,
            &["core/utils", "tests/test_utils"],
            &format!("utils+test {index}"),
        );
    }
    for index in 0..5 {
        commit_touching(
            workspace,
            &["api/routes", "api/handlers"],
            &format!("api {index}"),
        );
    }
    for index in 0..5 {
        commit_touching(workspace, &["config"], &format!("config {index}"));
    }
    for index in 0..5 {
        commit_touching(workspace, &["README"], &format!("docs {index}"));
    }
    commit_touching(workspace, &["isolated"], "isolated once");
}
