use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::{GitError, run_git};

#[derive(Debug)]
pub struct Mirror {
    source: PathBuf,
    dir: PathBuf,
}

impl Mirror {
    /// Creates or refreshes the bare mirror for `source` under `repo_dir`.
    /// The source repository is only ever read from.
    pub fn prepare(source: impl AsRef<Path>, repo_dir: impl AsRef<Path>) -> Result<Self, GitError> {
        let source = source.as_ref().to_path_buf();
        let dir = repo_dir.as_ref().join("mirror.git");

        if gix::open(&source).is_err() {
            return Err(GitError::NotARepository { path: source });
        }

        if dir.join("HEAD").exists() {
            tracing::debug!(mirror = %dir.display(), "fetching existing mirror");
            run_git(&dir, &["fetch", "origin", "--prune"])?;
        } else {
            fs::create_dir_all(repo_dir.as_ref())?;
            tracing::debug!(source = %source.display(), mirror = %dir.display(), "cloning mirror");
            clone_mirror(&source, &dir)?;
        }

        Ok(Self { source, dir })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// HEAD commit oid, or `None` for a repository with no commits yet.
    pub fn head_oid(&self) -> Option<String> {
        let repo = gix::open(&self.dir).ok()?;
        let head_id = repo.head_id().ok()?.detach();
        Some(head_id.to_string().to_ascii_lowercase())
    }

    pub fn commit_count(&self) -> Result<u64, GitError> {
        if self.head_oid().is_none() {
            return Ok(0);
        }
        let stdout = run_git(&self.dir, &["rev-list", "--count", "HEAD"])?;
        String::from_utf8_lossy(&stdout)
            .trim()
            .parse()
            .map_err(|_| GitError::Parse("unparsable rev-list count".to_owned()))
    }

    /// Every path present in the HEAD tree. Empty for an unborn HEAD.
    pub fn head_paths(&self) -> Result<BTreeSet<String>, GitError> {
        if self.head_oid().is_none() {
            return Ok(BTreeSet::new());
        }

        let stdout = run_git(&self.dir, &["ls-tree", "-r", "--name-only", "-z", "HEAD"])?;
        let mut paths = BTreeSet::new();
        for token in stdout.split(|byte| *byte == 0) {
            if token.is_empty() {
                continue;
            }
            paths.insert(String::from_utf8_lossy(token).into_owned());
        }

        Ok(paths)
    }
}

fn clone_mirror(source: &Path, dir: &Path) -> Result<(), GitError> {
    let output = Command::new("git")
        .arg("clone")
        .arg("--mirror")
        .arg(source)
        .arg(dir)
        .output()?;
    if !output.status.success() {
        return Err(GitError::Subprocess {
            command: "clone".to_owned(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::process::Command;

    use tempfile::tempdir;

    use super::*;

    fn init_repo(workspace: &Path) {
        run(workspace, &["init"]);
        run(workspace, &["config", "user.email", "tester@example.com"]);
        run(workspace, &["config", "user.name", "Tester"]);
    }

    fn commit_files(workspace: &Path, files: &[(&str, &str)], message: &str) {
        for (relative, content) in files {
            let path = workspace.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("create parent dirs");
            }
            fs::write(path, content).expect("write file");
        }
        run(workspace, &["add", "."]);
        run(workspace, &["commit", "-m", message]);
    }

    fn run(workspace: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(workspace)
            .args(args)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn prepare_clones_then_fetches() {
        let source = tempdir().expect("source dir");
        let data = tempdir().expect("data dir");
        init_repo(source.path());
        commit_files(source.path(), &[("a.rs", "fn a() {}\n")], "initial");

        let mirror = Mirror::prepare(source.path(), data.path()).expect("first prepare");
        let first_head = mirror.head_oid().expect("head after clone");

        commit_files(source.path(), &[("b.rs", "fn b() {}\n")], "second");
        let mirror = Mirror::prepare(source.path(), data.path()).expect("second prepare");
        let second_head = mirror.head_oid().expect("head after fetch");

        assert_ne!(first_head, second_head);
        let paths = mirror.head_paths().expect("head paths");
        assert!(paths.contains("a.rs"));
        assert!(paths.contains("b.rs"));
    }

    #[test]
    fn prepare_rejects_non_repositories() {
        let source = tempdir().expect("source dir");
        let data = tempdir().expect("data dir");
        let err = Mirror::prepare(source.path(), data.path()).unwrap_err();
        assert!(matches!(err, GitError::NotARepository { .. }));
    }

    #[test]
    fn empty_repository_has_no_head() {
        let source = tempdir().expect("source dir");
        let data = tempdir().expect("data dir");
        init_repo(source.path());

        let mirror = Mirror::prepare(source.path(), data.path()).expect("prepare");
        assert_eq!(mirror.head_oid(), None);
        assert!(mirror.head_paths().expect("head paths").is_empty());
    }
}
