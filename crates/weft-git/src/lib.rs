use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;

mod churn;
mod mirror;
mod tokenizer;

pub use churn::{ChurnTotals, collect_churn};
pub use mirror::Mirror;
pub use tokenizer::{CommitStream, LogOptions, RawChange, RawCommit, log_stream};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path} is not a git repository")]
    NotARepository { path: PathBuf },
    #[error("git {command} failed with {status}: {stderr}")]
    Subprocess {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("malformed log stream: {0}")]
    Parse(String),
}

pub fn is_repository(path: &std::path::Path) -> bool {
    gix::open(path).is_ok()
}

fn run_git(dir: &std::path::Path, args: &[&str]) -> Result<Vec<u8>, GitError> {
    let output = Command::new("git").arg("-C").arg(dir).args(args).output()?;
    if !output.status.success() {
        return Err(GitError::Subprocess {
            command: args.first().copied().unwrap_or("git").to_owned(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(output.stdout)
}
