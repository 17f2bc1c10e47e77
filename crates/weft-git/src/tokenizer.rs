use std::io::Read;
use std::process::{Child, Command, Stdio};

use weft_core::{COMMIT_SENTINEL, ChangeStatus, ValidationIssue, is_valid_status};

use crate::{GitError, Mirror};

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub status: String,
    pub path: String,
    pub old_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommit {
    pub oid: String,
    pub parents: Vec<String>,
    pub author_name: String,
    pub author_email: String,
    pub authored_ts: i64,
    pub committer_ts: i64,
    pub subject: String,
    pub changes: Vec<RawChange>,
    pub issues: Vec<ValidationIssue>,
}

impl RawCommit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn parent_count(&self) -> i64 {
        self.parents.len() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub find_renames_percent: u8,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            find_renames_percent: 60,
        }
    }
}

/// Streams `(header, changes)` records from the mirror's full history.
///
/// The pretty format emits a reserved sentinel token ahead of each commit so
/// the whole stream tokenizes as one null-separated run; see `CommitStream`.
pub fn log_stream(mirror: &Mirror, options: LogOptions) -> Result<CommitStream<impl Read>, GitError> {
    let pretty = format!(
        "--pretty=format:%x00{COMMIT_SENTINEL}%x00%H%x00%P%x00%an%x00%ae%x00%at%x00%ct%x00%s%x00"
    );
    let rename_arg = format!("--find-renames={}%", options.find_renames_percent);

    let mut child = Command::new("git")
        .arg("-C")
        .arg(mirror.dir())
        .args(["log", "HEAD", "--name-status", "--date-order", "-z"])
        .arg(rename_arg)
        .arg(pretty)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let stdout = child.stdout.take().ok_or_else(|| {
        GitError::Subprocess {
            command: "log".to_owned(),
            status: "no stdout".to_owned(),
            stderr: String::new(),
        }
    })?;

    Ok(CommitStream::new(stdout, Some(child)))
}

struct Tokens<R: Read> {
    reader: R,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> Tokens<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn next_token(&mut self) -> Result<Option<String>, GitError> {
        loop {
            if let Some(offset) = self.buffer[self.pos..].iter().position(|byte| *byte == 0) {
                let token = String::from_utf8_lossy(&self.buffer[self.pos..self.pos + offset])
                    .into_owned();
                self.pos += offset + 1;
                return Ok(Some(token));
            }

            if self.eof {
                if self.pos >= self.buffer.len() {
                    return Ok(None);
                }
                let token = String::from_utf8_lossy(&self.buffer[self.pos..]).into_owned();
                self.pos = self.buffer.len();
                return Ok(Some(token));
            }

            self.buffer.drain(..self.pos);
            self.pos = 0;

            let mut chunk = vec![0u8; CHUNK_SIZE];
            let read = self.reader.read(&mut chunk)?;
            if read == 0 {
                self.eof = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..read]);
            }
        }
    }
}

const HEADER_FIELDS: usize = 7;

#[derive(Debug)]
enum Expect {
    Sentinel,
    Header,
    Status,
    PathOnly { status: String },
    FirstPath { status: String },
    SecondPath { status: String, old_path: String },
}

pub struct CommitStream<R: Read> {
    tokens: Tokens<R>,
    child: Option<Child>,
    expect: Expect,
    header: Vec<String>,
    current: Option<RawCommit>,
    finished: bool,
}

impl<R: Read> CommitStream<R> {
    pub fn new(reader: R, child: Option<Child>) -> Self {
        Self {
            tokens: Tokens::new(reader),
            child,
            expect: Expect::Sentinel,
            header: Vec::with_capacity(HEADER_FIELDS),
            current: None,
            finished: false,
        }
    }

    pub fn from_reader(reader: R) -> Self {
        Self::new(reader, None)
    }

    fn begin_header(&mut self) {
        self.header.clear();
        self.expect = Expect::Header;
    }

    fn finalize_header(&mut self) -> Result<(), GitError> {
        let fields = std::mem::take(&mut self.header);
        let authored_ts = fields[4]
            .parse::<i64>()
            .map_err(|_| GitError::Parse(format!("bad author timestamp '{}'", fields[4])))?;
        let committer_ts = fields[5]
            .parse::<i64>()
            .map_err(|_| GitError::Parse(format!("bad committer timestamp '{}'", fields[5])))?;

        let parents = fields[1]
            .split_whitespace()
            .map(str::to_owned)
            .collect::<Vec<_>>();

        self.current = Some(RawCommit {
            oid: fields[0].clone(),
            parents,
            author_name: fields[2].clone(),
            author_email: fields[3].clone(),
            authored_ts,
            committer_ts,
            subject: fields[6].clone(),
            changes: Vec::new(),
            issues: Vec::new(),
        });
        self.expect = Expect::Status;
        Ok(())
    }

    fn flush(&mut self) -> Option<RawCommit> {
        self.current.take()
    }

    fn record_issue(&mut self, token: &str) {
        if let Some(commit) = self.current.as_mut() {
            commit.issues.push(ValidationIssue::resync(&commit.oid, token));
        }
    }

    fn abandon_pending_path(&mut self) {
        let pending = match &self.expect {
            Expect::PathOnly { status }
            | Expect::FirstPath { status }
            | Expect::SecondPath { status, .. } => Some(status.clone()),
            _ => None,
        };
        if let Some(status) = pending {
            self.record_issue(&status);
        }
    }

    fn check_child(&mut self) -> Result<(), GitError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if !status.success() {
            return Err(GitError::Subprocess {
                command: "log".to_owned(),
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Option<RawCommit>, GitError> {
        loop {
            let Some(raw) = self.tokens.next_token()? else {
                self.finished = true;
                self.check_child()?;
                if matches!(self.expect, Expect::Header) {
                    return Err(GitError::Parse("truncated commit header".to_owned()));
                }
                self.abandon_pending_path();
                return Ok(self.flush());
            };
            let token = raw.trim_matches(['\n', '\r']).to_owned();

            match &self.expect {
                Expect::Sentinel => {
                    if token == COMMIT_SENTINEL {
                        self.begin_header();
                    }
                }
                Expect::Header => {
                    if token == COMMIT_SENTINEL {
                        return Err(GitError::Parse("sentinel inside commit header".to_owned()));
                    }
                    self.header.push(token);
                    if self.header.len() == HEADER_FIELDS {
                        self.finalize_header()?;
                    }
                }
                Expect::Status => {
                    if token == COMMIT_SENTINEL {
                        let commit = self.flush();
                        self.begin_header();
                        if commit.is_some() {
                            return Ok(commit);
                        }
                        continue;
                    }
                    if token.is_empty() {
                        continue;
                    }
                    if is_valid_status(&token) {
                        let two = ChangeStatus::parse(&token)
                            .is_some_and(ChangeStatus::takes_two_paths);
                        self.expect = if two {
                            Expect::FirstPath { status: token }
                        } else {
                            Expect::PathOnly { status: token }
                        };
                    } else {
                        self.record_issue(&token);
                    }
                }
                Expect::PathOnly { status } => {
                    if token == COMMIT_SENTINEL {
                        self.abandon_pending_path();
                        let commit = self.flush();
                        self.begin_header();
                        if commit.is_some() {
                            return Ok(commit);
                        }
                        continue;
                    }
                    if token.is_empty() {
                        let status = status.clone();
                        self.record_issue(&status);
                        self.expect = Expect::Status;
                        continue;
                    }
                    let status = status.clone();
                    if let Some(commit) = self.current.as_mut() {
                        commit.changes.push(RawChange {
                            status,
                            path: token,
                            old_path: None,
                        });
                    }
                    self.expect = Expect::Status;
                }
                Expect::FirstPath { status } => {
                    if token == COMMIT_SENTINEL {
                        self.abandon_pending_path();
                        let commit = self.flush();
                        self.begin_header();
                        if commit.is_some() {
                            return Ok(commit);
                        }
                        continue;
                    }
                    if token.is_empty() {
                        let status = status.clone();
                        self.record_issue(&status);
                        self.expect = Expect::Status;
                        continue;
                    }
                    let status = status.clone();
                    self.expect = Expect::SecondPath {
                        status,
                        old_path: token,
                    };
                }
                Expect::SecondPath { status, old_path } => {
                    if token == COMMIT_SENTINEL {
                        self.abandon_pending_path();
                        let commit = self.flush();
                        self.begin_header();
                        if commit.is_some() {
                            return Ok(commit);
                        }
                        continue;
                    }
                    if token.is_empty() {
                        let status = status.clone();
                        self.record_issue(&status);
                        self.expect = Expect::Status;
                        continue;
                    }
                    let (status, old_path) = (status.clone(), old_path.clone());
                    if let Some(commit) = self.current.as_mut() {
                        commit.changes.push(RawChange {
                            status,
                            path: token,
                            old_path: Some(old_path),
                        });
                    }
                    self.expect = Expect::Status;
                }
            }
        }
    }
}

impl<R: Read> Iterator for CommitStream<R> {
    type Item = Result<RawCommit, GitError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(commit)) => Some(Ok(commit)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use weft_core::COMMIT_SENTINEL;

    use super::*;

    fn header(oid: &str, parents: &str, subject: &str) -> String {
        format!(
            "\0{COMMIT_SENTINEL}\0{oid}\0{parents}\0Alice\0alice@example.com\01000\02000\0{subject}\0"
        )
    }

    fn stream_of(input: &str) -> Vec<RawCommit> {
        CommitStream::from_reader(Cursor::new(input.as_bytes().to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .expect("parse stream")
    }

    #[test]
    fn parses_single_commit_with_changes() {
        let input = format!("{}\nM\0src/a.rs\0A\0src/b.rs\0", header("abc123", "", "initial"));
        let commits = stream_of(&input);

        assert_eq!(commits.len(), 1);
        let commit = &commits[0];
        assert_eq!(commit.oid, "abc123");
        assert_eq!(commit.author_name, "Alice");
        assert_eq!(commit.author_email, "alice@example.com");
        assert_eq!(commit.authored_ts, 1000);
        assert_eq!(commit.committer_ts, 2000);
        assert_eq!(commit.subject, "initial");
        assert!(!commit.is_merge());
        assert_eq!(commit.changes.len(), 2);
        assert_eq!(commit.changes[0].status, "M");
        assert_eq!(commit.changes[0].path, "src/a.rs");
        assert_eq!(commit.changes[1].status, "A");
        assert_eq!(commit.changes[1].path, "src/b.rs");
    }

    #[test]
    fn parses_consecutive_commits_and_empty_commits() {
        let input = format!(
            "{}\nM\0a.rs\0\0{}{}\nM\0b.rs\0",
            header("c1", "", "one"),
            header("c2", "c1", "empty"),
            header("c3", "c2", "three"),
        );
        let commits = stream_of(&input);

        assert_eq!(commits.len(), 3);
        assert_eq!(commits[0].oid, "c1");
        assert_eq!(commits[1].oid, "c2");
        assert!(commits[1].changes.is_empty());
        assert_eq!(commits[2].oid, "c3");
        assert_eq!(commits[2].changes[0].path, "b.rs");
    }

    #[test]
    fn rename_consumes_two_paths() {
        let input = format!("{}\nR100\0old/a.py\0new/b.py\0", header("c1", "", "rename"));
        let commits = stream_of(&input);

        let change = &commits[0].changes[0];
        assert_eq!(change.status, "R100");
        assert_eq!(change.old_path.as_deref(), Some("old/a.py"));
        assert_eq!(change.path, "new/b.py");
    }

    #[test]
    fn merge_commits_report_parent_count() {
        let input = header("m1", "p1 p2", "merge");
        let commits = stream_of(&input);

        assert!(commits[0].is_merge());
        assert_eq!(commits[0].parent_count(), 2);
    }

    #[test]
    fn garbage_between_changes_triggers_resync() {
        let input = format!(
            "{}\nM\0a.rs\0not-a-status\0M\0b.rs\0",
            header("c1", "", "subject")
        );
        let commits = stream_of(&input);

        let commit = &commits[0];
        assert_eq!(commit.changes.len(), 2);
        assert_eq!(commit.issues.len(), 1);
        assert_eq!(commit.issues[0].token, "not-a-status");
    }

    #[test]
    fn paths_with_embedded_newlines_survive() {
        let input = format!("{}\nM\0weird\nname.rs\0", header("c1", "", "subject"));
        let commits = stream_of(&input);
        assert_eq!(commits[0].changes[0].path, "weird\nname.rs");
    }

    #[test]
    fn truncated_header_is_a_parse_error() {
        let input = format!("\0{COMMIT_SENTINEL}\0abc\0\0Alice");
        let result = CommitStream::from_reader(Cursor::new(input.into_bytes()))
            .collect::<Result<Vec<_>, _>>();
        assert!(result.is_err());
    }

    #[test]
    fn chunk_boundaries_do_not_split_tokens() {
        let mut input = String::new();
        for index in 0..100 {
            input.push_str(&header(&format!("oid{index:04}"), "", "subject"));
            input.push_str("\nM\0some/long/path/to/a/file.rs\0");
        }

        struct OneByte<R: std::io::Read>(R);
        impl<R: std::io::Read> std::io::Read for OneByte<R> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let len = buf.len().min(7);
                self.0.read(&mut buf[..len])
            }
        }

        let commits = CommitStream::from_reader(OneByte(Cursor::new(input.into_bytes())))
            .collect::<Result<Vec<_>, _>>()
            .expect("parse");
        assert_eq!(commits.len(), 100);
        assert!(commits.iter().all(|commit| commit.changes.len() == 1));
    }
}
