use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};

use weft_core::COMMIT_SENTINEL;

use crate::{GitError, Mirror};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChurnTotals {
    pub lines_added: i64,
    pub lines_deleted: i64,
}

/// Aggregates per-path line churn over the mirror's history via a second
/// `--numstat` pass. Binary entries (`-` counts) contribute zero.
pub fn collect_churn(mirror: &Mirror) -> Result<HashMap<String, ChurnTotals>, GitError> {
    let pretty = format!("--pretty=format:%x00{COMMIT_SENTINEL}%x00%H%x00");

    let mut child = Command::new("git")
        .arg("-C")
        .arg(mirror.dir())
        .args(["log", "HEAD", "--numstat", "--date-order", "-z"])
        .arg(pretty)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let mut stdout = child.stdout.take().ok_or_else(|| GitError::Subprocess {
        command: "log".to_owned(),
        status: "no stdout".to_owned(),
        stderr: String::new(),
    })?;

    let mut raw = Vec::new();
    stdout.read_to_end(&mut raw)?;
    let status = child.wait()?;
    if !status.success() {
        return Err(GitError::Subprocess {
            command: "log".to_owned(),
            status: status.to_string(),
            stderr: String::new(),
        });
    }

    Ok(fold_numstat_tokens(raw.split(|byte| *byte == 0)))
}

fn fold_numstat_tokens<'a>(
    tokens: impl Iterator<Item = &'a [u8]>,
) -> HashMap<String, ChurnTotals> {
    let mut totals = HashMap::<String, ChurnTotals>::new();
    let mut expect_oid = false;
    let mut pending_rename: Option<(i64, i64, bool)> = None;

    for token in tokens {
        let token = String::from_utf8_lossy(token);
        let token = token.trim_matches(['\n', '\r']);

        if token == COMMIT_SENTINEL {
            expect_oid = true;
            pending_rename = None;
            continue;
        }
        if expect_oid {
            expect_oid = false;
            continue;
        }
        if token.is_empty() {
            continue;
        }

        if let Some((added, deleted, have_old)) = pending_rename {
            if !have_old {
                pending_rename = Some((added, deleted, true));
            } else {
                let entry = totals.entry(token.to_owned()).or_default();
                entry.lines_added += added;
                entry.lines_deleted += deleted;
                pending_rename = None;
            }
            continue;
        }

        let mut parts = token.splitn(3, '\t');
        let added = parts.next().unwrap_or_default().trim();
        let deleted = parts.next().unwrap_or_default().trim();
        let path = parts.next().unwrap_or_default();

        let added = added.parse::<i64>().unwrap_or(0);
        let deleted = deleted.parse::<i64>().unwrap_or(0);

        if path.is_empty() {
            // rename entry: counts token followed by the old and new paths
            pending_rename = Some((added, deleted, false));
            continue;
        }

        let entry = totals.entry(path.to_owned()).or_default();
        entry.lines_added += added;
        entry.lines_deleted += deleted;
    }

    totals
}
