use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use weft_core::{
    AnalysisConfig, ChangeRecord, ChangeStatus, CommitRecord, EntityId, IssueSink, PathFilter,
    ValidationIssue, ValidationMode, ValidationSummary, normalize_path, validate_path,
};
use weft_git::{LogOptions, Mirror, RawCommit, collect_churn, log_stream};
use weft_store::{ColumnarTables, EntityIndex, Store};

use crate::{AnalysisError, CancelFlag};

const PROGRESS_EVERY: u64 = 100;
const LOG_EVERY: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitChanges {
    pub oid: String,
    pub author_email: String,
    pub committer_ts: i64,
    pub subject: String,
    pub files: BTreeSet<EntityId>,
}

#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub head_oid: Option<String>,
    pub commit_count: u64,
    pub change_count: u64,
    pub entity_count: i64,
    pub oversized_changesets: u64,
    pub validation: ValidationSummary,
    pub commits: Vec<CommitChanges>,
    pub eligible: BTreeSet<EntityId>,
}

/// Drives the log stream through validation and the entity index, writing the
/// columnar commit/change tables and per-entity metadata along the way.
pub fn extract(
    mirror: &Mirror,
    store: &mut Store,
    config: &AnalysisConfig,
    cancel: &CancelFlag,
    progress: &mut dyn FnMut(f64, String),
) -> Result<ExtractOutcome, AnalysisError> {
    let filter = PathFilter::from_config(config);
    let mut sink = IssueSink::new(config.max_validation_issues_sample as usize);
    let mut index = EntityIndex::load(store)?;
    let tables = ColumnarTables::new(store.repo_dir());

    let head_oid = mirror.head_oid();
    let window_cutoff = config.window_days.map(|days| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|value| value.as_secs() as i64)
            .unwrap_or(0);
        now - i64::from(days) * 86_400
    });

    let mut commit_writer = tables.commit_writer()?;
    let mut change_writer = tables.change_writer()?;

    let mut commit_count = 0u64;
    let mut change_count = 0u64;
    let mut oversized = 0u64;
    let mut commits = Vec::new();

    if head_oid.is_some() {
        let expected_commits = mirror.commit_count()?.max(1);
        let stream = log_stream(mirror, LogOptions::default())?;

        for commit in stream {
            cancel.check()?;
            let commit = commit?;

            if let Some(cutoff) = window_cutoff
                && commit.committer_ts < cutoff
            {
                continue;
            }

            for issue in &commit.issues {
                if config.validation_mode == ValidationMode::Strict {
                    return Err(AnalysisError::Validation(format!(
                        "commit {}: unexpected token '{}'",
                        issue.commit_oid, issue.token
                    )));
                }
                sink.push(issue.clone());
            }

            let files = ingest_commit(
                &commit,
                config,
                &filter,
                &mut sink,
                &mut index,
                &mut change_writer,
                &mut change_count,
            )?;

            commit_writer.append(CommitRecord {
                commit_oid: commit.oid.clone(),
                author_name: commit.author_name.clone(),
                author_email: commit.author_email.clone(),
                authored_ts: commit.authored_ts,
                committer_ts: commit.committer_ts,
                is_merge: commit.is_merge(),
                parent_count: commit.parent_count(),
                message_subject: commit.subject.clone(),
            })?;
            commit_count += 1;

            if files.len() as u64 > u64::from(config.max_changeset_size) {
                oversized += 1;
            }
            if !files.is_empty() {
                commits.push(CommitChanges {
                    oid: commit.oid,
                    author_email: commit.author_email,
                    committer_ts: commit.committer_ts,
                    subject: commit.subject,
                    files,
                });
            }

            if commit_count % PROGRESS_EVERY == 0 {
                let percent = (commit_count as f64 / expected_commits as f64).min(1.0) * 100.0;
                progress(percent, format!("{commit_count} commits extracted"));
            }
            if commit_count % LOG_EVERY == 0 {
                tracing::info!(commits = commit_count, changes = change_count, "extraction progress");
            }
        }

        if config.collect_churn {
            cancel.check()?;
            for (path, totals) in collect_churn(mirror)? {
                let path = normalize_path(&path);
                if !path.is_empty() && filter.accepts(&path) {
                    index.add_churn(&path, totals.lines_added, totals.lines_deleted);
                }
            }
        }
    }

    cancel.check()?;
    commit_writer.finish()?;
    change_writer.finish()?;

    let head_paths = mirror.head_paths()?;
    index.finalize(store, &head_paths)?;

    let eligible = commits
        .iter()
        .flat_map(|commit| commit.files.iter().copied())
        .filter(|entity_id| index.commit_count_of(*entity_id) >= i64::from(config.min_revisions))
        .collect::<BTreeSet<_>>();

    progress(100.0, format!("{commit_count} commits extracted"));

    Ok(ExtractOutcome {
        head_oid,
        commit_count,
        change_count,
        entity_count: index.observed_count() as i64,
        oversized_changesets: oversized,
        validation: sink.summary(),
        commits,
        eligible,
    })
}

fn ingest_commit(
    commit: &RawCommit,
    config: &AnalysisConfig,
    filter: &PathFilter,
    sink: &mut IssueSink,
    index: &mut EntityIndex,
    change_writer: &mut weft_store::ChangeTableWriter,
    change_count: &mut u64,
) -> Result<BTreeSet<EntityId>, AnalysisError> {
    let mut files = BTreeSet::new();

    for change in &commit.changes {
        let Some(path) = accept_path(&commit.oid, &change.path, config, filter, sink)? else {
            continue;
        };

        let status = ChangeStatus::parse(&change.status);
        let mut old_path = None;
        if let Some(raw_old) = change.old_path.as_deref() {
            old_path = accept_path(&commit.oid, raw_old, config, filter, sink)?;
        }

        let entity_id = match (status, old_path.as_deref()) {
            (Some(ChangeStatus::Renamed(_)), Some(old)) => {
                index.record_rename(old, &path, &commit.oid)
            }
            // copies never inherit identity
            _ => index.resolve_or_create(&path),
        };
        index.observe_change(
            entity_id,
            &commit.author_email,
            commit.committer_ts,
            &commit.oid,
            &path,
        );

        change_writer.append(ChangeRecord {
            commit_oid: commit.oid.clone(),
            entity_id,
            path_at_commit: path,
            status: change.status.clone(),
            old_path,
            commit_ts: commit.committer_ts,
        })?;
        *change_count += 1;
        files.insert(entity_id);
    }

    Ok(files)
}

fn accept_path(
    commit_oid: &str,
    token: &str,
    config: &AnalysisConfig,
    filter: &PathFilter,
    sink: &mut IssueSink,
) -> Result<Option<String>, AnalysisError> {
    match validate_path(token) {
        Ok(()) => {}
        Err(rejection) => match config.validation_mode {
            ValidationMode::Strict => {
                return Err(AnalysisError::Validation(format!(
                    "commit {commit_oid}: token '{token}' rejected as path ({})",
                    rejection.as_str()
                )));
            }
            ValidationMode::Soft => {
                sink.push(ValidationIssue::rejected_path(commit_oid, token, rejection));
                return Ok(None);
            }
            ValidationMode::Permissive => {}
        },
    }

    let path = normalize_path(token);
    if path.is_empty() {
        sink.push(ValidationIssue::rejected_path(
            commit_oid,
            token,
            weft_core::PathRejection::Unnormalizable,
        ));
        return Ok(None);
    }
    if !filter.accepts(&path) {
        return Ok(None);
    }

    Ok(Some(path))
}
