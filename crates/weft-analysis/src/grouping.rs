use std::collections::BTreeMap;
use std::collections::BTreeSet;

use regex::Regex;
use weft_core::{AnalysisConfig, ChangesetMode, EntityId};

use crate::{AnalysisError, CommitChanges};

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub files: BTreeSet<EntityId>,
    pub weight: f64,
    pub ts: i64,
}

/// Folds per-commit change sets into transactions under the configured
/// grouping policy, then applies the optional time-decay weighting.
pub fn group_changesets(
    commits: &[CommitChanges],
    config: &AnalysisConfig,
    now_ts: i64,
) -> Result<Vec<Transaction>, AnalysisError> {
    let mut ordered = commits.to_vec();
    ordered.sort_by(|left, right| {
        left.committer_ts
            .cmp(&right.committer_ts)
            .then_with(|| left.oid.cmp(&right.oid))
    });

    let mut transactions = match config.changeset_mode {
        ChangesetMode::ByCommit => by_commit(&ordered, config),
        ChangesetMode::ByAuthorTime => by_author_time(&ordered, config),
        ChangesetMode::ByTicketId => by_ticket_id(&ordered, config)?,
    };

    if let Some(half_life_days) = config.decay_half_life_days {
        let half_life = f64::from(half_life_days);
        for transaction in &mut transactions {
            let age_days = ((now_ts - transaction.ts).max(0) as f64) / 86_400.0;
            transaction.weight *= 0.5f64.powf(age_days / half_life);
        }
    }

    transactions.sort_by(|left, right| left.ts.cmp(&right.ts));
    Ok(transactions)
}

fn by_commit(commits: &[CommitChanges], config: &AnalysisConfig) -> Vec<Transaction> {
    commits
        .iter()
        .filter(|commit| {
            commit.files.len() >= 2 && commit.files.len() <= config.max_changeset_size as usize
        })
        .map(|commit| Transaction {
            files: commit.files.clone(),
            weight: 1.0,
            ts: commit.committer_ts,
        })
        .collect()
}

fn by_author_time(commits: &[CommitChanges], config: &AnalysisConfig) -> Vec<Transaction> {
    let window = i64::from(config.author_time_window_hours) * 3_600;
    let mut transactions = Vec::new();

    let mut current: Option<(String, i64, Transaction)> = None;
    for commit in commits {
        let extend = current.as_ref().is_some_and(|(author, start_ts, _)| {
            *author == commit.author_email && commit.committer_ts <= *start_ts + window
        });

        if extend {
            if let Some((_, _, transaction)) = current.as_mut() {
                transaction.files.extend(commit.files.iter().copied());
                transaction.ts = commit.committer_ts;
            }
        } else {
            if let Some((_, _, transaction)) = current.take() {
                transactions.push(transaction);
            }
            current = Some((
                commit.author_email.clone(),
                commit.committer_ts,
                Transaction {
                    files: commit.files.clone(),
                    weight: 1.0,
                    ts: commit.committer_ts,
                },
            ));
        }
    }
    if let Some((_, _, transaction)) = current.take() {
        transactions.push(transaction);
    }

    transactions
        .into_iter()
        .filter(|transaction| {
            transaction.files.len() >= 2
                && transaction.files.len() <= config.max_logical_changeset_size as usize
        })
        .collect()
}

fn by_ticket_id(
    commits: &[CommitChanges],
    config: &AnalysisConfig,
) -> Result<Vec<Transaction>, AnalysisError> {
    let pattern = config.ticket_id_pattern.as_deref().ok_or_else(|| {
        AnalysisError::Config(weft_core::CoreError::InvalidConfig(
            "changeset_mode by_ticket_id requires ticket_id_pattern".to_owned(),
        ))
    })?;
    let regex = Regex::new(pattern).map_err(|err| {
        AnalysisError::Config(weft_core::CoreError::Pattern {
            pattern: pattern.to_owned(),
            message: err.to_string(),
        })
    })?;

    let mut by_ticket: BTreeMap<String, Transaction> = BTreeMap::new();
    let mut fallback = Vec::new();

    for commit in commits {
        let ticket = regex.captures(&commit.subject).map(|captures| {
            captures
                .get(1)
                .unwrap_or_else(|| captures.get(0).expect("whole match"))
                .as_str()
                .to_owned()
        });

        match ticket {
            Some(ticket) => {
                by_ticket
                    .entry(ticket)
                    .and_modify(|transaction| {
                        transaction.files.extend(commit.files.iter().copied());
                        transaction.ts = transaction.ts.min(commit.committer_ts);
                    })
                    .or_insert_with(|| Transaction {
                        files: commit.files.clone(),
                        weight: 1.0,
                        ts: commit.committer_ts,
                    });
            }
            None => fallback.push(commit.clone()),
        }
    }

    let mut transactions = by_ticket.into_values().collect::<Vec<_>>();
    transactions.extend(by_commit(&fallback, config));

    Ok(transactions
        .into_iter()
        .filter(|transaction| {
            transaction.files.len() >= 2
                && transaction.files.len() <= config.max_logical_changeset_size as usize
        })
        .collect())
}
