use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use weft_analysis::{AnalysisError, CancelFlag, build_edges, extract, group_changesets};
use weft_core::{AnalysisConfig, CO_CHANGED, ProgressSnapshot, SOURCE_GIT, Stage, TaskState};
use weft_git::Mirror;
use weft_store::{Registry, Store, TaskPatch};

use crate::now_seconds;

pub const ANALYZER_GIT_COUPLING: &str = "git_coupling";

const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

struct ProgressPublisher<'a> {
    task_id: &'a str,
    tx: &'a watch::Sender<ProgressSnapshot>,
    last_publish: Instant,
    stage: Stage,
    state: TaskState,
    entity_count: i64,
    relationship_count: i64,
}

impl<'a> ProgressPublisher<'a> {
    fn new(task_id: &'a str, tx: &'a watch::Sender<ProgressSnapshot>) -> Self {
        Self {
            task_id,
            tx,
            last_publish: Instant::now() - PUBLISH_INTERVAL,
            stage: Stage::Mirroring,
            state: TaskState::Running,
            entity_count: 0,
            relationship_count: 0,
        }
    }

    fn snapshot(&self, percent: f64, message: &str) -> ProgressSnapshot {
        ProgressSnapshot {
            task_id: self.task_id.to_owned(),
            state: self.state,
            stage: self.stage,
            percent: percent.clamp(0.0, 100.0),
            message: message.to_owned(),
            entity_count: self.entity_count,
            relationship_count: self.relationship_count,
            issued_at: now_seconds(),
        }
    }

    /// Coalesced publish: at most one snapshot per interval unless forced by
    /// a stage transition or terminal state.
    fn publish(&mut self, percent: f64, message: &str, force: bool) {
        if !force && self.last_publish.elapsed() < PUBLISH_INTERVAL {
            return;
        }
        self.last_publish = Instant::now();
        let _ = self.tx.send(self.snapshot(percent, message));
    }

    fn enter_stage(&mut self, store: &Store, stage: Stage, percent: f64, message: &str) {
        self.stage = stage;
        self.publish(percent, message, true);
        let _ = store.update_task(
            self.task_id,
            &TaskPatch {
                progress: serde_json::to_value(self.snapshot(percent, message)).ok(),
                ..TaskPatch::default()
            },
        );
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn run_analysis(
    data_dir: &Path,
    repo_dir: &Path,
    repo_id: &str,
    source_path: &Path,
    task_id: &str,
    config: &AnalysisConfig,
    cancel: &CancelFlag,
    progress_tx: &watch::Sender<ProgressSnapshot>,
) {
    let outcome = run_pipeline(
        data_dir, repo_dir, repo_id, source_path, task_id, config, cancel, progress_tx,
    );

    let (state, error) = match outcome {
        Ok(()) => (TaskState::Completed, None),
        Err(AnalysisError::Canceled) => (TaskState::Canceled, None),
        Err(err) => {
            tracing::error!(task_id, error = %err, "analysis task failed");
            (TaskState::Failed, Some(err.to_string()))
        }
    };

    if let Ok(store) = Store::open(repo_dir) {
        let _ = store.update_task(
            task_id,
            &TaskPatch {
                state: Some(state),
                finished_at: Some(now_seconds()),
                error,
                ..TaskPatch::default()
            },
        );
        if let Ok(Some(task)) = store.get_task(task_id) {
            let _ = progress_tx.send(ProgressSnapshot {
                task_id: task_id.to_owned(),
                state,
                stage: Stage::Finalizing,
                percent: if state == TaskState::Completed { 100.0 } else { 0.0 },
                message: task.error.clone().unwrap_or_default(),
                entity_count: task.entity_count,
                relationship_count: task.relationship_count,
                issued_at: now_seconds(),
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_pipeline(
    data_dir: &Path,
    repo_dir: &Path,
    repo_id: &str,
    source_path: &Path,
    task_id: &str,
    config: &AnalysisConfig,
    cancel: &CancelFlag,
    progress_tx: &watch::Sender<ProgressSnapshot>,
) -> Result<(), AnalysisError> {
    let mut run_log = open_run_log(repo_dir, task_id);
    let mut store = Store::open(repo_dir)?;
    store.update_task(
        task_id,
        &TaskPatch {
            state: Some(TaskState::Running),
            started_at: Some(now_seconds()),
            ..TaskPatch::default()
        },
    )?;

    let started = Instant::now();
    let mut publisher = ProgressPublisher::new(task_id, progress_tx);
    cancel.check()?;

    publisher.enter_stage(&store, Stage::Mirroring, 0.0, "preparing mirror");
    log_line(&mut run_log, "stage mirroring");
    let mirror = Mirror::prepare(source_path, repo_dir)?;
    cancel.check()?;

    publisher.enter_stage(&store, Stage::Extracting, 5.0, "extracting history");
    let outcome = {
        let mut on_progress = |percent: f64, message: String| {
            // extraction owns the 5-70% band
            let overall = 5.0 + percent * 0.65;
            publisher.publish(overall, &message, false);
        };
        extract(&mirror, &mut store, config, cancel, &mut on_progress)?
    };
    log_line(
        &mut run_log,
        &format!(
            "stage extracting done: {} commits, {} changes, {} entities, {} validation issues",
            outcome.commit_count,
            outcome.change_count,
            outcome.entity_count,
            outcome.validation.total
        ),
    );

    publisher.entity_count = outcome.entity_count;
    publisher.enter_stage(&store, Stage::BuildingEdges, 75.0, "building co-change edges");
    cancel.check()?;

    let transactions = group_changesets(&outcome.commits, config, now_seconds())?;
    cancel.check()?;
    let edges = build_edges(&transactions, &outcome.eligible, config);
    log_line(
        &mut run_log,
        &format!(
            "stage building_edges done: {} transactions, {} edges retained",
            transactions.len(),
            edges.len()
        ),
    );

    publisher.relationship_count = edges.len() as i64;
    publisher.enter_stage(&store, Stage::Finalizing, 90.0, "persisting relationships");
    cancel.check()?;

    store.replace_relationships(SOURCE_GIT, CO_CHANGED, &edges)?;
    store.insert_validation_issues(task_id, &outcome.validation.samples)?;

    let metrics = serde_json::json!({
        "head_oid": outcome.head_oid,
        "commit_count": outcome.commit_count,
        "change_count": outcome.change_count,
        "oversized_changesets": outcome.oversized_changesets,
        "transaction_count": transactions.len(),
        "eligible_entities": outcome.eligible.len(),
        "validation": outcome.validation,
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });
    store.update_task(
        task_id,
        &TaskPatch {
            entity_count: Some(outcome.entity_count),
            relationship_count: Some(edges.len() as i64),
            metrics: Some(metrics),
            ..TaskPatch::default()
        },
    )?;

    if let Ok(registry) = Registry::open(data_dir) {
        let _ = registry.touch_last_analyzed(repo_id, now_seconds());
    }

    publisher.publish(100.0, "analysis complete", true);
    log_line(&mut run_log, "stage finalizing done");
    tracing::info!(
        task_id,
        repo_id,
        commits = outcome.commit_count,
        entities = outcome.entity_count,
        edges = edges.len(),
        "analysis completed"
    );

    Ok(())
}

fn open_run_log(repo_dir: &Path, task_id: &str) -> Option<File> {
    let dir = repo_dir.join("logs");
    fs::create_dir_all(&dir).ok()?;
    File::create(dir.join(format!("run-{task_id}.log"))).ok()
}

fn log_line(run_log: &mut Option<File>, line: &str) {
    if let Some(file) = run_log.as_mut() {
        let _ = writeln!(file, "[{}] {}", now_seconds(), line);
    }
}
