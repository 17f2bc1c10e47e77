use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use weft_core::{ClusterRunRecord, EntityId, TaskRecord, TaskState, ValidationIssue};

use crate::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRecord {
    pub config_id: String,
    pub name: String,
    pub version: i64,
    pub document: serde_json::Value,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub entity_count: Option<i64>,
    pub relationship_count: Option<i64>,
    pub metrics: Option<serde_json::Value>,
    pub error: Option<String>,
    pub progress: Option<serde_json::Value>,
}

impl Store {
    pub fn insert_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO analysis_tasks (
                task_id, analyzer_kind, state, config, started_at, finished_at,
                entity_count, relationship_count, metrics, error, progress, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.task_id,
                record.analyzer_kind,
                record.state.as_str(),
                serde_json::to_string(&record.config)?,
                record.started_at,
                record.finished_at,
                record.entity_count,
                record.relationship_count,
                serde_json::to_string(&record.metrics)?,
                record.error,
                serde_json::to_string(&record.progress)?,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<(), StoreError> {
        let mut assignments = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(state) = patch.state {
            assignments.push("state = ?");
            values.push(Box::new(state.as_str().to_owned()));
        }
        if let Some(started_at) = patch.started_at {
            assignments.push("started_at = ?");
            values.push(Box::new(started_at));
        }
        if let Some(finished_at) = patch.finished_at {
            assignments.push("finished_at = ?");
            values.push(Box::new(finished_at));
        }
        if let Some(entity_count) = patch.entity_count {
            assignments.push("entity_count = ?");
            values.push(Box::new(entity_count));
        }
        if let Some(relationship_count) = patch.relationship_count {
            assignments.push("relationship_count = ?");
            values.push(Box::new(relationship_count));
        }
        if let Some(metrics) = patch.metrics.as_ref() {
            assignments.push("metrics = ?");
            values.push(Box::new(serde_json::to_string(metrics)?));
        }
        if let Some(error) = patch.error.as_ref() {
            assignments.push("error = ?");
            values.push(Box::new(error.clone()));
        }
        if let Some(progress) = patch.progress.as_ref() {
            assignments.push("progress = ?");
            values.push(Box::new(serde_json::to_string(progress)?));
        }

        if assignments.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "UPDATE analysis_tasks SET {} WHERE task_id = ?",
            assignments.join(", ")
        );
        values.push(Box::new(task_id.to_owned()));
        let updated = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        if updated == 0 {
            return Err(StoreError::UnknownTask(task_id.to_owned()));
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let mut stmt = self.conn().prepare(
            r#"
            SELECT task_id, analyzer_kind, state, config, started_at, finished_at,
                   entity_count, relationship_count, metrics, error, progress, created_at
            FROM analysis_tasks
            WHERE task_id = ?1
            "#,
        )?;
        stmt.query_row(params![task_id], task_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut stmt = self.conn().prepare(
            r#"
            SELECT task_id, analyzer_kind, state, config, started_at, finished_at,
                   entity_count, relationship_count, metrics, error, progress, created_at
            FROM analysis_tasks
            ORDER BY created_at DESC, task_id DESC
            "#,
        )?;
        let rows = stmt.query_map([], task_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn upsert_configuration(
        &self,
        config_id: &str,
        name: &str,
        document: &serde_json::Value,
        now: i64,
    ) -> Result<ConfigurationRecord, StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO analysis_configurations (config_id, name, version, document, active, created_at, updated_at)
            VALUES (?1, ?2, 1, ?3, 0, ?4, ?4)
            ON CONFLICT(config_id) DO UPDATE SET
                document = excluded.document,
                version = analysis_configurations.version + 1,
                updated_at = excluded.updated_at
            "#,
            params![config_id, name, serde_json::to_string(document)?, now],
        )?;

        self.get_configuration(config_id)?
            .ok_or_else(|| StoreError::UnknownConfiguration(config_id.to_owned()))
    }

    pub fn get_configuration(
        &self,
        config_id: &str,
    ) -> Result<Option<ConfigurationRecord>, StoreError> {
        let mut stmt = self.conn().prepare(
            r#"
            SELECT config_id, name, version, document, active, created_at, updated_at
            FROM analysis_configurations
            WHERE config_id = ?1
            "#,
        )?;
        stmt.query_row(params![config_id], configuration_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_configurations(&self) -> Result<Vec<ConfigurationRecord>, StoreError> {
        let mut stmt = self.conn().prepare(
            r#"
            SELECT config_id, name, version, document, active, created_at, updated_at
            FROM analysis_configurations
            ORDER BY created_at ASC, config_id ASC
            "#,
        )?;
        let rows = stmt.query_map([], configuration_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn active_configuration(&self) -> Result<Option<ConfigurationRecord>, StoreError> {
        let mut stmt = self.conn().prepare(
            r#"
            SELECT config_id, name, version, document, active, created_at, updated_at
            FROM analysis_configurations
            WHERE active = 1
            "#,
        )?;
        stmt.query_row([], configuration_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Activates one configuration and deactivates every other in a single
    /// transaction, so exactly one remains active afterwards.
    pub fn set_active_configuration(&mut self, config_id: &str) -> Result<(), StoreError> {
        let tx = self.conn_mut().transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM analysis_configurations WHERE config_id = ?1",
                params![config_id],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownConfiguration(config_id.to_owned()));
        }

        tx.execute("UPDATE analysis_configurations SET active = 0", [])?;
        tx.execute(
            "UPDATE analysis_configurations SET active = 1 WHERE config_id = ?1",
            params![config_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn insert_cluster_run(
        &mut self,
        run: &ClusterRunRecord,
        members: &[(i64, EntityId)],
    ) -> Result<(), StoreError> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            r#"
            INSERT INTO cluster_runs (run_id, algorithm, parameters, created_at, cluster_count, metrics)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                run.run_id,
                run.algorithm,
                serde_json::to_string(&run.parameters)?,
                run.created_at,
                run.cluster_count,
                run.metrics
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cluster_members (run_id, cluster_id, entity_id) VALUES (?1, ?2, ?3)",
            )?;
            for (cluster_id, entity_id) in members {
                stmt.execute(params![run.run_id, cluster_id, entity_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_cluster_run(&self, run_id: &str) -> Result<Option<ClusterRunRecord>, StoreError> {
        let mut stmt = self.conn().prepare(
            r#"
            SELECT run_id, algorithm, parameters, created_at, cluster_count, metrics
            FROM cluster_runs
            WHERE run_id = ?1
            "#,
        )?;
        stmt.query_row(params![run_id], cluster_run_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_cluster_members(
        &self,
        run_id: &str,
    ) -> Result<Vec<(i64, EntityId)>, StoreError> {
        let mut stmt = self.conn().prepare(
            r#"
            SELECT cluster_id, entity_id
            FROM cluster_members
            WHERE run_id = ?1
            ORDER BY cluster_id ASC, entity_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn insert_validation_issues(
        &mut self,
        task_id: &str,
        issues: &[ValidationIssue],
    ) -> Result<(), StoreError> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO validation_issues (task_id, commit_oid, kind, severity, token, expected, message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for issue in issues {
                stmt.execute(params![
                    task_id,
                    issue.commit_oid,
                    issue.kind.as_str(),
                    issue.severity.as_str(),
                    issue.token,
                    issue.expected,
                    issue.message,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count_validation_issues(&self, task_id: &str) -> Result<i64, StoreError> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM validation_issues WHERE task_id = ?1",
            params![task_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let state: String = row.get(2)?;
    let config: String = row.get(3)?;
    let metrics: String = row.get(8)?;
    let progress: String = row.get(10)?;
    Ok(TaskRecord {
        task_id: row.get(0)?,
        analyzer_kind: row.get(1)?,
        state: state.parse().unwrap_or_default(),
        config: serde_json::from_str(&config).unwrap_or_default(),
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        entity_count: row.get(6)?,
        relationship_count: row.get(7)?,
        metrics: serde_json::from_str(&metrics).unwrap_or_default(),
        error: row.get(9)?,
        progress: serde_json::from_str(&progress).unwrap_or_default(),
        created_at: row.get(11)?,
    })
}

fn configuration_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfigurationRecord> {
    let document: String = row.get(3)?;
    Ok(ConfigurationRecord {
        config_id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        document: serde_json::from_str(&document).unwrap_or_default(),
        active: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn cluster_run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClusterRunRecord> {
    let parameters: String = row.get(2)?;
    let metrics: Option<String> = row.get(5)?;
    Ok(ClusterRunRecord {
        run_id: row.get(0)?,
        algorithm: row.get(1)?,
        parameters: serde_json::from_str(&parameters).unwrap_or_default(),
        created_at: row.get(3)?,
        cluster_count: row.get(4)?,
        metrics: metrics.and_then(|value| serde_json::from_str(&value).ok()),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;
    use weft_core::{TaskRecord, TaskState};

    use super::*;

    fn task(task_id: &str, created_at: i64) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_owned(),
            analyzer_kind: "git_coupling".to_owned(),
            state: TaskState::Pending,
            config: json!({}),
            started_at: None,
            finished_at: None,
            entity_count: 0,
            relationship_count: 0,
            metrics: json!({}),
            error: None,
            progress: json!({}),
            created_at,
        }
    }

    #[test]
    fn task_patch_updates_only_given_fields() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open store");

        store.insert_task(&task("t1", 100)).expect("insert");
        store
            .update_task(
                "t1",
                &TaskPatch {
                    state: Some(TaskState::Running),
                    started_at: Some(123),
                    ..TaskPatch::default()
                },
            )
            .expect("patch");

        let loaded = store.get_task("t1").expect("get").expect("present");
        assert_eq!(loaded.state, TaskState::Running);
        assert_eq!(loaded.started_at, Some(123));
        assert_eq!(loaded.finished_at, None);
        assert_eq!(loaded.analyzer_kind, "git_coupling");
    }

    #[test]
    fn updating_a_missing_task_fails() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open store");

        let err = store
            .update_task(
                "missing",
                &TaskPatch {
                    state: Some(TaskState::Running),
                    ..TaskPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTask(_)));
    }

    #[test]
    fn tasks_list_newest_first() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open store");

        store.insert_task(&task("t1", 100)).expect("insert");
        store.insert_task(&task("t2", 200)).expect("insert");

        let tasks = store.list_tasks().expect("list");
        assert_eq!(tasks[0].task_id, "t2");
        assert_eq!(tasks[1].task_id, "t1");
    }

    #[test]
    fn exactly_one_configuration_is_active_after_switching() {
        let temp = tempdir().expect("tempdir");
        let mut store = Store::open(temp.path()).expect("open store");

        store
            .upsert_configuration("c1", "default", &json!({"min_revisions": 5}), 10)
            .expect("c1");
        store
            .upsert_configuration("c2", "aggressive", &json!({"min_revisions": 2}), 20)
            .expect("c2");

        store.set_active_configuration("c1").expect("activate c1");
        store.set_active_configuration("c2").expect("activate c2");

        let configs = store.list_configurations().expect("list");
        let active = configs
            .iter()
            .filter(|config| config.active)
            .collect::<Vec<_>>();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].config_id, "c2");
    }

    #[test]
    fn activating_an_unknown_configuration_fails_and_keeps_state() {
        let temp = tempdir().expect("tempdir");
        let mut store = Store::open(temp.path()).expect("open store");

        store
            .upsert_configuration("c1", "default", &json!({}), 10)
            .expect("c1");
        store.set_active_configuration("c1").expect("activate c1");

        let err = store.set_active_configuration("ghost").unwrap_err();
        assert!(matches!(err, StoreError::UnknownConfiguration(_)));

        let active = store.active_configuration().expect("active").expect("some");
        assert_eq!(active.config_id, "c1");
    }

    #[test]
    fn configuration_upsert_bumps_version() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open store");

        let first = store
            .upsert_configuration("c1", "default", &json!({"min_revisions": 5}), 10)
            .expect("insert");
        assert_eq!(first.version, 1);

        let second = store
            .upsert_configuration("c1", "default", &json!({"min_revisions": 3}), 20)
            .expect("update");
        assert_eq!(second.version, 2);
        assert_eq!(second.document["min_revisions"], 3);
    }

    #[test]
    fn cluster_runs_round_trip_members() {
        let temp = tempdir().expect("tempdir");
        let mut store = Store::open(temp.path()).expect("open store");

        let run = weft_core::ClusterRunRecord {
            run_id: "run-1".to_owned(),
            algorithm: "connected_components".to_owned(),
            parameters: json!({"min_weight": 0.5}),
            created_at: 42,
            cluster_count: 2,
            metrics: None,
        };
        store
            .insert_cluster_run(&run, &[(1, 10), (1, 11), (2, 12)])
            .expect("insert run");

        let loaded = store.get_cluster_run("run-1").expect("get").expect("some");
        assert_eq!(loaded.cluster_count, 2);
        let members = store.list_cluster_members("run-1").expect("members");
        assert_eq!(members, vec![(1, 10), (1, 11), (2, 12)]);
    }
}
