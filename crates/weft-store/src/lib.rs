use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use weft_core::{
    CO_CHANGED, EdgeProperties, EntityId, EntityKind, EntityMetadata, EntityRecord, Metric,
    RelationshipRecord, SOURCE_GIT,
};

mod columnar;
mod entity_index;
mod registry;
mod tasks;

pub use columnar::{
    ChangePredicate, ChangeTableWriter, ColumnarTables, CommitPredicate, CommitTableWriter,
    changes_table_path, commits_table_path,
};
pub use entity_index::{EntityIndex, LineageEntry};
pub use registry::{Registry, RepositoryRecord};
pub use tasks::{ConfigurationRecord, TaskPatch};

pub const STORE_FILE_NAME: &str = "code-intel.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("columnar table error: {0}")]
    Columnar(String),
    #[error("unknown configuration '{0}'")]
    UnknownConfiguration(String),
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub struct Store {
    conn: Connection,
    repo_dir: PathBuf,
}

impl Store {
    pub fn open(repo_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let repo_dir = repo_dir.as_ref().to_path_buf();
        fs::create_dir_all(&repo_dir)?;

        let conn = Connection::open(repo_dir.join(STORE_FILE_NAME))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self { conn, repo_dir })
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn get_entity(&self, entity_id: EntityId) -> Result<Option<EntityRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT entity_id, kind, qualified_name, exists_at_head, metadata
            FROM entities
            WHERE entity_id = ?1
            "#,
        )?;
        stmt.query_row(params![entity_id], entity_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_entity_by_name(
        &self,
        kind: EntityKind,
        qualified_name: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT entity_id, kind, qualified_name, exists_at_head, metadata
            FROM entities
            WHERE kind = ?1 AND qualified_name = ?2
            "#,
        )?;
        stmt.query_row(params![kind.as_str(), qualified_name], entity_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_or_create_entity(
        &self,
        kind: EntityKind,
        qualified_name: &str,
    ) -> Result<EntityId, StoreError> {
        if let Some(entity) = self.get_entity_by_name(kind, qualified_name)? {
            return Ok(entity.entity_id);
        }

        self.conn.execute(
            r#"
            INSERT INTO entities (kind, qualified_name, exists_at_head, metadata)
            VALUES (?1, ?2, 0, '{}')
            "#,
            params![kind.as_str(), qualified_name],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn upsert_entities(&mut self, batch: &[EntityRecord]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO entities (entity_id, kind, qualified_name, exists_at_head, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(entity_id) DO UPDATE SET
                    kind = excluded.kind,
                    qualified_name = excluded.qualified_name,
                    exists_at_head = excluded.exists_at_head,
                    metadata = excluded.metadata
                "#,
            )?;
            for record in batch {
                stmt.execute(params![
                    record.entity_id,
                    record.kind.as_str(),
                    record.qualified_name,
                    record.exists_at_head,
                    serde_json::to_string(&record.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_entities(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT entity_id, kind, qualified_name, exists_at_head, metadata
            FROM entities
            WHERE kind = ?1
            ORDER BY entity_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![kind.as_str()], entity_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn entity_count(&self, kind: EntityKind) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }

    pub fn max_entity_id(&self) -> Result<EntityId, StoreError> {
        let max = self.conn.query_row(
            "SELECT COALESCE(MAX(entity_id), 0) FROM entities",
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(max)
    }

    pub fn set_exists_at_head(
        &mut self,
        kind: EntityKind,
        head_paths: &std::collections::BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE entities SET exists_at_head = 0 WHERE kind = ?1",
            params![kind.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "UPDATE entities SET exists_at_head = 1 WHERE kind = ?1 AND qualified_name = ?2",
            )?;
            for path in head_paths {
                stmt.execute(params![kind.as_str(), path])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn replace_lineage(&mut self, entries: &[LineageEntry]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM rename_lineage", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO rename_lineage (entity_id, path, start_commit_oid, end_commit_oid)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.entity_id,
                    entry.path,
                    entry.start_commit_oid,
                    entry.end_commit_oid,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_lineage(&self, entity_id: EntityId) -> Result<Vec<LineageEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT entity_id, path, start_commit_oid, end_commit_oid
            FROM rename_lineage
            WHERE entity_id = ?1
            ORDER BY lineage_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok(LineageEntry {
                entity_id: row.get(0)?,
                path: row.get(1)?,
                start_commit_oid: row.get(2)?,
                end_commit_oid: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn known_paths(&self) -> Result<Vec<(String, EntityId)>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT qualified_name, entity_id FROM entities WHERE kind = 'file'
            UNION
            SELECT path, entity_id FROM rename_lineage
            "#,
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn replace_relationships(
        &mut self,
        source_type: &str,
        rel_kind: &str,
        batch: &[RelationshipRecord],
    ) -> Result<(), StoreError> {
        for record in batch {
            if rel_kind == CO_CHANGED && record.src >= record.dst {
                return Err(StoreError::Invariant(format!(
                    "co-change key not canonical: ({}, {})",
                    record.src, record.dst
                )));
            }
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM relationships WHERE source_type = ?1 AND rel_kind = ?2",
            params![source_type, rel_kind],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO relationships (source_type, rel_kind, src, dst, weight, properties)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for record in batch {
                stmt.execute(params![
                    source_type,
                    rel_kind,
                    record.src,
                    record.dst,
                    record.weight,
                    serde_json::to_string(&record.properties)?,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(source_type, rel_kind, count = batch.len(), "relationships replaced");
        Ok(())
    }

    pub fn list_relationships(
        &self,
        source_type: &str,
        rel_kind: &str,
    ) -> Result<Vec<RelationshipRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT source_type, rel_kind, src, dst, weight, properties
            FROM relationships
            WHERE source_type = ?1 AND rel_kind = ?2
            ORDER BY src ASC, dst ASC
            "#,
        )?;
        let rows = stmt.query_map(params![source_type, rel_kind], relationship_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn relationships_for_entity(
        &self,
        source_type: &str,
        rel_kind: &str,
        entity_id: EntityId,
    ) -> Result<Vec<RelationshipRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT source_type, rel_kind, src, dst, weight, properties
            FROM relationships
            WHERE source_type = ?1 AND rel_kind = ?2 AND (src = ?3 OR dst = ?3)
            ORDER BY src ASC, dst ASC
            "#,
        )?;
        let rows = stmt.query_map(params![source_type, rel_kind, entity_id], relationship_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn relationship_count(
        &self,
        source_type: &str,
        rel_kind: &str,
    ) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM relationships WHERE source_type = ?1 AND rel_kind = ?2",
            params![source_type, rel_kind],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count)
    }

    /// Neighbors of `entity_id` ordered by the chosen metric, strongest first.
    pub fn query_coupling(
        &self,
        entity_id: EntityId,
        metric: Metric,
        min_weight: f64,
        limit: usize,
    ) -> Result<Vec<(EntityId, RelationshipRecord)>, StoreError> {
        let edges = self.relationships_for_entity(SOURCE_GIT, CO_CHANGED, entity_id)?;

        let mut neighbors = edges
            .into_iter()
            .filter(|edge| metric.of(&edge.properties) >= min_weight)
            .map(|edge| {
                let neighbor = if edge.src == entity_id { edge.dst } else { edge.src };
                (neighbor, edge)
            })
            .collect::<Vec<_>>();

        neighbors.sort_by(|(left_id, left), (right_id, right)| {
            let left_metric = metric.of(&left.properties);
            let right_metric = metric.of(&right.properties);
            right_metric
                .partial_cmp(&left_metric)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    right
                        .properties
                        .pair_count
                        .partial_cmp(&left.properties.pair_count)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| left_id.cmp(right_id))
        });
        neighbors.truncate(limit);
        Ok(neighbors)
    }
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
    let kind: String = row.get(1)?;
    let metadata: String = row.get(4)?;
    Ok(EntityRecord {
        entity_id: row.get(0)?,
        kind: kind.parse().unwrap_or_default(),
        qualified_name: row.get(2)?,
        exists_at_head: row.get(3)?,
        metadata: serde_json::from_str::<EntityMetadata>(&metadata).unwrap_or_default(),
    })
}

fn relationship_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationshipRecord> {
    let properties: String = row.get(5)?;
    Ok(RelationshipRecord {
        source_type: row.get(0)?,
        rel_kind: row.get(1)?,
        src: row.get(2)?,
        dst: row.get(3)?,
        weight: row.get(4)?,
        properties: serde_json::from_str::<EdgeProperties>(&properties).unwrap_or_default(),
    })
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            qualified_name TEXT NOT NULL,
            exists_at_head INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE (kind, qualified_name)
        );

        CREATE TABLE IF NOT EXISTS rename_lineage (
            lineage_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            start_commit_oid TEXT NOT NULL,
            end_commit_oid TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_lineage_entity ON rename_lineage(entity_id);

        CREATE TABLE IF NOT EXISTS relationships (
            source_type TEXT NOT NULL,
            rel_kind TEXT NOT NULL,
            src INTEGER NOT NULL,
            dst INTEGER NOT NULL,
            weight REAL NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (source_type, rel_kind, src, dst)
        );
        CREATE INDEX IF NOT EXISTS idx_rel_src ON relationships(src);
        CREATE INDEX IF NOT EXISTS idx_rel_dst ON relationships(dst);
        CREATE INDEX IF NOT EXISTS idx_rel_weight ON relationships(weight);

        CREATE TABLE IF NOT EXISTS analysis_tasks (
            task_id TEXT PRIMARY KEY,
            analyzer_kind TEXT NOT NULL,
            state TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            started_at INTEGER,
            finished_at INTEGER,
            entity_count INTEGER NOT NULL DEFAULT 0,
            relationship_count INTEGER NOT NULL DEFAULT 0,
            metrics TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            progress TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_created ON analysis_tasks(created_at);

        CREATE TABLE IF NOT EXISTS analysis_configurations (
            config_id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            version INTEGER NOT NULL DEFAULT 1,
            document TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_runs (
            run_id TEXT PRIMARY KEY,
            algorithm TEXT NOT NULL,
            parameters TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            cluster_count INTEGER NOT NULL DEFAULT 0,
            metrics TEXT
        );

        CREATE TABLE IF NOT EXISTS cluster_members (
            run_id TEXT NOT NULL,
            cluster_id INTEGER NOT NULL,
            entity_id INTEGER NOT NULL,
            PRIMARY KEY (run_id, entity_id)
        );

        CREATE TABLE IF NOT EXISTS validation_issues (
            issue_id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            commit_oid TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            token TEXT NOT NULL,
            expected TEXT,
            message TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_validation_task ON validation_issues(task_id);
        "#,
    )?;

    Ok(())
}
