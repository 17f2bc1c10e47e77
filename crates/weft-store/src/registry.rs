use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::StoreError;

pub const REGISTRY_FILE_NAME: &str = "registry.sqlite";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub repo_id: String,
    pub name: String,
    pub source_path: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analyzed_at: Option<i64>,
}

/// Data-dir level registry of analyzed repositories. Everything else lives in
/// each repository's own store.
pub struct Registry {
    conn: Connection,
    data_dir: PathBuf,
}

impl Registry {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let conn = Connection::open(data_dir.join(REGISTRY_FILE_NAME))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                repo_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source_path TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_analyzed_at INTEGER
            );
            "#,
        )?;

        Ok(Self { conn, data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.data_dir.join("repos").join(repo_id)
    }

    pub fn insert_repository(&self, record: &RepositoryRecord) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO repositories (repo_id, name, source_path, created_at, last_analyzed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(repo_id) DO UPDATE SET
                name = excluded.name,
                source_path = excluded.source_path
            "#,
            params![
                record.repo_id,
                record.name,
                record.source_path,
                record.created_at,
                record.last_analyzed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_repository(&self, repo_id: &str) -> Result<Option<RepositoryRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT repo_id, name, source_path, created_at, last_analyzed_at
            FROM repositories
            WHERE repo_id = ?1
            "#,
        )?;
        stmt.query_row(params![repo_id], repository_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_repositories(&self) -> Result<Vec<RepositoryRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT repo_id, name, source_path, created_at, last_analyzed_at
            FROM repositories
            ORDER BY created_at ASC, repo_id ASC
            "#,
        )?;
        let rows = stmt.query_map([], repository_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn delete_repository(&self, repo_id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM repositories WHERE repo_id = ?1", params![repo_id])?;
        Ok(deleted > 0)
    }

    pub fn touch_last_analyzed(&self, repo_id: &str, at: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE repositories SET last_analyzed_at = ?2 WHERE repo_id = ?1",
            params![repo_id, at],
        )?;
        Ok(())
    }
}

fn repository_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepositoryRecord> {
    Ok(RepositoryRecord {
        repo_id: row.get(0)?,
        name: row.get(1)?,
        source_path: row.get(2)?,
        created_at: row.get(3)?,
        last_analyzed_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(repo_id: &str, created_at: i64) -> RepositoryRecord {
        RepositoryRecord {
            repo_id: repo_id.to_owned(),
            name: repo_id.to_owned(),
            source_path: format!("/tmp/{repo_id}"),
            created_at,
            last_analyzed_at: None,
        }
    }

    #[test]
    fn repositories_round_trip() {
        let temp = tempdir().expect("tempdir");
        let registry = Registry::open(temp.path()).expect("open");

        registry.insert_repository(&record("alpha-1234", 10)).expect("insert");
        registry.insert_repository(&record("beta-5678", 20)).expect("insert");

        let listed = registry.list_repositories().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].repo_id, "alpha-1234");

        registry.touch_last_analyzed("alpha-1234", 99).expect("touch");
        let loaded = registry
            .get_repository("alpha-1234")
            .expect("get")
            .expect("present");
        assert_eq!(loaded.last_analyzed_at, Some(99));

        assert!(registry.delete_repository("alpha-1234").expect("delete"));
        assert!(!registry.delete_repository("alpha-1234").expect("redelete"));
    }
}
