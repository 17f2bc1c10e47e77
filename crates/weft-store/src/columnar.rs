use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    Array, BooleanArray, Int64Array, RecordBatch, StringArray, cast::AsArray,
    types::Int64Type,
};
use arrow_ipc::reader::FileReader;
use arrow_ipc::writer::FileWriter;
use arrow_schema::{ArrowError, DataType, Field, Schema};
use weft_core::{ChangeRecord, CommitRecord, EntityId};

use crate::StoreError;

const BATCH_ROWS: usize = 4096;

pub fn commits_table_path(repo_dir: &Path) -> PathBuf {
    repo_dir.join("columnar").join("commits.arrow")
}

pub fn changes_table_path(repo_dir: &Path) -> PathBuf {
    repo_dir.join("columnar").join("changes.arrow")
}

fn commits_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("commit_oid", DataType::Utf8, false),
        Field::new("author_name", DataType::Utf8, false),
        Field::new("author_email", DataType::Utf8, false),
        Field::new("authored_ts", DataType::Int64, false),
        Field::new("committer_ts", DataType::Int64, false),
        Field::new("is_merge", DataType::Boolean, false),
        Field::new("parent_count", DataType::Int64, false),
        Field::new("message_subject", DataType::Utf8, false),
    ]))
}

fn changes_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("commit_oid", DataType::Utf8, false),
        Field::new("entity_id", DataType::Int64, false),
        Field::new("path_at_commit", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("old_path", DataType::Utf8, true),
        Field::new("commit_ts", DataType::Int64, false),
    ]))
}

impl From<ArrowError> for StoreError {
    fn from(err: ArrowError) -> Self {
        StoreError::Columnar(err.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitPredicate {
    pub commit_oid: Option<String>,
    pub ts_min: Option<i64>,
    pub ts_max: Option<i64>,
}

impl CommitPredicate {
    fn accepts(&self, record: &CommitRecord) -> bool {
        if let Some(oid) = self.commit_oid.as_deref()
            && record.commit_oid != oid
        {
            return false;
        }
        if let Some(ts_min) = self.ts_min
            && record.committer_ts < ts_min
        {
            return false;
        }
        if let Some(ts_max) = self.ts_max
            && record.committer_ts > ts_max
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangePredicate {
    pub commit_oid: Option<String>,
    pub entity_id: Option<EntityId>,
    pub ts_min: Option<i64>,
    pub ts_max: Option<i64>,
}

impl ChangePredicate {
    fn accepts(&self, record: &ChangeRecord) -> bool {
        if let Some(oid) = self.commit_oid.as_deref()
            && record.commit_oid != oid
        {
            return false;
        }
        if let Some(entity_id) = self.entity_id
            && record.entity_id != entity_id
        {
            return false;
        }
        if let Some(ts_min) = self.ts_min
            && record.commit_ts < ts_min
        {
            return false;
        }
        if let Some(ts_max) = self.ts_max
            && record.commit_ts > ts_max
        {
            return false;
        }
        true
    }
}

/// Commit/change tables in the Arrow IPC file format. Writers stream chunked
/// record batches into a sibling temp file that is renamed into place on
/// `finish`, so a crash never leaves a half-written table behind.
pub struct ColumnarTables {
    repo_dir: PathBuf,
}

impl ColumnarTables {
    pub fn new(repo_dir: impl AsRef<Path>) -> Self {
        Self {
            repo_dir: repo_dir.as_ref().to_path_buf(),
        }
    }

    pub fn commit_writer(&self) -> Result<CommitTableWriter, StoreError> {
        CommitTableWriter::create(commits_table_path(&self.repo_dir))
    }

    pub fn change_writer(&self) -> Result<ChangeTableWriter, StoreError> {
        ChangeTableWriter::create(changes_table_path(&self.repo_dir))
    }

    pub fn scan_commits(
        &self,
        predicate: &CommitPredicate,
    ) -> Result<Vec<CommitRecord>, StoreError> {
        let path = commits_table_path(&self.repo_dir);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = FileReader::try_new(File::open(path)?, None)?;
        let mut records = Vec::new();
        for batch in reader {
            let batch = batch?;
            collect_commit_rows(&batch, predicate, &mut records)?;
        }
        Ok(records)
    }

    pub fn scan_changes(
        &self,
        predicate: &ChangePredicate,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let path = changes_table_path(&self.repo_dir);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = FileReader::try_new(File::open(path)?, None)?;
        let mut records = Vec::new();
        for batch in reader {
            let batch = batch?;
            collect_change_rows(&batch, predicate, &mut records)?;
        }
        Ok(records)
    }
}

pub struct CommitTableWriter {
    writer: FileWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    buffer: Vec<CommitRecord>,
    rows_written: u64,
}

impl CommitTableWriter {
    fn create(final_path: PathBuf) -> Result<Self, StoreError> {
        let tmp_path = sibling_tmp(&final_path)?;
        let writer = FileWriter::try_new(File::create(&tmp_path)?, &commits_schema())?;
        Ok(Self {
            writer,
            tmp_path,
            final_path,
            buffer: Vec::with_capacity(BATCH_ROWS),
            rows_written: 0,
        })
    }

    pub fn append(&mut self, record: CommitRecord) -> Result<(), StoreError> {
        self.buffer.push(record);
        if self.buffer.len() >= BATCH_ROWS {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        self.rows_written += rows.len() as u64;

        let batch = RecordBatch::try_new(
            commits_schema(),
            vec![
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|row| row.commit_oid.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|row| row.author_name.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|row| row.author_email.as_str()),
                )),
                Arc::new(Int64Array::from_iter_values(
                    rows.iter().map(|row| row.authored_ts),
                )),
                Arc::new(Int64Array::from_iter_values(
                    rows.iter().map(|row| row.committer_ts),
                )),
                Arc::new(BooleanArray::from_iter(
                    rows.iter().map(|row| Some(row.is_merge)),
                )),
                Arc::new(Int64Array::from_iter_values(
                    rows.iter().map(|row| row.parent_count),
                )),
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|row| row.message_subject.as_str()),
                )),
            ],
        )?;
        self.writer.write(&batch)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64, StoreError> {
        self.flush_batch()?;
        self.writer.finish()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.rows_written)
    }
}

pub struct ChangeTableWriter {
    writer: FileWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    buffer: Vec<ChangeRecord>,
    rows_written: u64,
}

impl ChangeTableWriter {
    fn create(final_path: PathBuf) -> Result<Self, StoreError> {
        let tmp_path = sibling_tmp(&final_path)?;
        let writer = FileWriter::try_new(File::create(&tmp_path)?, &changes_schema())?;
        Ok(Self {
            writer,
            tmp_path,
            final_path,
            buffer: Vec::with_capacity(BATCH_ROWS),
            rows_written: 0,
        })
    }

    pub fn append(&mut self, record: ChangeRecord) -> Result<(), StoreError> {
        self.buffer.push(record);
        if self.buffer.len() >= BATCH_ROWS {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        self.rows_written += rows.len() as u64;

        let batch = RecordBatch::try_new(
            changes_schema(),
            vec![
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|row| row.commit_oid.as_str()),
                )),
                Arc::new(Int64Array::from_iter_values(
                    rows.iter().map(|row| row.entity_id),
                )),
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|row| row.path_at_commit.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|row| row.status.as_str()),
                )),
                Arc::new(StringArray::from_iter(
                    rows.iter().map(|row| row.old_path.as_deref()),
                )),
                Arc::new(Int64Array::from_iter_values(
                    rows.iter().map(|row| row.commit_ts),
                )),
            ],
        )?;
        self.writer.write(&batch)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64, StoreError> {
        self.flush_batch()?;
        self.writer.finish()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.rows_written)
    }
}

fn sibling_tmp(final_path: &Path) -> Result<PathBuf, StoreError> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut name = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_owned());
    name.push_str(".tmp");
    Ok(final_path.with_file_name(name))
}

fn collect_commit_rows(
    batch: &RecordBatch,
    predicate: &CommitPredicate,
    out: &mut Vec<CommitRecord>,
) -> Result<(), StoreError> {
    let commit_oid = string_column(batch, 0)?;
    let author_name = string_column(batch, 1)?;
    let author_email = string_column(batch, 2)?;
    let authored_ts = batch.column(3).as_primitive::<Int64Type>();
    let committer_ts = batch.column(4).as_primitive::<Int64Type>();
    let is_merge = batch
        .column(5)
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| StoreError::Columnar("is_merge column has wrong type".to_owned()))?;
    let parent_count = batch.column(6).as_primitive::<Int64Type>();
    let message_subject = string_column(batch, 7)?;

    for row in 0..batch.num_rows() {
        let record = CommitRecord {
            commit_oid: commit_oid.value(row).to_owned(),
            author_name: author_name.value(row).to_owned(),
            author_email: author_email.value(row).to_owned(),
            authored_ts: authored_ts.value(row),
            committer_ts: committer_ts.value(row),
            is_merge: is_merge.value(row),
            parent_count: parent_count.value(row),
            message_subject: message_subject.value(row).to_owned(),
        };
        if predicate.accepts(&record) {
            out.push(record);
        }
    }
    Ok(())
}

fn collect_change_rows(
    batch: &RecordBatch,
    predicate: &ChangePredicate,
    out: &mut Vec<ChangeRecord>,
) -> Result<(), StoreError> {
    let commit_oid = string_column(batch, 0)?;
    let entity_id = batch.column(1).as_primitive::<Int64Type>();
    let path_at_commit = string_column(batch, 2)?;
    let status = string_column(batch, 3)?;
    let old_path = string_column(batch, 4)?;
    let commit_ts = batch.column(5).as_primitive::<Int64Type>();

    for row in 0..batch.num_rows() {
        let record = ChangeRecord {
            commit_oid: commit_oid.value(row).to_owned(),
            entity_id: entity_id.value(row),
            path_at_commit: path_at_commit.value(row).to_owned(),
            status: status.value(row).to_owned(),
            old_path: if old_path.is_null(row) {
                None
            } else {
                Some(old_path.value(row).to_owned())
            },
            commit_ts: commit_ts.value(row),
        };
        if predicate.accepts(&record) {
            out.push(record);
        }
    }
    Ok(())
}

fn string_column<'a>(batch: &'a RecordBatch, index: usize) -> Result<&'a StringArray, StoreError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StoreError::Columnar(format!("column {index} has wrong type")))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use weft_core::{ChangeRecord, CommitRecord};

    use super::*;

    fn commit(oid: &str, committer_ts: i64) -> CommitRecord {
        CommitRecord {
            commit_oid: oid.to_owned(),
            author_name: "Alice".to_owned(),
            author_email: "alice@example.com".to_owned(),
            authored_ts: committer_ts - 5,
            committer_ts,
            is_merge: false,
            parent_count: 1,
            message_subject: "subject".to_owned(),
        }
    }

    fn change(oid: &str, entity_id: i64, ts: i64) -> ChangeRecord {
        ChangeRecord {
            commit_oid: oid.to_owned(),
            entity_id,
            path_at_commit: format!("src/{entity_id}.rs"),
            status: "M".to_owned(),
            old_path: None,
            commit_ts: ts,
        }
    }

    #[test]
    fn commits_round_trip_with_predicates() {
        let temp = tempdir().expect("tempdir");
        let tables = ColumnarTables::new(temp.path());

        let mut writer = tables.commit_writer().expect("writer");
        for index in 0..10 {
            writer
                .append(commit(&format!("oid{index}"), 100 + index))
                .expect("append");
        }
        assert_eq!(writer.finish().expect("finish"), 10);

        let all = tables
            .scan_commits(&CommitPredicate::default())
            .expect("scan all");
        assert_eq!(all.len(), 10);

        let one = tables
            .scan_commits(&CommitPredicate {
                commit_oid: Some("oid3".to_owned()),
                ..CommitPredicate::default()
            })
            .expect("scan one");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].committer_ts, 103);

        let windowed = tables
            .scan_commits(&CommitPredicate {
                ts_min: Some(105),
                ts_max: Some(107),
                ..CommitPredicate::default()
            })
            .expect("scan window");
        assert_eq!(windowed.len(), 3);
    }

    #[test]
    fn changes_round_trip_with_entity_predicate() {
        let temp = tempdir().expect("tempdir");
        let tables = ColumnarTables::new(temp.path());

        let mut writer = tables.change_writer().expect("writer");
        for index in 0..6 {
            writer.append(change("oid", index % 2, index)).expect("append");
        }
        let mut renamed = change("oid", 7, 10);
        renamed.status = "R100".to_owned();
        renamed.old_path = Some("old/name.rs".to_owned());
        writer.append(renamed).expect("append rename");
        writer.finish().expect("finish");

        let of_entity = tables
            .scan_changes(&ChangePredicate {
                entity_id: Some(1),
                ..ChangePredicate::default()
            })
            .expect("scan entity");
        assert_eq!(of_entity.len(), 3);

        let rename_rows = tables
            .scan_changes(&ChangePredicate {
                entity_id: Some(7),
                ..ChangePredicate::default()
            })
            .expect("scan rename");
        assert_eq!(rename_rows[0].old_path.as_deref(), Some("old/name.rs"));
    }

    #[test]
    fn writes_land_atomically_via_rename() {
        let temp = tempdir().expect("tempdir");
        let tables = ColumnarTables::new(temp.path());

        let mut writer = tables.commit_writer().expect("writer");
        writer.append(commit("oid", 1)).expect("append");
        assert!(!commits_table_path(temp.path()).exists());
        writer.finish().expect("finish");
        assert!(commits_table_path(temp.path()).exists());
    }

    #[test]
    fn large_writes_split_into_multiple_batches() {
        let temp = tempdir().expect("tempdir");
        let tables = ColumnarTables::new(temp.path());

        let mut writer = tables.change_writer().expect("writer");
        for index in 0..(super::BATCH_ROWS as i64 * 2 + 17) {
            writer.append(change("oid", index, index)).expect("append");
        }
        let written = writer.finish().expect("finish");
        assert_eq!(written, super::BATCH_ROWS as u64 * 2 + 17);

        let all = tables
            .scan_changes(&ChangePredicate::default())
            .expect("scan");
        assert_eq!(all.len(), super::BATCH_ROWS * 2 + 17);
    }
}
