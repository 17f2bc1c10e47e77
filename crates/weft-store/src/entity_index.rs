use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use weft_core::{EntityId, EntityKind, EntityMetadata, EntityRecord};

use crate::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub entity_id: EntityId,
    pub path: String,
    pub start_commit_oid: String,
    pub end_commit_oid: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct EntityStats {
    total_commits: i64,
    authors: BTreeSet<String>,
    lines_added: i64,
    lines_deleted: i64,
    first_commit_ts: Option<i64>,
    last_commit_ts: Option<i64>,
}

/// Path ↔ entity-id index over the rename history.
///
/// History is consumed newest-first, so a rename `old → new` is seen before
/// any commit that touched `old`: the rename repoints `old` at the entity the
/// new path already resolves to, and every older observation of `old` then
/// lands on the same id. Counters are rebuilt from scratch on every run, which
/// keeps repeated extractions idempotent.
pub struct EntityIndex {
    paths: HashMap<String, EntityId>,
    canonical: HashMap<EntityId, String>,
    stats: HashMap<EntityId, EntityStats>,
    lineage: HashMap<(EntityId, String), LineageEntry>,
    next_id: EntityId,
    stored_max_id: EntityId,
}

impl EntityIndex {
    pub fn load(store: &Store) -> Result<Self, StoreError> {
        let mut paths = HashMap::new();
        let mut canonical = HashMap::new();
        for entity in store.list_entities(EntityKind::File)? {
            canonical.insert(entity.entity_id, entity.qualified_name.clone());
            paths.insert(entity.qualified_name, entity.entity_id);
        }
        for (path, entity_id) in store.known_paths()? {
            paths.entry(path).or_insert(entity_id);
        }
        let stored_max_id = store.max_entity_id()?;

        Ok(Self {
            paths,
            canonical,
            stats: HashMap::new(),
            lineage: HashMap::new(),
            next_id: stored_max_id + 1,
            stored_max_id,
        })
    }

    pub fn resolve(&self, path: &str) -> Option<EntityId> {
        self.paths.get(path).copied()
    }

    pub fn resolve_or_create(&mut self, path: &str) -> EntityId {
        if let Some(entity_id) = self.paths.get(path) {
            return *entity_id;
        }

        let entity_id = self.next_id;
        self.next_id += 1;
        self.paths.insert(path.to_owned(), entity_id);
        self.canonical.insert(entity_id, path.to_owned());
        entity_id
    }

    pub fn observe_change(
        &mut self,
        entity_id: EntityId,
        author_email: &str,
        commit_ts: i64,
        commit_oid: &str,
        path: &str,
    ) {
        let stats = self.stats.entry(entity_id).or_default();
        stats.total_commits += 1;
        if !author_email.is_empty() {
            stats.authors.insert(author_email.to_owned());
        }
        stats.first_commit_ts = Some(match stats.first_commit_ts {
            Some(existing) => existing.min(commit_ts),
            None => commit_ts,
        });
        stats.last_commit_ts = Some(match stats.last_commit_ts {
            Some(existing) => existing.max(commit_ts),
            None => commit_ts,
        });

        if let Some(entry) = self.lineage.get_mut(&(entity_id, path.to_owned())) {
            // older commits refine where this retired path began
            entry.start_commit_oid = commit_oid.to_owned();
        }
    }

    /// Links `old_path` to the identity the renamed file already carries.
    /// Copies never go through here; a copied path keeps its own entity.
    pub fn record_rename(&mut self, old_path: &str, new_path: &str, commit_oid: &str) -> EntityId {
        let entity_id = match (self.paths.get(new_path).copied(), self.paths.get(old_path).copied())
        {
            (Some(new_id), Some(old_id)) if new_id != old_id => {
                if new_id > self.stored_max_id {
                    self.merge(new_id, old_id);
                    old_id
                } else {
                    // both identities predate this run; trust the stored linkage
                    self.paths.insert(old_path.to_owned(), old_id);
                    old_id
                }
            }
            (Some(new_id), _) => {
                self.paths.insert(old_path.to_owned(), new_id);
                new_id
            }
            (None, Some(old_id)) => {
                self.paths.insert(new_path.to_owned(), old_id);
                self.canonical.insert(old_id, new_path.to_owned());
                old_id
            }
            (None, None) => {
                let entity_id = self.resolve_or_create(new_path);
                self.paths.insert(old_path.to_owned(), entity_id);
                entity_id
            }
        };

        self.lineage
            .entry((entity_id, old_path.to_owned()))
            .or_insert_with(|| LineageEntry {
                entity_id,
                path: old_path.to_owned(),
                start_commit_oid: commit_oid.to_owned(),
                end_commit_oid: Some(commit_oid.to_owned()),
            });

        entity_id
    }

    fn merge(&mut self, from: EntityId, into: EntityId) {
        if let Some(from_stats) = self.stats.remove(&from) {
            let stats = self.stats.entry(into).or_default();
            stats.total_commits += from_stats.total_commits;
            stats.authors.extend(from_stats.authors);
            stats.lines_added += from_stats.lines_added;
            stats.lines_deleted += from_stats.lines_deleted;
            stats.first_commit_ts = match (stats.first_commit_ts, from_stats.first_commit_ts) {
                (Some(left), Some(right)) => Some(left.min(right)),
                (left, right) => left.or(right),
            };
            stats.last_commit_ts = match (stats.last_commit_ts, from_stats.last_commit_ts) {
                (Some(left), Some(right)) => Some(left.max(right)),
                (left, right) => left.or(right),
            };
        }

        for entity_id in self.paths.values_mut() {
            if *entity_id == from {
                *entity_id = into;
            }
        }
        if let Some(name) = self.canonical.remove(&from) {
            // the newer name wins as the entity's qualified name
            self.canonical.insert(into, name);
        }

        let rekeyed = self
            .lineage
            .drain()
            .map(|((entity_id, path), mut entry)| {
                let entity_id = if entity_id == from { into } else { entity_id };
                entry.entity_id = entity_id;
                ((entity_id, path), entry)
            })
            .collect();
        self.lineage = rekeyed;
    }

    pub fn add_churn(&mut self, path: &str, lines_added: i64, lines_deleted: i64) {
        if let Some(entity_id) = self.paths.get(path).copied() {
            let stats = self.stats.entry(entity_id).or_default();
            stats.lines_added += lines_added;
            stats.lines_deleted += lines_deleted;
        }
    }

    pub fn observed_count(&self) -> usize {
        self.stats.len()
    }

    pub fn commit_count_of(&self, entity_id: EntityId) -> i64 {
        self.stats
            .get(&entity_id)
            .map(|stats| stats.total_commits)
            .unwrap_or(0)
    }

    pub fn qualified_name_of(&self, entity_id: EntityId) -> Option<&str> {
        self.canonical.get(&entity_id).map(String::as_str)
    }

    /// Writes observed entities, the rebuilt lineage, and the HEAD flags.
    pub fn finalize(
        &self,
        store: &mut Store,
        head_paths: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let mut records = Vec::with_capacity(self.stats.len());
        for (entity_id, stats) in &self.stats {
            let Some(qualified_name) = self.canonical.get(entity_id) else {
                return Err(StoreError::Invariant(format!(
                    "entity {entity_id} has no qualified name"
                )));
            };
            records.push(EntityRecord {
                entity_id: *entity_id,
                kind: EntityKind::File,
                qualified_name: qualified_name.clone(),
                exists_at_head: head_paths.contains(qualified_name),
                metadata: EntityMetadata {
                    total_commits: stats.total_commits,
                    authors_count: stats.authors.len() as i64,
                    total_lines_added: stats.lines_added,
                    total_lines_deleted: stats.lines_deleted,
                    first_commit_ts: stats.first_commit_ts,
                    last_commit_ts: stats.last_commit_ts,
                },
            });
        }
        records.sort_by_key(|record| record.entity_id);
        store.upsert_entities(&records)?;

        let mut lineage = self.lineage.values().cloned().collect::<Vec<_>>();
        lineage.sort_by(|left, right| {
            left.entity_id
                .cmp(&right.entity_id)
                .then_with(|| left.path.cmp(&right.path))
        });
        store.replace_lineage(&lineage)?;

        store.set_exists_at_head(EntityKind::File, head_paths)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use weft_core::EntityKind;

    use super::*;
    use crate::Store;

    #[test]
    fn resolve_or_create_is_stable_per_path() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open");
        let mut index = EntityIndex::load(&store).expect("load");

        let a = index.resolve_or_create("src/a.rs");
        let b = index.resolve_or_create("src/b.rs");
        assert_ne!(a, b);
        assert_eq!(index.resolve_or_create("src/a.rs"), a);
    }

    #[test]
    fn rename_links_old_path_to_the_surviving_identity() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open");
        let mut index = EntityIndex::load(&store).expect("load");

        // newest-first: the renamed file shows up under its new name first
        let renamed = index.resolve_or_create("b.py");
        index.observe_change(renamed, "alice@example.com", 300, "c3", "b.py");

        let linked = index.record_rename("a.py", "b.py", "c2");
        assert_eq!(linked, renamed);

        let old = index.resolve("a.py").expect("old path resolves");
        assert_eq!(old, renamed);
        index.observe_change(old, "alice@example.com", 100, "c1", "a.py");

        assert_eq!(index.commit_count_of(renamed), 2);
        assert_eq!(index.qualified_name_of(renamed), Some("b.py"));
    }

    #[test]
    fn rename_lineage_tracks_first_and_last_commit_of_the_old_path() {
        let temp = tempdir().expect("tempdir");
        let mut store = Store::open(temp.path()).expect("open");
        let mut index = EntityIndex::load(&store).expect("load");

        let id = index.resolve_or_create("b.py");
        index.observe_change(id, "alice@example.com", 300, "c3", "b.py");
        index.record_rename("a.py", "b.py", "c2");
        let old = index.resolve("a.py").expect("resolves");
        index.observe_change(old, "alice@example.com", 200, "c1", "a.py");
        index.observe_change(old, "alice@example.com", 100, "c0", "a.py");

        index
            .finalize(&mut store, &BTreeSet::from(["b.py".to_owned()]))
            .expect("finalize");

        let lineage = store.list_lineage(id).expect("lineage");
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0].path, "a.py");
        assert_eq!(lineage[0].start_commit_oid, "c0");
        assert_eq!(lineage[0].end_commit_oid.as_deref(), Some("c2"));
    }

    #[test]
    fn fresh_identity_created_before_the_rename_is_merged() {
        let temp = tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("open");

        // previous run only knew the old name
        let stored = store
            .get_or_create_entity(EntityKind::File, "a.py")
            .expect("stored entity");

        let mut index = EntityIndex::load(&store).expect("load");
        let fresh = index.resolve_or_create("b.py");
        assert_ne!(fresh, stored);
        index.observe_change(fresh, "alice@example.com", 300, "c3", "b.py");

        let merged = index.record_rename("a.py", "b.py", "c2");
        assert_eq!(merged, stored);
        assert_eq!(index.resolve("b.py"), Some(stored));
        assert_eq!(index.commit_count_of(stored), 1);
        assert_eq!(index.qualified_name_of(stored), Some("b.py"));
    }

    #[test]
    fn finalize_persists_metadata_and_head_flags() {
        let temp = tempdir().expect("tempdir");
        let mut store = Store::open(temp.path()).expect("open");
        let mut index = EntityIndex::load(&store).expect("load");

        let id = index.resolve_or_create("src/a.rs");
        index.observe_change(id, "alice@example.com", 100, "c1", "src/a.rs");
        index.observe_change(id, "bob@example.com", 200, "c2", "src/a.rs");
        index.add_churn("src/a.rs", 12, 3);

        index
            .finalize(&mut store, &BTreeSet::from(["src/a.rs".to_owned()]))
            .expect("finalize");

        let entity = store
            .get_entity_by_name(EntityKind::File, "src/a.rs")
            .expect("get")
            .expect("present");
        assert!(entity.exists_at_head);
        assert_eq!(entity.metadata.total_commits, 2);
        assert_eq!(entity.metadata.authors_count, 2);
        assert_eq!(entity.metadata.total_lines_added, 12);
        assert_eq!(entity.metadata.total_lines_deleted, 3);
        assert_eq!(entity.metadata.first_commit_ts, Some(100));
        assert_eq!(entity.metadata.last_commit_ts, Some(200));
    }
}
