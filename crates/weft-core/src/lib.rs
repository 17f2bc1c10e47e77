use std::path::{Component, Path};

use thiserror::Error;

mod config;
mod filter;
mod records;
mod validate;

pub use config::{AnalysisConfig, ChangesetMode, default_analysis_config_json};
pub use filter::{PathFilter, wildcard_match};
pub use records::{
    CO_CHANGED, ChangeRecord, ChangeStatus, ClusterRunRecord, CommitRecord, EdgeProperties,
    EntityId, EntityKind, EntityMetadata, EntityRecord, Metric, ProgressSnapshot, RelationshipRecord,
    SOURCE_GIT, Stage, TaskRecord, TaskState,
};
pub use validate::{
    COMMIT_SENTINEL, IssueKind, IssueSeverity, IssueSink, PathRejection, ValidationIssue,
    ValidationMode, ValidationSummary, is_valid_status, validate_path,
};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn repo_id_for(name: &str) -> String {
    let slug = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "repo" } else { slug };

    let digest = blake3::hash(name.as_bytes()).to_hex();
    format!("{slug}-{}", &digest.as_str()[..8])
}

pub fn normalize_path(path: &str) -> String {
    let mut segments = Vec::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(segment) => match segment.to_str() {
                Some(segment) => segments.push(segment),
                None => return String::new(),
            },
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return String::new();
            }
        }
    }

    segments.join("/")
}
