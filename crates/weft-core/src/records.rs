use serde::{Deserialize, Serialize};

pub type EntityId = i64;

pub const SOURCE_GIT: &str = "git";
pub const CO_CHANGED: &str = "CO_CHANGED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    File,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "file" => Ok(Self::File),
            other => Err(format!("invalid entity kind '{other}', expected: file")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityMetadata {
    #[serde(default)]
    pub total_commits: i64,
    #[serde(default)]
    pub authors_count: i64,
    #[serde(default)]
    pub total_lines_added: i64,
    #[serde(default)]
    pub total_lines_deleted: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_commit_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub qualified_name: String,
    pub exists_at_head: bool,
    pub metadata: EntityMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    TypeChanged,
    Unmerged,
    Unknown,
    Broken,
    Renamed(u8),
    Copied(u8),
}

impl ChangeStatus {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "A" => return Some(Self::Added),
            "M" => return Some(Self::Modified),
            "D" => return Some(Self::Deleted),
            "T" => return Some(Self::TypeChanged),
            "U" => return Some(Self::Unmerged),
            "X" => return Some(Self::Unknown),
            "B" => return Some(Self::Broken),
            _ => {}
        }

        if !token.is_ascii() {
            return None;
        }
        let (head, digits) = token.split_at(1.min(token.len()));
        if digits.len() < 2 || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let score = digits.parse::<u16>().ok()?.min(100) as u8;
        match head {
            "R" => Some(Self::Renamed(score)),
            "C" => Some(Self::Copied(score)),
            _ => None,
        }
    }

    pub fn takes_two_paths(self) -> bool {
        matches!(self, Self::Renamed(_) | Self::Copied(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub commit_oid: String,
    pub author_name: String,
    pub author_email: String,
    pub authored_ts: i64,
    pub committer_ts: i64,
    pub is_merge: bool,
    pub parent_count: i64,
    pub message_subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub commit_oid: String,
    pub entity_id: EntityId,
    pub path_at_commit: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub commit_ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EdgeProperties {
    pub pair_count: f64,
    pub jaccard: f64,
    pub jaccard_weighted: f64,
    pub p_dst_given_src: f64,
    pub p_src_given_dst: f64,
    pub src_count: i64,
    pub dst_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub source_type: String,
    pub rel_kind: String,
    pub src: EntityId,
    pub dst: EntityId,
    pub weight: f64,
    pub properties: EdgeProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Jaccard,
    JaccardWeighted,
    PairCount,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jaccard => "jaccard",
            Self::JaccardWeighted => "jaccard_weighted",
            Self::PairCount => "pair_count",
        }
    }

    pub fn of(self, properties: &EdgeProperties) -> f64 {
        match self {
            Self::Jaccard => properties.jaccard,
            Self::JaccardWeighted => properties.jaccard_weighted,
            Self::PairCount => properties.pair_count,
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "jaccard" => Ok(Self::Jaccard),
            "jaccard_weighted" => Ok(Self::JaccardWeighted),
            "pair_count" => Ok(Self::PairCount),
            other => Err(format!(
                "invalid metric '{other}', expected one of: jaccard, jaccard_weighted, pair_count"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("invalid task state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Mirroring,
    Extracting,
    BuildingEdges,
    Finalizing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mirroring => "mirroring",
            Self::Extracting => "extracting",
            Self::BuildingEdges => "building_edges",
            Self::Finalizing => "finalizing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub state: TaskState,
    pub stage: Stage,
    pub percent: f64,
    pub message: String,
    pub entity_count: i64,
    pub relationship_count: i64,
    pub issued_at: i64,
}

impl ProgressSnapshot {
    pub fn initial(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_owned(),
            state: TaskState::Pending,
            stage: Stage::Mirroring,
            percent: 0.0,
            message: String::new(),
            entity_count: 0,
            relationship_count: 0,
            issued_at: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub analyzer_kind: String,
    pub state: TaskState,
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub entity_count: i64,
    pub relationship_count: i64,
    pub metrics: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRunRecord {
    pub run_id: String,
    pub algorithm: String,
    pub parameters: serde_json::Value,
    pub created_at: i64,
    pub cluster_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_status_parses_rename_scores() {
        assert_eq!(ChangeStatus::parse("R100"), Some(ChangeStatus::Renamed(100)));
        assert_eq!(ChangeStatus::parse("C75"), Some(ChangeStatus::Copied(75)));
        assert_eq!(ChangeStatus::parse("R1"), None);
        assert_eq!(ChangeStatus::parse("R1000"), None);
        assert_eq!(ChangeStatus::parse("Q50"), None);
        assert_eq!(ChangeStatus::parse(""), None);
    }

    #[test]
    fn change_status_parses_single_letters() {
        for (token, expected) in [
            ("A", ChangeStatus::Added),
            ("M", ChangeStatus::Modified),
            ("D", ChangeStatus::Deleted),
            ("T", ChangeStatus::TypeChanged),
            ("U", ChangeStatus::Unmerged),
            ("X", ChangeStatus::Unknown),
            ("B", ChangeStatus::Broken),
        ] {
            assert_eq!(ChangeStatus::parse(token), Some(expected));
        }
    }

    #[test]
    fn task_state_round_trips_through_wire_names() {
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>(), Ok(state));
        }
    }

    #[test]
    fn metric_selects_matching_property() {
        let properties = EdgeProperties {
            pair_count: 10.0,
            jaccard: 0.5,
            jaccard_weighted: 0.4,
            p_dst_given_src: 1.0,
            p_src_given_dst: 0.5,
            src_count: 10,
            dst_count: 20,
        };
        assert_eq!(Metric::Jaccard.of(&properties), 0.5);
        assert_eq!(Metric::JaccardWeighted.of(&properties), 0.4);
        assert_eq!(Metric::PairCount.of(&properties), 10.0);
    }
}
