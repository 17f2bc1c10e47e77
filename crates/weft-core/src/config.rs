use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::validate::{DEFAULT_ISSUE_SAMPLE, ValidationMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetMode {
    #[default]
    ByCommit,
    ByAuthorTime,
    ByTicketId,
}

impl ChangesetMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ByCommit => "by_commit",
            Self::ByAuthorTime => "by_author_time",
            Self::ByTicketId => "by_ticket_id",
        }
    }
}

impl std::str::FromStr for ChangesetMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "by_commit" => Ok(Self::ByCommit),
            "by_author_time" => Ok(Self::ByAuthorTime),
            "by_ticket_id" => Ok(Self::ByTicketId),
            other => Err(format!(
                "invalid changeset mode '{other}', expected one of: by_commit, by_author_time, by_ticket_id"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    #[serde(default = "default_min_revisions")]
    pub min_revisions: u32,
    #[serde(default = "default_max_changeset_size")]
    pub max_changeset_size: u32,
    #[serde(default)]
    pub changeset_mode: ChangesetMode,
    #[serde(default = "default_author_time_window_hours")]
    pub author_time_window_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id_pattern: Option<String>,
    #[serde(default = "default_max_logical_changeset_size")]
    pub max_logical_changeset_size: u32,
    #[serde(default = "default_min_cooccurrence")]
    pub min_cooccurrence: u32,
    #[serde(default = "default_topk_edges_per_file")]
    pub topk_edges_per_file: u32,
    #[serde(default = "default_component_depth")]
    pub component_depth: u32,
    #[serde(default = "default_min_component_cooccurrence")]
    pub min_component_cooccurrence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_half_life_days: Option<u32>,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub include_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_extensions: Vec<String>,
    #[serde(default)]
    pub validation_mode: ValidationMode,
    #[serde(default = "default_max_validation_issues_sample")]
    pub max_validation_issues_sample: u32,
    #[serde(default = "default_collect_churn")]
    pub collect_churn: bool,
}

fn default_min_revisions() -> u32 {
    5
}

fn default_max_changeset_size() -> u32 {
    50
}

fn default_author_time_window_hours() -> u32 {
    24
}

fn default_max_logical_changeset_size() -> u32 {
    100
}

fn default_min_cooccurrence() -> u32 {
    5
}

fn default_topk_edges_per_file() -> u32 {
    50
}

fn default_component_depth() -> u32 {
    2
}

fn default_min_component_cooccurrence() -> u32 {
    5
}

fn default_max_validation_issues_sample() -> u32 {
    DEFAULT_ISSUE_SAMPLE as u32
}

fn default_collect_churn() -> bool {
    true
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_revisions: default_min_revisions(),
            max_changeset_size: default_max_changeset_size(),
            changeset_mode: ChangesetMode::default(),
            author_time_window_hours: default_author_time_window_hours(),
            ticket_id_pattern: None,
            max_logical_changeset_size: default_max_logical_changeset_size(),
            min_cooccurrence: default_min_cooccurrence(),
            topk_edges_per_file: default_topk_edges_per_file(),
            component_depth: default_component_depth(),
            min_component_cooccurrence: default_min_component_cooccurrence(),
            window_days: None,
            decay_half_life_days: None,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            include_extensions: Vec::new(),
            exclude_extensions: Vec::new(),
            validation_mode: ValidationMode::default(),
            max_validation_issues_sample: default_max_validation_issues_sample(),
            collect_churn: default_collect_churn(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_document(document: &serde_json::Value) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_value(document.clone())
            .map_err(|err| CoreError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_document(&self) -> Result<serde_json::Value, CoreError> {
        serde_json::to_value(self).map_err(CoreError::Json)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_changeset_size < 2 {
            return Err(CoreError::InvalidConfig(
                "max_changeset_size must be at least 2".to_owned(),
            ));
        }
        if self.max_logical_changeset_size < self.max_changeset_size {
            return Err(CoreError::InvalidConfig(
                "max_logical_changeset_size must not be below max_changeset_size".to_owned(),
            ));
        }
        if self.topk_edges_per_file == 0 {
            return Err(CoreError::InvalidConfig(
                "topk_edges_per_file must be positive".to_owned(),
            ));
        }
        if self.component_depth == 0 {
            return Err(CoreError::InvalidConfig(
                "component_depth must be positive".to_owned(),
            ));
        }
        if self.decay_half_life_days == Some(0) {
            return Err(CoreError::InvalidConfig(
                "decay_half_life_days must be positive when set".to_owned(),
            ));
        }
        if self.window_days == Some(0) {
            return Err(CoreError::InvalidConfig(
                "window_days must be positive when set".to_owned(),
            ));
        }

        if self.changeset_mode == ChangesetMode::ByTicketId && self.ticket_id_pattern.is_none() {
            return Err(CoreError::InvalidConfig(
                "changeset_mode by_ticket_id requires ticket_id_pattern".to_owned(),
            ));
        }
        if let Some(pattern) = self.ticket_id_pattern.as_deref() {
            Regex::new(pattern).map_err(|err| CoreError::Pattern {
                pattern: pattern.to_owned(),
                message: err.to_string(),
            })?;
        }

        Ok(())
    }
}

pub fn default_analysis_config_json() -> serde_json::Value {
    serde_json::to_value(AnalysisConfig::default()).unwrap_or_default()
}
