use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const COMMIT_SENTINEL: &str = "__CODE_INTEL_COMMIT__";

pub const DEFAULT_ISSUE_SAMPLE: usize = 200;

static STATUS_RE: OnceLock<Regex> = OnceLock::new();
static RENAME_RE: OnceLock<Regex> = OnceLock::new();
static OID_RE: OnceLock<Regex> = OnceLock::new();

fn status_re() -> &'static Regex {
    STATUS_RE.get_or_init(|| Regex::new(r"^([AMDTUXB]|[RC]\d{2,3})$").expect("status pattern"))
}

fn rename_re() -> &'static Regex {
    RENAME_RE.get_or_init(|| Regex::new(r"^[RC]\d{2,3}$").expect("rename pattern"))
}

fn oid_re() -> &'static Regex {
    OID_RE.get_or_init(|| Regex::new(r"^[0-9a-f]{40}$").expect("oid pattern"))
}

pub fn is_valid_status(token: &str) -> bool {
    status_re().is_match(token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Strict,
    #[default]
    Soft,
    Permissive,
}

impl ValidationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Soft => "soft",
            Self::Permissive => "permissive",
        }
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "strict" => Ok(Self::Strict),
            "soft" => Ok(Self::Soft),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!(
                "invalid validation mode '{other}', expected one of: strict, soft, permissive"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRejection {
    StatusCode,
    RenameCode,
    CommitOid,
    Email,
    SentinelPrefix,
    ShortAlphabetic,
    Unnormalizable,
}

impl PathRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusCode => "status_code",
            Self::RenameCode => "rename_code",
            Self::CommitOid => "commit_oid",
            Self::Email => "email",
            Self::SentinelPrefix => "sentinel_prefix",
            Self::ShortAlphabetic => "short_alphabetic",
            Self::Unnormalizable => "unnormalizable",
        }
    }
}

pub fn validate_path(token: &str) -> Result<(), PathRejection> {
    if token.starts_with(COMMIT_SENTINEL) {
        return Err(PathRejection::SentinelPrefix);
    }
    if is_valid_status(token) {
        return Err(PathRejection::StatusCode);
    }
    if rename_re().is_match(token) {
        return Err(PathRejection::RenameCode);
    }
    if oid_re().is_match(token) {
        return Err(PathRejection::CommitOid);
    }
    if token.contains('@') && !token.contains('/') {
        return Err(PathRejection::Email);
    }
    if token.len() <= 3 && !token.is_empty() && token.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(PathRejection::ShortAlphabetic);
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    InvalidStatus,
    InvalidPath,
    StreamResync,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidStatus => "invalid_status",
            Self::InvalidPath => "invalid_path",
            Self::StreamResync => "stream_resync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

impl IssueSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub commit_oid: String,
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn rejected_path(commit_oid: &str, token: &str, rejection: PathRejection) -> Self {
        Self {
            commit_oid: commit_oid.to_owned(),
            kind: IssueKind::InvalidPath,
            severity: IssueSeverity::Warning,
            token: token.to_owned(),
            expected: Some("path".to_owned()),
            message: format!("token rejected as path: {}", rejection.as_str()),
        }
    }

    pub fn rejected_status(commit_oid: &str, token: &str) -> Self {
        Self {
            commit_oid: commit_oid.to_owned(),
            kind: IssueKind::InvalidStatus,
            severity: IssueSeverity::Warning,
            token: token.to_owned(),
            expected: Some("status".to_owned()),
            message: "token does not match the status pattern".to_owned(),
        }
    }

    pub fn resync(commit_oid: &str, token: &str) -> Self {
        Self {
            commit_oid: commit_oid.to_owned(),
            kind: IssueKind::StreamResync,
            severity: IssueSeverity::Warning,
            token: token.to_owned(),
            expected: None,
            message: "token skipped while resynchronizing the change stream".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidationSummary {
    pub total: u64,
    pub counts: BTreeMap<String, u64>,
    pub samples: Vec<ValidationIssue>,
}

#[derive(Debug, Clone)]
pub struct IssueSink {
    max_samples: usize,
    total: u64,
    counts: BTreeMap<String, u64>,
    samples: Vec<ValidationIssue>,
}

impl IssueSink {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            total: 0,
            counts: BTreeMap::new(),
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.total += 1;
        *self.counts.entry(issue.kind.as_str().to_owned()).or_insert(0) += 1;
        if self.samples.len() < self.max_samples {
            self.samples.push(issue);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary {
            total: self.total,
            counts: self.counts.clone(),
            samples: self.samples.clone(),
        }
    }
}

impl Default for IssueSink {
    fn default() -> Self {
        Self::new(DEFAULT_ISSUE_SAMPLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_pattern_accepts_all_codes() {
        for token in ["A", "M", "D", "T", "U", "X", "B", "R100", "R60", "C050"] {
            assert!(is_valid_status(token), "{token} should be a valid status");
        }
    }

    #[test]
    fn status_pattern_rejects_garbage() {
        for token in ["", "AM", "R1", "R1000", "r100", "C1", "Z", "src/a.rs"] {
            assert!(!is_valid_status(token), "{token} should not be a status");
        }
    }

    #[test]
    fn path_validation_rejects_status_lookalikes() {
        assert_eq!(validate_path("M"), Err(PathRejection::StatusCode));
        assert_eq!(validate_path("R100"), Err(PathRejection::StatusCode));
        assert_eq!(validate_path("C050"), Err(PathRejection::StatusCode));
    }

    #[test]
    fn path_validation_rejects_oids_and_emails() {
        let oid = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(validate_path(oid), Err(PathRejection::CommitOid));
        assert_eq!(validate_path("dev@example.com"), Err(PathRejection::Email));
        assert!(validate_path("docs/dev@example.com.txt").is_ok());
    }

    #[test]
    fn path_validation_rejects_short_alphabetic_tokens() {
        assert_eq!(validate_path("IDE"), Err(PathRejection::ShortAlphabetic));
        assert_eq!(validate_path("SRC"), Err(PathRejection::ShortAlphabetic));
        assert_eq!(validate_path("ab"), Err(PathRejection::ShortAlphabetic));
        assert!(validate_path("a.rs").is_ok());
        assert!(validate_path("Cargo.toml").is_ok());
    }

    #[test]
    fn path_validation_rejects_sentinel_prefix() {
        assert_eq!(
            validate_path("__CODE_INTEL_COMMIT__extra"),
            Err(PathRejection::SentinelPrefix)
        );
    }

    #[test]
    fn sink_caps_samples_but_counts_everything() {
        let mut sink = IssueSink::new(2);
        for index in 0..5 {
            sink.push(ValidationIssue::rejected_status("oid", &format!("tok{index}")));
        }
        let summary = sink.summary();
        assert_eq!(summary.total, 5);
        assert_eq!(summary.samples.len(), 2);
        assert_eq!(summary.counts.get("invalid_status"), Some(&5));
    }
}
