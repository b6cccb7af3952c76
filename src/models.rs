use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four fixed pipeline stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Meet,
    Analyze,
    Build,
    Verify,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Meet, Stage::Analyze, Stage::Build, Stage::Verify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meet => "meet",
            Self::Analyze => "analyze",
            Self::Build => "build",
            Self::Verify => "verify",
        }
    }

    /// Display title used on stage cards.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Meet => "Meet",
            Self::Analyze => "Analyze",
            Self::Build => "Build",
            Self::Verify => "Verify",
        }
    }

    /// Store path of this stage's record, e.g. `stages.build`.
    pub fn path(&self) -> String {
        format!("stages.{}", self.as_str())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meet" => Ok(Self::Meet),
            "analyze" => Ok(Self::Analyze),
            "build" => Ok(Self::Build),
            "verify" => Ok(Self::Verify),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Idle,
    Waiting,
    Active,
    Complete,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// `complete` and `error` end a stage for the current pipeline iteration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub status_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub status: StageStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: StageMetrics,
}

/// Meeting metadata reported by the analyze endpoint. Only the title is
/// interpreted; everything else is carried through for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicIssue {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRecord {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub gap_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSource {
    #[default]
    Analyze,
    Verify,
}

/// A requirement checked against the current codebase, with remediation
/// metadata. Only items with `has_gap` ever reach dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapItem {
    #[serde(default)]
    pub id: u32,
    pub requirement: String,
    #[serde(default)]
    pub has_gap: bool,
    #[serde(default)]
    pub gap: String,
    #[serde(default)]
    pub current_state: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub estimated_effort: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub source: GapSource,
}

impl GapItem {
    pub fn is_dispatchable(&self) -> bool {
        self.has_gap
    }
}

/// Dispatch lane / executor mode chosen per gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Issue creation followed by automated coding-agent assignment.
    Cloud,
    /// Direct execution by the local agent.
    #[default]
    Local,
    /// Issue creation handed to a human developer.
    Developer,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Cloud, Lane::Local, Lane::Developer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
            Self::Developer => "developer",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloud" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            "developer" => Ok(Self::Developer),
            _ => Err(format!("Invalid executor: {}", s)),
        }
    }
}

/// Per-gap row status in the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    #[default]
    Pending,
    /// Issue created, waiting on agent assignment.
    Assigning,
    Assigned,
    Working,
    Implemented,
    /// Lane succeeded without reporting a per-item outcome.
    Dispatched,
    Failed,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigning => "assigning",
            Self::Assigned => "assigned",
            Self::Working => "working",
            Self::Implemented => "implemented",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Assigned | Self::Implemented | Self::Dispatched | Self::Failed
        )
    }
}

impl std::fmt::Display for RowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-requirement outcome of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub requirement: String,
    pub passed: bool,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ValidationResult {
    /// Best available explanation, preferring evidence over details over message.
    pub fn explanation(&self) -> Option<&str> {
        self.evidence
            .as_deref()
            .or(self.details.as_deref())
            .or(self.message.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

/// Per-requirement row status in the QA table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    #[default]
    Pending,
    Validating,
    Passed,
    Failed,
}

/// Status of the deploy or validate phase of a verify run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn stage_path_is_under_stages() {
        assert_eq!(Stage::Verify.path(), "stages.verify");
    }

    #[test]
    fn lane_parses_executor_names() {
        assert_eq!("cloud".parse::<Lane>().unwrap(), Lane::Cloud);
        assert_eq!("developer".parse::<Lane>().unwrap(), Lane::Developer);
        assert_eq!(Lane::default(), Lane::Local);
        assert!("Cloud".parse::<Lane>().is_err());
    }

    #[test]
    fn gap_item_deserializes_camel_case_with_defaults() {
        let json = r#"{
            "id": 3,
            "requirement": "Users can export reports as CSV",
            "hasGap": true,
            "gap": "No export endpoint",
            "complexity": "High"
        }"#;
        let gap: GapItem = serde_json::from_str(json).unwrap();
        assert_eq!(gap.id, 3);
        assert!(gap.has_gap);
        assert_eq!(gap.complexity, Complexity::High);
        assert_eq!(gap.source, GapSource::Analyze);
        assert!(!gap.selected);
        assert!(gap.current_state.is_empty());
    }

    #[test]
    fn row_status_terminal_states() {
        assert!(RowStatus::Assigned.is_terminal());
        assert!(RowStatus::Failed.is_terminal());
        assert!(!RowStatus::Assigning.is_terminal());
        assert!(!RowStatus::Working.is_terminal());
    }

    #[test]
    fn validation_explanation_prefers_evidence() {
        let result = ValidationResult {
            requirement: "r".into(),
            passed: false,
            details: Some("details".into()),
            evidence: Some("evidence".into()),
            message: None,
        };
        assert_eq!(result.explanation(), Some("evidence"));

        let blank = ValidationResult {
            evidence: Some("  ".into()),
            details: None,
            ..result
        };
        assert_eq!(blank.explanation(), None);
    }

    #[test]
    fn stage_record_serializes_camel_case() {
        let record = StageRecord {
            status: StageStatus::Waiting,
            ..Default::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "waiting");
        assert!(value.get("startTime").is_some());
        assert!(value["metrics"].get("statusText").is_some());
    }
}
