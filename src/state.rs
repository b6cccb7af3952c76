//! Shape of the application state held by the [`Store`], plus typed readers.
//!
//! The store itself is untyped; this module is the single place that knows
//! which paths exist and what they hold.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{EpicIssue, IssueRecord, MeetingInfo, Stage, StageRecord, StageStatus};
use crate::store::Store;

pub mod paths {
    pub const MEETING: &str = "meeting";
    pub const MEETING_NAME: &str = "meeting.name";
    pub const MEETING_ITERATION: &str = "meeting.iteration";
    pub const MEETING_INFO: &str = "meeting.info";
    pub const STAGES: &str = "stages";
    pub const ACTIVE_STAGE: &str = "activeStage";
    pub const DETAIL_PANEL_OPEN: &str = "detailPanelOpen";
    pub const REQUIREMENTS: &str = "requirements";
    pub const EPIC_ISSUE: &str = "epicIssue";
    pub const CREATED_ISSUES: &str = "createdIssues";
    pub const DISPATCH: &str = "dispatch";
    pub const DISPATCH_IN_PROGRESS: &str = "dispatch.inProgress";
    pub const DISPATCH_TOTAL: &str = "dispatch.totalItems";
    pub const DISPATCH_COMPLETED: &str = "dispatch.completedItems";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub name: String,
    pub iteration: u32,
    pub info: Option<MeetingInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCounters {
    pub in_progress: bool,
    pub total_items: usize,
    pub completed_items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub meeting: Meeting,
    pub stages: BTreeMap<Stage, StageRecord>,
    pub active_stage: Option<Stage>,
    pub detail_panel_open: Option<Stage>,
    pub requirements: Vec<String>,
    pub epic_issue: Option<EpicIssue>,
    pub created_issues: Vec<IssueRecord>,
    pub dispatch: DispatchCounters,
}

impl AppState {
    /// Fresh state for a new meeting: Meet is waiting, everything else idle.
    pub fn new(meeting_name: &str) -> Self {
        let stages = Stage::ALL
            .iter()
            .map(|stage| {
                let status = if *stage == Stage::Meet {
                    StageStatus::Waiting
                } else {
                    StageStatus::Idle
                };
                (
                    *stage,
                    StageRecord {
                        status,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            meeting: Meeting {
                name: meeting_name.to_string(),
                iteration: 1,
                info: None,
            },
            stages,
            active_stage: None,
            detail_panel_open: None,
            requirements: Vec::new(),
            epic_issue: None,
            created_issues: Vec::new(),
            dispatch: DispatchCounters::default(),
        }
    }

    pub fn to_json(&self) -> Value {
        // Every field is a plain serde type; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// A store seeded with this state as its initial value.
    pub fn into_store(self) -> Store {
        Store::new(self.to_json())
    }
}

pub fn stage_record(store: &Store, stage: Stage) -> StageRecord {
    store.get_as(&stage.path()).unwrap_or_default()
}

pub fn stage_status(store: &Store, stage: Stage) -> StageStatus {
    store
        .get_as(&format!("{}.status", stage.path()))
        .unwrap_or_default()
}

pub fn requirements(store: &Store) -> Vec<String> {
    store.get_as(paths::REQUIREMENTS).unwrap_or_default()
}

pub fn created_issues(store: &Store) -> Vec<IssueRecord> {
    store.get_as(paths::CREATED_ISSUES).unwrap_or_default()
}

pub fn epic_issue(store: &Store) -> Option<EpicIssue> {
    store.get_as(paths::EPIC_ISSUE)
}

pub fn dispatch_counters(store: &Store) -> DispatchCounters {
    store.get_as(paths::DISPATCH).unwrap_or_default()
}

pub fn meeting(store: &Store) -> Option<Meeting> {
    store.get_as(paths::MEETING)
}

/// Whole state, typed. `None` only if the tree no longer has the app shape.
pub fn app_state(store: &Store) -> Option<AppState> {
    serde_json::from_value(store.snapshot().to_json()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_state_has_four_stages_with_meet_waiting() {
        let state = AppState::new("Sprint planning");
        assert_eq!(state.stages.len(), 4);
        assert_eq!(state.stages[&Stage::Meet].status, StageStatus::Waiting);
        assert_eq!(state.stages[&Stage::Verify].status, StageStatus::Idle);
        assert_eq!(state.meeting.iteration, 1);
    }

    #[test]
    fn state_json_uses_documented_paths() {
        let value = AppState::new("m").to_json();
        assert_eq!(value["stages"]["build"]["status"], "idle");
        assert_eq!(value["activeStage"], Value::Null);
        assert_eq!(value["dispatch"]["completedItems"], 0);
        assert_eq!(value["createdIssues"], json!([]));
    }

    #[test]
    fn typed_readers_follow_store_writes() {
        let store = AppState::new("m").into_store();
        store
            .set(paths::REQUIREMENTS, json!(["Login", "Logout"]))
            .unwrap();
        store.set("stages.analyze.status", "active").unwrap();
        store.set(paths::DISPATCH_TOTAL, 3).unwrap();

        assert_eq!(requirements(&store), vec!["Login", "Logout"]);
        assert_eq!(stage_status(&store, Stage::Analyze), StageStatus::Active);
        assert_eq!(dispatch_counters(&store).total_items, 3);
        assert_eq!(meeting(&store).unwrap().name, "m");
        assert!(app_state(&store).is_some());
    }
}
