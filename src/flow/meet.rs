//! Meet stage: extract requirements from a meeting.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;

use crate::api::{Endpoint, PipelineApi};
use crate::bus::AdvisoryLevel;
use crate::errors::{FlowError, StageError};
use crate::models::{EpicIssue, MeetingInfo, Stage, StageStatus};
use crate::stage::{LoopPatch, StageController, StagePatch};
use crate::state::{self, paths};
use crate::stream::events::MeetEvent;

/// What to analyze. With no transcript the server uses the latest meeting.
#[derive(Debug, Clone, Default)]
pub struct MeetRequest {
    pub meeting_name: Option<String>,
    pub transcript: Option<String>,
}

impl MeetRequest {
    fn body(&self) -> Value {
        match &self.transcript {
            Some(transcript) => json!({
                "transcript": transcript,
                "meetingName": self.meeting_name,
            }),
            None => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeetOutcome {
    pub requirements: Vec<String>,
    pub epic: Option<EpicIssue>,
    pub info: Option<MeetingInfo>,
}

#[derive(Clone)]
pub struct MeetFlow {
    api: Arc<dyn PipelineApi>,
    stages: StageController,
}

impl MeetFlow {
    pub fn new(api: Arc<dyn PipelineApi>, stages: StageController) -> Self {
        Self { api, stages }
    }

    /// Stream `/api/analyze` and record requirements, meeting info, and the
    /// epic issue. Requirements are write-once per meeting.
    pub async fn run(&self, request: &MeetRequest) -> Result<MeetOutcome, FlowError> {
        let store = self.stages.store();
        let bus = self.stages.bus();
        if !state::requirements(store).is_empty() {
            bus.advise(
                AdvisoryLevel::Warning,
                "Requirements already extracted; start a new meeting to analyze another",
            );
            return Err(FlowError::RequirementsLocked);
        }

        self.stages.advance_stage(None, Stage::Meet)?;
        self.stages.set_stage(
            Stage::Meet,
            StagePatch::default().status_text("Extracting requirements"),
        )?;

        let mut outcome = MeetOutcome::default();
        let mut summary = None;
        let streamed = super::consume::<MeetEvent, _>(
            self.api.as_ref(),
            Endpoint::Analyze,
            request.body(),
            bus,
            |event| match event {
                MeetEvent::Meeting(info) => outcome.info = Some(info),
                MeetEvent::Requirement { text } => {
                    if !text.trim().is_empty() {
                        outcome.requirements.push(text);
                    }
                }
                MeetEvent::Epic(epic) => outcome.epic = Some(epic),
                MeetEvent::Complete(complete) => summary = Some(complete),
                MeetEvent::Log { .. } | MeetEvent::Error { .. } => {}
            },
        )
        .await;

        if let Err(err) = streamed {
            self.fail(&err.to_string())?;
            return Err(err.into());
        }
        if let Some(summary) = summary {
            if outcome.requirements.is_empty() {
                outcome.requirements = summary
                    .requirements
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|r| !r.trim().is_empty())
                    .collect();
            }
            outcome.epic = outcome.epic.or(summary.epic);
            outcome.info = outcome.info.or(summary.meeting);
        }
        if outcome.requirements.is_empty() {
            self.fail("No requirements found")?;
            return Err(FlowError::EmptyAnalysis);
        }

        store
            .patch([
                (paths::REQUIREMENTS, json!(outcome.requirements)),
                (paths::EPIC_ISSUE, json!(outcome.epic)),
            ])
            .map_err(StageError::from)?;

        let count = outcome.requirements.len();
        let mut meet = StagePatch::status(StageStatus::Complete)
            .primary(format!("{} requirements", count))
            .status_text("Requirements extracted");
        if let Some(epic) = &outcome.epic {
            meet = meet.secondary(format!("Epic #{}", epic.number));
        }
        let mut patch = LoopPatch::new()
            .stage(Stage::Meet, meet)
            .stage(Stage::Analyze, StagePatch::status(StageStatus::Waiting));
        if let Some(info) = outcome.info.clone() {
            patch = patch.meeting_info(info);
        }
        self.stages.update_loop_state(patch)?;

        info!(requirements = count, "Meeting analyzed");
        bus.advise(
            AdvisoryLevel::Success,
            format!("Extracted {} requirements", count),
        );
        Ok(outcome)
    }

    fn fail(&self, message: &str) -> Result<(), StageError> {
        self.stages.set_stage(
            Stage::Meet,
            StagePatch::status(StageStatus::Error).status_text(message),
        )?;
        self.stages
            .bus()
            .advise(AdvisoryLevel::Error, format!("Meeting analysis failed: {}", message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{Script, ScriptedApi, frame};
    use crate::bus::{EventBus, StageActions};
    use crate::stage::NullView;
    use crate::state::AppState;

    fn flow(api: Arc<ScriptedApi>) -> MeetFlow {
        let stages = StageController::new(
            AppState::new("Planning").into_store(),
            EventBus::new(),
            StageActions::new(),
            Arc::new(NullView),
        );
        MeetFlow::new(api, stages)
    }

    #[tokio::test]
    async fn test_meet_records_requirements_and_advances() {
        let api = Arc::new(ScriptedApi::new());
        api.script(
            Endpoint::Analyze,
            Script::Frames(vec![
                frame("meeting", json!({"title": "Q3 planning", "participants": ["ana"]})),
                frame("requirement", json!({"text": "Users can log in"})),
                frame("requirement", json!({"text": "Reports export to CSV"})),
                frame("epic", json!({"number": 42, "url": "https://tracker/42"})),
                frame("complete", json!({})),
            ]),
        );
        let flow = flow(api.clone());

        let outcome = flow
            .run(&MeetRequest {
                meeting_name: Some("Q3".into()),
                transcript: Some("we need login".into()),
            })
            .await
            .unwrap();

        assert_eq!(outcome.requirements.len(), 2);
        let store = flow.stages.store();
        assert_eq!(state::requirements(store), outcome.requirements);
        assert_eq!(state::epic_issue(store).unwrap().number, 42);
        assert_eq!(state::stage_status(store, Stage::Meet), StageStatus::Complete);
        assert_eq!(state::stage_status(store, Stage::Analyze), StageStatus::Waiting);
        let meeting = state::meeting(store).unwrap();
        assert_eq!(meeting.info.unwrap().title.as_deref(), Some("Q3 planning"));
        assert_eq!(
            flow.stages.record(Stage::Meet).metrics.primary.as_deref(),
            Some("2 requirements")
        );
        assert_eq!(api.calls_to(Endpoint::Analyze)[0]["transcript"], "we need login");
    }

    #[tokio::test]
    async fn test_meet_falls_back_to_complete_payload() {
        let api = Arc::new(ScriptedApi::new());
        api.script(
            Endpoint::Analyze,
            Script::Frames(vec![frame("complete", json!({"requirements": ["A", "", "B"]}))]),
        );
        let flow = flow(api.clone());
        let outcome = flow.run(&MeetRequest::default()).await.unwrap();
        assert_eq!(outcome.requirements, vec!["A", "B"]);
        assert_eq!(api.calls_to(Endpoint::Analyze)[0], Value::Null);
    }

    #[tokio::test]
    async fn test_requirements_are_locked_once_set() {
        let api = Arc::new(ScriptedApi::new());
        api.script(
            Endpoint::Analyze,
            Script::Frames(vec![frame("requirement", json!({"text": "A"}))]),
        );
        let flow = flow(api.clone());
        flow.run(&MeetRequest::default()).await.unwrap();

        let err = flow.run(&MeetRequest::default()).await.unwrap_err();
        assert!(matches!(err, FlowError::RequirementsLocked));
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_meet_failure_marks_stage_error() {
        let api = Arc::new(ScriptedApi::new());
        api.script(Endpoint::Analyze, Script::Reject("transcript not found".into()));
        let flow = flow(api);
        let err = flow.run(&MeetRequest::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "transcript not found");

        let record = flow.stages.record(Stage::Meet);
        assert_eq!(record.status, StageStatus::Error);
        assert_eq!(record.metrics.status_text.as_deref(), Some("transcript not found"));
        assert!(state::requirements(flow.stages.store()).is_empty());
        assert_eq!(flow.stages.active_stage(), None);
    }

    #[tokio::test]
    async fn test_empty_analysis_is_an_error() {
        let api = Arc::new(ScriptedApi::new());
        api.script(Endpoint::Analyze, Script::Frames(vec![frame("complete", json!({}))]));
        let flow = flow(api);
        let err = flow.run(&MeetRequest::default()).await.unwrap_err();
        assert!(matches!(err, FlowError::EmptyAnalysis));
    }
}
