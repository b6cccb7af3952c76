//! Stage state machine and the shared detail surface.
//!
//! Each stage moves `idle → waiting → active → {complete | error}` under the
//! control of the flow modules. All mutations go through
//! [`StageController::update_loop_state`], which commits one store patch and
//! then re-renders every stage card from the committed store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::info;

use crate::bus::{AdvisoryLevel, EventBus, StageAction, StageActions, UiEvent};
use crate::errors::StageError;
use crate::models::{MeetingInfo, Stage, StageRecord, StageStatus};
use crate::state::{self, paths};
use crate::store::Store;

/// Which stage, if any, is presented in the shared detail surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailView {
    #[default]
    None,
    Viewing(Stage),
}

/// Everything a view needs to draw one stage card.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCard {
    pub stage: Stage,
    pub record: StageRecord,
    pub actions: Vec<StageAction>,
    pub detail_open: bool,
}

/// Rendering collaborator. Implementations only draw; they never mutate state.
pub trait StageView: Send + Sync {
    fn render_stages(&self, cards: &[StageCard]);

    fn render_detail(&self, card: &StageCard) {
        let _ = card;
    }
}

/// A view that draws nothing.
pub struct NullView;

impl StageView for NullView {
    fn render_stages(&self, _cards: &[StageCard]) {}
}

/// Partial update of one stage record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagePatch {
    pub status: Option<StageStatus>,
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub status_text: Option<String>,
}

impl StagePatch {
    pub fn status(status: StageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn primary(mut self, text: impl Into<String>) -> Self {
        self.primary = Some(text.into());
        self
    }

    pub fn secondary(mut self, text: impl Into<String>) -> Self {
        self.secondary = Some(text.into());
        self
    }

    pub fn status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = Some(text.into());
        self
    }
}

/// Partial update of the loop: stage records, the active stage, the open
/// detail surface, and meeting metadata.
#[derive(Debug, Clone, Default)]
pub struct LoopPatch {
    stages: BTreeMap<Stage, StagePatch>,
    active_stage: Option<Option<Stage>>,
    detail_panel_open: Option<Option<Stage>>,
    meeting_name: Option<String>,
    meeting_iteration: Option<u32>,
    meeting_info: Option<MeetingInfo>,
}

impl LoopPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Stage, patch: StagePatch) -> Self {
        self.stages.insert(stage, patch);
        self
    }

    pub fn active_stage(mut self, stage: Option<Stage>) -> Self {
        self.active_stage = Some(stage);
        self
    }

    pub fn detail_panel_open(mut self, stage: Option<Stage>) -> Self {
        self.detail_panel_open = Some(stage);
        self
    }

    pub fn meeting_name(mut self, name: impl Into<String>) -> Self {
        self.meeting_name = Some(name.into());
        self
    }

    pub fn meeting_iteration(mut self, iteration: u32) -> Self {
        self.meeting_iteration = Some(iteration.max(1));
        self
    }

    pub fn meeting_info(mut self, info: MeetingInfo) -> Self {
        self.meeting_info = Some(info);
        self
    }
}

#[derive(Clone)]
pub struct StageController {
    store: Store,
    bus: EventBus,
    actions: StageActions,
    view: Arc<dyn StageView>,
}

impl StageController {
    pub fn new(store: Store, bus: EventBus, actions: StageActions, view: Arc<dyn StageView>) -> Self {
        Self {
            store,
            bus,
            actions,
            view,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn actions(&self) -> &StageActions {
        &self.actions
    }

    pub fn record(&self, stage: Stage) -> StageRecord {
        state::stage_record(&self.store, stage)
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        state::stage_status(&self.store, stage)
    }

    pub fn active_stage(&self) -> Option<Stage> {
        self.store
            .get_as::<Option<Stage>>(paths::ACTIVE_STAGE)
            .flatten()
    }

    /// Merge `patch` into the store as one commit, then re-render.
    ///
    /// Rejected without any state change if the result would have two
    /// active stages.
    pub fn update_loop_state(&self, patch: LoopPatch) -> Result<(), StageError> {
        let now = json!(Utc::now());
        let mut statuses: BTreeMap<Stage, StageStatus> =
            Stage::ALL.iter().map(|s| (*s, self.status(*s))).collect();
        let current_active = self.active_stage();
        let mut active = current_active;
        let mut entries: Vec<(String, Value)> = Vec::new();

        for (stage, stage_patch) in &patch.stages {
            let base = stage.path();
            if let Some(status) = stage_patch.status {
                entries.push((format!("{}.status", base), json!(status)));
                statuses.insert(*stage, status);
                match status {
                    StageStatus::Active => {
                        entries.push((format!("{}.startTime", base), now.clone()));
                        entries.push((format!("{}.endTime", base), Value::Null));
                        active = Some(*stage);
                    }
                    StageStatus::Complete | StageStatus::Error => {
                        entries.push((format!("{}.endTime", base), now.clone()));
                        if active == Some(*stage) {
                            active = None;
                        }
                    }
                    StageStatus::Idle | StageStatus::Waiting => {
                        if active == Some(*stage) {
                            active = None;
                        }
                    }
                }
                info!(stage = %stage, status = %status, "Stage status");
            }
            for (field, value) in [
                ("primary", &stage_patch.primary),
                ("secondary", &stage_patch.secondary),
                ("statusText", &stage_patch.status_text),
            ] {
                if let Some(text) = value {
                    entries.push((format!("{}.metrics.{}", base, field), json!(text)));
                }
            }
        }

        let mut running = statuses
            .iter()
            .filter(|(_, status)| **status == StageStatus::Active)
            .map(|(stage, _)| *stage);
        if let (Some(first), Some(second)) = (running.next(), running.next()) {
            return Err(StageError::MultipleActive { first, second });
        }

        if let Some(explicit) = patch.active_stage {
            active = explicit;
        }
        if active != current_active {
            entries.push((paths::ACTIVE_STAGE.to_string(), json!(active)));
        }
        if let Some(detail) = patch.detail_panel_open {
            entries.push((paths::DETAIL_PANEL_OPEN.to_string(), json!(detail)));
        }
        if let Some(name) = patch.meeting_name {
            entries.push((paths::MEETING_NAME.to_string(), json!(name)));
        }
        if let Some(iteration) = patch.meeting_iteration {
            entries.push((paths::MEETING_ITERATION.to_string(), json!(iteration)));
        }
        if let Some(info) = patch.meeting_info {
            entries.push((paths::MEETING_INFO.to_string(), json!(info)));
        }

        self.store.patch(entries)?;
        self.render();
        Ok(())
    }

    /// Shorthand for patching a single stage.
    pub fn set_stage(&self, stage: Stage, patch: StagePatch) -> Result<(), StageError> {
        self.update_loop_state(LoopPatch::new().stage(stage, patch))
    }

    /// Mark `from` complete (when given) and `to` active, then signal the
    /// transition.
    pub fn advance_stage(&self, from: Option<Stage>, to: Stage) -> Result<(), StageError> {
        let mut patch = LoopPatch::new().stage(to, StagePatch::status(StageStatus::Active));
        if let Some(from) = from {
            patch = patch.stage(from, StagePatch::status(StageStatus::Complete));
        }
        self.update_loop_state(patch)?;
        self.bus.emit(UiEvent::StageTransition { from, to });
        Ok(())
    }

    pub fn detail_view(&self) -> DetailView {
        match self
            .store
            .get_as::<Option<Stage>>(paths::DETAIL_PANEL_OPEN)
            .flatten()
        {
            Some(stage) => DetailView::Viewing(stage),
            None => DetailView::None,
        }
    }

    /// Present `stage` in the detail surface, closing any other stage first.
    pub fn open_detail(&self, stage: Stage) -> Result<(), StageError> {
        if self.status(stage) == StageStatus::Idle {
            self.bus.advise(
                AdvisoryLevel::Info,
                format!("{} has nothing to show yet", stage.title()),
            );
            return Err(StageError::NothingToShow(stage));
        }
        match self.detail_view() {
            DetailView::Viewing(current) if current == stage => return Ok(()),
            DetailView::Viewing(_) => {
                self.close_detail()?;
            }
            DetailView::None => {}
        }
        self.update_loop_state(LoopPatch::new().detail_panel_open(Some(stage)))?;
        self.bus.emit(UiEvent::DetailOpened { stage });
        Ok(())
    }

    /// Close the detail surface. Returns `false` when nothing was open.
    pub fn close_detail(&self) -> Result<bool, StageError> {
        let DetailView::Viewing(stage) = self.detail_view() else {
            return Ok(false);
        };
        self.update_loop_state(LoopPatch::new().detail_panel_open(None))?;
        self.bus.emit(UiEvent::DetailClosed { stage });
        Ok(true)
    }

    /// Global cancel gesture (Escape).
    pub fn cancel(&self) -> Result<bool, StageError> {
        self.close_detail()
    }

    /// Stage the header should highlight: the active stage, else the
    /// furthest stage that has been reached.
    pub fn header_stage(&self) -> Stage {
        if let Some(active) = self.active_stage() {
            return active;
        }
        Stage::ALL
            .iter()
            .rev()
            .copied()
            .find(|stage| self.status(*stage) != StageStatus::Idle)
            .unwrap_or(Stage::Meet)
    }

    pub fn cards(&self) -> Vec<StageCard> {
        let detail = self.detail_view();
        Stage::ALL
            .iter()
            .map(|stage| {
                let record = self.record(*stage);
                let actions = self.actions.actions_for(*stage, &record);
                StageCard {
                    stage: *stage,
                    record,
                    actions,
                    detail_open: detail == DetailView::Viewing(*stage),
                }
            })
            .collect()
    }

    /// Redraw all stage cards (and the detail surface) from committed state.
    pub fn render(&self) {
        let cards = self.cards();
        self.view.render_stages(&cards);
        if let Some(card) = cards.iter().find(|c| c.detail_open) {
            self.view.render_detail(card);
        }
        self.bus.emit(UiEvent::StagesRendered {
            active: self.active_stage(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingView {
        renders: Mutex<Vec<Vec<StageCard>>>,
        details: Mutex<Vec<Stage>>,
    }

    impl StageView for RecordingView {
        fn render_stages(&self, cards: &[StageCard]) {
            self.renders.lock().unwrap().push(cards.to_vec());
        }

        fn render_detail(&self, card: &StageCard) {
            self.details.lock().unwrap().push(card.stage);
        }
    }

    fn controller() -> (StageController, Arc<RecordingView>, EventBus) {
        let store = AppState::new("Weekly sync").into_store();
        let view = Arc::new(RecordingView::default());
        let bus = EventBus::new();
        let controller = StageController::new(store, bus.clone(), StageActions::new(), view.clone());
        (controller, view, bus)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn update_merges_stage_fields_and_stamps_times() {
        let (controller, _, _) = controller();
        controller
            .set_stage(
                Stage::Meet,
                StagePatch::status(StageStatus::Active).status_text("Extracting"),
            )
            .unwrap();

        let record = controller.record(Stage::Meet);
        assert_eq!(record.status, StageStatus::Active);
        assert!(record.start_time.is_some());
        assert!(record.end_time.is_none());
        assert_eq!(record.metrics.status_text.as_deref(), Some("Extracting"));
        assert_eq!(controller.active_stage(), Some(Stage::Meet));

        controller
            .set_stage(Stage::Meet, StagePatch::status(StageStatus::Complete).primary("5 requirements"))
            .unwrap();
        let record = controller.record(Stage::Meet);
        assert!(record.end_time.is_some());
        assert_eq!(record.metrics.primary.as_deref(), Some("5 requirements"));
        // Untouched metric survives the merge.
        assert_eq!(record.metrics.status_text.as_deref(), Some("Extracting"));
        assert_eq!(controller.active_stage(), None);
    }

    #[test]
    fn two_active_stages_are_rejected_without_state_change() {
        let (controller, _, _) = controller();
        controller
            .set_stage(Stage::Build, StagePatch::status(StageStatus::Active))
            .unwrap();

        let err = controller
            .set_stage(Stage::Verify, StagePatch::status(StageStatus::Active))
            .unwrap_err();
        assert_eq!(
            err,
            StageError::MultipleActive {
                first: Stage::Build,
                second: Stage::Verify
            }
        );
        assert_eq!(controller.status(Stage::Verify), StageStatus::Idle);
        assert_eq!(controller.active_stage(), Some(Stage::Build));
    }

    #[test]
    fn advance_stage_completes_from_and_activates_to() {
        let (controller, _, bus) = controller();
        let mut rx = bus.subscribe();
        controller.advance_stage(None, Stage::Meet).unwrap();
        controller.advance_stage(Some(Stage::Meet), Stage::Analyze).unwrap();

        assert_eq!(controller.status(Stage::Meet), StageStatus::Complete);
        assert_eq!(controller.status(Stage::Analyze), StageStatus::Active);
        assert_eq!(controller.active_stage(), Some(Stage::Analyze));

        let transitions: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, UiEvent::StageTransition { .. }))
            .collect();
        assert_eq!(
            transitions.last(),
            Some(&UiEvent::StageTransition {
                from: Some(Stage::Meet),
                to: Stage::Analyze
            })
        );
    }

    #[test]
    fn every_update_renders_committed_state() {
        let (controller, view, _) = controller();
        controller
            .set_stage(Stage::Meet, StagePatch::status(StageStatus::Active))
            .unwrap();
        controller
            .set_stage(Stage::Meet, StagePatch::status(StageStatus::Complete))
            .unwrap();
        controller
            .set_stage(Stage::Analyze, StagePatch::status(StageStatus::Waiting))
            .unwrap();

        let renders = view.renders.lock().unwrap();
        assert_eq!(renders.len(), 3);
        let last = renders.last().unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(last[0].record.status, StageStatus::Complete);
        assert_eq!(last[1].record.status, StageStatus::Waiting);
    }

    #[test]
    fn opening_idle_stage_is_rejected_with_advisory() {
        let (controller, _, bus) = controller();
        let mut rx = bus.subscribe();

        let err = controller.open_detail(Stage::Verify).unwrap_err();
        assert_eq!(err, StageError::NothingToShow(Stage::Verify));
        assert_eq!(controller.detail_view(), DetailView::None);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            UiEvent::Advisory {
                level: AdvisoryLevel::Info,
                ..
            }
        )));
    }

    #[test]
    fn opening_another_detail_closes_the_previous_one() {
        let (controller, view, bus) = controller();
        controller
            .set_stage(Stage::Analyze, StagePatch::status(StageStatus::Waiting))
            .unwrap();
        let mut rx = bus.subscribe();

        controller.open_detail(Stage::Meet).unwrap();
        controller.open_detail(Stage::Analyze).unwrap();

        assert_eq!(controller.detail_view(), DetailView::Viewing(Stage::Analyze));
        let detail_events: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    UiEvent::DetailOpened { .. } | UiEvent::DetailClosed { .. }
                )
            })
            .collect();
        assert_eq!(
            detail_events,
            vec![
                UiEvent::DetailOpened { stage: Stage::Meet },
                UiEvent::DetailClosed { stage: Stage::Meet },
                UiEvent::DetailOpened {
                    stage: Stage::Analyze
                },
            ]
        );
        assert_eq!(view.details.lock().unwrap().last(), Some(&Stage::Analyze));
        let cards = controller.cards();
        assert!(cards[1].detail_open);
        assert!(!cards[0].detail_open);
    }

    #[test]
    fn closing_is_idempotent() {
        let (controller, _, _) = controller();
        assert!(!controller.close_detail().unwrap());
        controller.open_detail(Stage::Meet).unwrap();
        assert!(controller.cancel().unwrap());
        assert!(!controller.cancel().unwrap());
        assert_eq!(controller.detail_view(), DetailView::None);
    }

    #[test]
    fn header_follows_active_then_furthest_reached_stage() {
        let (controller, _, _) = controller();
        assert_eq!(controller.header_stage(), Stage::Meet);
        controller
            .update_loop_state(
                LoopPatch::new()
                    .stage(Stage::Meet, StagePatch::status(StageStatus::Complete))
                    .stage(Stage::Analyze, StagePatch::status(StageStatus::Complete))
                    .stage(Stage::Build, StagePatch::status(StageStatus::Waiting)),
            )
            .unwrap();
        assert_eq!(controller.header_stage(), Stage::Build);
        controller
            .set_stage(Stage::Analyze, StagePatch::status(StageStatus::Active))
            .unwrap();
        assert_eq!(controller.header_stage(), Stage::Analyze);
    }

    #[test]
    fn meeting_metadata_is_patched() {
        let (controller, _, _) = controller();
        controller
            .update_loop_state(LoopPatch::new().meeting_iteration(2).meeting_name("Retro"))
            .unwrap();
        let meeting = state::meeting(controller.store()).unwrap();
        assert_eq!(meeting.iteration, 2);
        assert_eq!(meeting.name, "Retro");
    }

    #[test]
    fn actions_are_attached_to_cards() {
        let (controller, _, _) = controller();
        controller.actions().register(Stage::Meet, |record| {
            if record.status == StageStatus::Waiting {
                vec![StageAction::StartMeeting]
            } else {
                vec![]
            }
        });
        assert_eq!(controller.cards()[0].actions, vec![StageAction::StartMeeting]);
    }
}
