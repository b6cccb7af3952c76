//! Process-wide event bus and the per-stage action registry.
//!
//! Orchestration code never calls into rendering directly. It publishes
//! [`UiEvent`]s on the bus, and whatever view is attached (terminal, tests)
//! subscribes. Flow modules register "which actions does this stage offer"
//! functions in [`StageActions`] so the stage controller can render action
//! affordances without depending on the flows.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{IssueRecord, Lane, PhaseStatus, QaStatus, RowStatus, Stage, StageRecord};

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Which half of a verify run an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaPhase {
    Deploy,
    Validate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UiEvent {
    StagesRendered {
        active: Option<Stage>,
    },
    StageTransition {
        from: Option<Stage>,
        to: Stage,
    },
    DetailOpened {
        stage: Stage,
    },
    DetailClosed {
        stage: Stage,
    },
    /// User-visible notice (toast).
    Advisory {
        level: AdvisoryLevel,
        message: String,
    },
    Log {
        source: String,
        message: String,
    },

    // Build
    GapRowUpdated {
        gap_id: u32,
        status: RowStatus,
        note: Option<String>,
    },
    IssueCreated {
        issue: IssueRecord,
    },
    DispatchProgress {
        completed: usize,
        total: usize,
    },
    LaneSettled {
        lane: Lane,
        error: Option<String>,
    },

    // Verify
    QaPhaseChanged {
        phase: QaPhase,
        status: PhaseStatus,
    },
    QaRowUpdated {
        index: usize,
        status: QaStatus,
        evidence: Option<String>,
    },
}

impl UiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StagesRendered { .. } => "stages-rendered",
            Self::StageTransition { .. } => "stage-transition",
            Self::DetailOpened { .. } => "detail-opened",
            Self::DetailClosed { .. } => "detail-closed",
            Self::Advisory { .. } => "advisory",
            Self::Log { .. } => "log",
            Self::GapRowUpdated { .. } => "gap-row-updated",
            Self::IssueCreated { .. } => "issue-created",
            Self::DispatchProgress { .. } => "dispatch-progress",
            Self::LaneSettled { .. } => "lane-settled",
            Self::QaPhaseChanged { .. } => "qa-phase-changed",
            Self::QaRowUpdated { .. } => "qa-row-updated",
        }
    }
}

/// Cloneable publisher handle. Every clone publishes to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: UiEvent) {
        debug!(event = event.name(), "bus");
        let _ = self.tx.send(event);
    }

    pub fn advise(&self, level: AdvisoryLevel, message: impl Into<String>) {
        self.emit(UiEvent::Advisory {
            level,
            message: message.into(),
        });
    }

    pub fn log(&self, source: impl Into<String>, message: impl Into<String>) {
        self.emit(UiEvent::Log {
            source: source.into(),
            message: message.into(),
        });
    }
}

/// One-click affordances a stage card can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    StartMeeting,
    AnalyzeGaps,
    DispatchSelected,
    DispatchRemaining,
    DeployAndValidate,
    ValidateOnly,
    FixAndRebuild,
}

impl StageAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartMeeting => "Analyze Meeting",
            Self::AnalyzeGaps => "Run Gap Analysis",
            Self::DispatchSelected => "Dispatch Selected",
            Self::DispatchRemaining => "Dispatch Remaining",
            Self::DeployAndValidate => "Re-deploy & Validate",
            Self::ValidateOnly => "Validate Only",
            Self::FixAndRebuild => "Fix & Rebuild",
        }
    }
}

pub type ActionFn = Arc<dyn Fn(&StageRecord) -> Vec<StageAction> + Send + Sync>;

/// Registry of action functions keyed by stage.
#[derive(Clone, Default)]
pub struct StageActions {
    inner: Arc<RwLock<HashMap<Stage, Vec<ActionFn>>>>,
}

impl StageActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, stage: Stage, compute: F)
    where
        F: Fn(&StageRecord) -> Vec<StageAction> + Send + Sync + 'static,
    {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.entry(stage).or_default().push(Arc::new(compute));
    }

    /// Actions offered by `stage` in its current state, in registration
    /// order without duplicates.
    pub fn actions_for(&self, stage: Stage, record: &StageRecord) -> Vec<StageAction> {
        let computes: Vec<ActionFn> = {
            let inner = self
                .inner
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.get(&stage).cloned().unwrap_or_default()
        };
        let mut actions = Vec::new();
        for compute in computes {
            for action in compute(record) {
                if !actions.contains(&action) {
                    actions.push(action);
                }
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageStatus;

    #[test]
    fn ui_event_serializes_with_type_and_data() {
        let event = UiEvent::GapRowUpdated {
            gap_id: 4,
            status: RowStatus::Assigning,
            note: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"GapRowUpdated\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"status\":\"assigning\""));
    }

    #[tokio::test]
    async fn emit_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.advise(AdvisoryLevel::Warning, "partial failure");

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name(), "advisory");
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.log("test", "nobody listening");
    }

    #[test]
    fn cloned_bus_reaches_the_same_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.clone().log("clone", "hello");
        assert!(matches!(
            rx.try_recv(),
            Ok(UiEvent::Log { source, .. }) if source == "clone"
        ));
    }

    #[test]
    fn actions_are_computed_per_stage_without_duplicates() {
        let actions = StageActions::new();
        actions.register(Stage::Build, |record| {
            if record.status == StageStatus::Waiting {
                vec![StageAction::DispatchSelected]
            } else {
                vec![]
            }
        });
        actions.register(Stage::Build, |_| {
            vec![StageAction::DispatchSelected, StageAction::DispatchRemaining]
        });

        let waiting = StageRecord {
            status: StageStatus::Waiting,
            ..Default::default()
        };
        assert_eq!(
            actions.actions_for(Stage::Build, &waiting),
            vec![StageAction::DispatchSelected, StageAction::DispatchRemaining]
        );
        assert!(actions.actions_for(Stage::Meet, &waiting).is_empty());
    }
}
