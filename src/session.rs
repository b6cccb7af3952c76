//! One control-panel session: the store, the bus, and every flow wired
//! together for a single meeting at a time.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::info;

use crate::api::{HttpApi, PipelineApi};
use crate::bus::{EventBus, StageAction, StageActions};
use crate::config::PanelConfig;
use crate::flow::verify::QaState;
use crate::flow::{AnalyzeFlow, DispatchEngine, MeetFlow, MeetRequest, VerifyEngine};
use crate::gaps::GapLedger;
use crate::models::{Stage, StageStatus};
use crate::stage::{StageController, StageView};
use crate::state::{self, AppState};
use crate::store::Store;

#[derive(Clone)]
pub struct Session {
    config: PanelConfig,
    stages: StageController,
    ledger: GapLedger,
    meet: MeetFlow,
    analyze: AnalyzeFlow,
    dispatch: DispatchEngine,
    verify: VerifyEngine,
}

impl Session {
    pub fn new(
        config: PanelConfig,
        api: Arc<dyn PipelineApi>,
        view: Arc<dyn StageView>,
        bus: EventBus,
        meeting_name: &str,
    ) -> Self {
        let store = AppState::new(meeting_name).into_store();
        let actions = StageActions::new();
        let stages = StageController::new(store, bus, actions.clone(), view);
        let ledger = GapLedger::new(config.default_executor());

        let meet = MeetFlow::new(api.clone(), stages.clone());
        let analyze = AnalyzeFlow::new(api.clone(), stages.clone(), ledger.clone());
        let dispatch = DispatchEngine::new(
            api.clone(),
            stages.clone(),
            ledger.clone(),
            config.toml.dispatch.title_match_len,
        );
        let verify = VerifyEngine::new(
            api,
            stages.clone(),
            ledger.clone(),
            config.toml.verify.synthetic_id_base,
            config.toml.verify.requirement_match_len,
        );

        register_actions(&actions, &ledger, verify.shared_state());

        Self {
            config,
            stages,
            ledger,
            meet,
            analyze,
            dispatch,
            verify,
        }
    }

    /// Session talking to the configured pipeline server.
    pub fn connect(
        config: PanelConfig,
        view: Arc<dyn StageView>,
        bus: EventBus,
        meeting_name: &str,
    ) -> Result<Self> {
        let api = HttpApi::from_config(config.server())?;
        info!(base_url = %api.base_url(), "Connecting to pipeline server");
        Ok(Self::new(config, Arc::new(api), view, bus, meeting_name))
    }

    /// Start over with a fresh meeting: all stages reset, Meet waiting.
    pub fn new_meeting(&self, name: &str) {
        self.stages
            .store()
            .reset(Some(AppState::new(name).to_json()));
        self.ledger.reset();
        self.verify.reset();
        info!(meeting = name, "Started new meeting");
        self.stages.render();
    }

    /// Run the flow behind a stage card's action.
    pub async fn perform(&self, action: StageAction) -> Result<()> {
        match action {
            StageAction::StartMeeting => {
                let name = state::meeting(self.store()).map(|m| m.name);
                self.meet
                    .run(&MeetRequest {
                        meeting_name: name,
                        transcript: None,
                    })
                    .await?;
            }
            StageAction::AnalyzeGaps => {
                self.analyze.run().await?;
            }
            StageAction::DispatchSelected => {
                self.dispatch.dispatch_selected().await?;
            }
            StageAction::DispatchRemaining => {
                self.dispatch.dispatch_remaining().await?;
            }
            StageAction::DeployAndValidate => {
                self.verify.redeploy_and_validate().await?;
            }
            StageAction::ValidateOnly => {
                self.verify.run_validate_only().await?;
            }
            StageAction::FixAndRebuild => {
                self.verify.fix_and_rebuild()?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        self.stages.store()
    }

    pub fn bus(&self) -> &EventBus {
        self.stages.bus()
    }

    pub fn stages(&self) -> &StageController {
        &self.stages
    }

    pub fn ledger(&self) -> &GapLedger {
        &self.ledger
    }

    pub fn meet(&self) -> &MeetFlow {
        &self.meet
    }

    pub fn analyze(&self) -> &AnalyzeFlow {
        &self.analyze
    }

    pub fn dispatch(&self) -> &DispatchEngine {
        &self.dispatch
    }

    pub fn verify(&self) -> &VerifyEngine {
        &self.verify
    }
}

fn register_actions(actions: &StageActions, ledger: &GapLedger, qa: Arc<Mutex<QaState>>) {
    actions.register(Stage::Meet, |record| match record.status {
        StageStatus::Waiting | StageStatus::Error => vec![StageAction::StartMeeting],
        _ => Vec::new(),
    });

    actions.register(Stage::Analyze, |record| match record.status {
        StageStatus::Waiting | StageStatus::Error => vec![StageAction::AnalyzeGaps],
        _ => Vec::new(),
    });

    let gaps = ledger.clone();
    actions.register(Stage::Build, move |record| match record.status {
        StageStatus::Waiting | StageStatus::Error => vec![StageAction::DispatchSelected],
        StageStatus::Complete if !gaps.remaining_undispatched().is_empty() => {
            vec![StageAction::DispatchRemaining]
        }
        _ => Vec::new(),
    });

    actions.register(Stage::Verify, move |record| {
        if !matches!(
            record.status,
            StageStatus::Waiting | StageStatus::Complete | StageStatus::Error
        ) {
            return Vec::new();
        }
        let qa = qa.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut offered = vec![StageAction::DeployAndValidate];
        if qa.deployed_url.is_some() {
            offered.push(StageAction::ValidateOnly);
        }
        if qa.has_failures() {
            offered.push(StageAction::FixAndRebuild);
        }
        offered
    });
}
