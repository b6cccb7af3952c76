//! Verify stage: deploy the dispatched work, validate every requirement
//! against the deployment, and turn failures back into gap items.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tracing::{debug, info};

use crate::api::{Endpoint, PipelineApi};
use crate::bus::{AdvisoryLevel, QaPhase, UiEvent};
use crate::errors::VerifyError;
use crate::gaps::GapLedger;
use crate::models::{
    Complexity, GapItem, GapSource, PhaseStatus, QaStatus, Stage, StageStatus, ValidationResult,
};
use crate::stage::{LoopPatch, StageController, StagePatch};
use crate::state;
use crate::stream::events::{DeployEvent, ValidateEvent};

use super::matching::match_requirement;

/// One requirement's row in the QA table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QaRow {
    pub requirement: String,
    pub status: QaStatus,
    pub evidence: Option<String>,
    pub result: Option<ValidationResult>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QaState {
    pub deploy: PhaseStatus,
    pub validate: PhaseStatus,
    /// URL of the last successful deployment.
    pub deployed_url: Option<String>,
    pub rows: Vec<QaRow>,
    running: bool,
}

impl QaState {
    pub fn has_failures(&self) -> bool {
        self.rows
            .iter()
            .any(|row| row.result.as_ref().is_some_and(|r| !r.passed))
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QaSummary {
    pub url: String,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ValidationResult>,
}

#[derive(Clone)]
pub struct VerifyEngine {
    api: Arc<dyn PipelineApi>,
    stages: StageController,
    ledger: GapLedger,
    qa: Arc<Mutex<QaState>>,
    synthetic_id_base: u32,
    match_len: usize,
}

impl VerifyEngine {
    pub fn new(
        api: Arc<dyn PipelineApi>,
        stages: StageController,
        ledger: GapLedger,
        synthetic_id_base: u32,
        match_len: usize,
    ) -> Self {
        Self {
            api,
            stages,
            ledger,
            qa: Arc::new(Mutex::new(QaState::default())),
            synthetic_id_base,
            match_len,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QaState> {
        self.qa.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn qa(&self) -> QaState {
        self.lock().clone()
    }

    pub fn deployed_url(&self) -> Option<String> {
        self.lock().deployed_url.clone()
    }

    /// Results of the current run that matched a requirement row.
    pub fn results(&self) -> Vec<ValidationResult> {
        self.lock()
            .rows
            .iter()
            .filter_map(|row| row.result.clone())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.lock().has_failures()
    }

    /// Shared handle to the QA state, for observers that must not keep the
    /// whole engine alive.
    pub(crate) fn shared_state(&self) -> Arc<Mutex<QaState>> {
        Arc::clone(&self.qa)
    }

    /// Drop all validation results, keeping the deployment.
    pub fn clear_results(&self) {
        let mut qa = self.lock();
        qa.validate = PhaseStatus::Idle;
        for row in qa.rows.iter_mut() {
            *row = QaRow {
                requirement: std::mem::take(&mut row.requirement),
                ..Default::default()
            };
        }
    }

    /// Forget everything, as for a new meeting.
    pub fn reset(&self) {
        *self.lock() = QaState::default();
    }

    /// Deploy, then validate against the new deployment.
    pub async fn launch_qa_workflow(&self) -> Result<QaSummary, VerifyError> {
        self.begin_run(true)?;
        let outcome = self.deploy_then_validate().await;
        self.finish_run(outcome)
    }

    /// Same as [`launch_qa_workflow`](Self::launch_qa_workflow), after
    /// explicitly discarding the previous run's results.
    pub async fn redeploy_and_validate(&self) -> Result<QaSummary, VerifyError> {
        self.clear_results();
        self.launch_qa_workflow().await
    }

    /// Validate against the last successful deployment without redeploying.
    pub async fn run_validate_only(&self) -> Result<QaSummary, VerifyError> {
        let Some(url) = self.deployed_url() else {
            self.stages.bus().advise(
                AdvisoryLevel::Warning,
                "Nothing deployed yet; deploy before validating",
            );
            return Err(VerifyError::NoDeployment);
        };
        self.begin_run(false)?;
        if let Err(err) = self
            .stages
            .set_stage(Stage::Verify, StagePatch::default().status_text("Validating"))
        {
            return self.finish_run(Err(err.into()));
        }
        let outcome = self.run_validation(&url).await.map(|_| url);
        self.finish_run(outcome)
    }

    async fn deploy_then_validate(&self) -> Result<String, VerifyError> {
        let url = self.run_deploy().await?;
        self.stages
            .bus()
            .log("verify", format!("Deployed to {}; starting validation", url));
        self.stages
            .set_stage(Stage::Verify, StagePatch::default().status_text("Validating"))?;
        self.run_validation(&url).await?;
        Ok(url)
    }

    /// Stream `/api/deploy`; succeeds only if the server reports a URL.
    pub async fn run_deploy(&self) -> Result<String, VerifyError> {
        self.set_phase(QaPhase::Deploy, PhaseStatus::Running);
        let store = self.stages.store();
        let body = json!({
            "requirements": state::requirements(store),
            "createdIssues": state::created_issues(store),
            "iteration": state::meeting(store).map(|m| m.iteration).unwrap_or(1),
        });

        let mut url = None;
        let streamed = super::consume::<DeployEvent, _>(
            self.api.as_ref(),
            Endpoint::Deploy,
            body,
            self.stages.bus(),
            |event| {
                if let DeployEvent::Complete { url: reported } = event {
                    url = reported.filter(|u| !u.trim().is_empty());
                }
            },
        )
        .await;

        let outcome = match streamed {
            Err(err) => Err(VerifyError::Deploy(err)),
            Ok(()) => url.ok_or(VerifyError::NoDeployUrl),
        };
        match &outcome {
            Ok(url) => {
                self.lock().deployed_url = Some(url.clone());
                self.set_phase(QaPhase::Deploy, PhaseStatus::Succeeded);
                info!(%url, "Deployed");
            }
            Err(_) => self.set_phase(QaPhase::Deploy, PhaseStatus::Failed),
        }
        outcome
    }

    /// Stream `/api/validate` against `url` and fill in the QA rows.
    pub async fn run_validation(&self, url: &str) -> Result<Vec<ValidationResult>, VerifyError> {
        self.set_phase(QaPhase::Validate, PhaseStatus::Running);
        let requirements: Vec<String> = self
            .lock()
            .rows
            .iter()
            .map(|row| row.requirement.clone())
            .collect();

        let streamed = super::consume::<ValidateEvent, _>(
            self.api.as_ref(),
            Endpoint::Validate,
            json!({ "url": url, "requirements": requirements }),
            self.stages.bus(),
            |event| match event {
                ValidateEvent::ValidationStart {} => self.mark_validating(),
                ValidateEvent::Result(result) => self.record_result(&requirements, result),
                ValidateEvent::Log { .. } | ValidateEvent::Complete {} | ValidateEvent::Error { .. } => {}
            },
        )
        .await;

        match streamed {
            Ok(()) => {
                self.set_phase(QaPhase::Validate, PhaseStatus::Succeeded);
                Ok(self.results())
            }
            Err(err) => {
                self.set_phase(QaPhase::Validate, PhaseStatus::Failed);
                Err(VerifyError::Validation(err))
            }
        }
    }

    /// One synthetic gap item per failed validation, with ids counting up
    /// from the configured base.
    pub fn failed_validation_gaps(&self) -> Vec<GapItem> {
        let qa = self.lock();
        qa.rows
            .iter()
            .filter_map(|row| row.result.as_ref().filter(|r| !r.passed).map(|r| (row, r)))
            .enumerate()
            .map(|(k, (row, result))| {
                let explanation = result.explanation().map(str::to_string);
                GapItem {
                    id: self.synthetic_id_base + k as u32,
                    requirement: row.requirement.clone(),
                    has_gap: true,
                    gap: explanation
                        .clone()
                        .unwrap_or_else(|| "Failed validation".to_string()),
                    current_state: "Failed validation".to_string(),
                    complexity: Complexity::Medium,
                    estimated_effort: String::new(),
                    details: result.details.clone().unwrap_or_default(),
                    selected: true,
                    source: GapSource::Verify,
                }
            })
            .collect()
    }

    /// Queue failed validations for another Build pass. Returns the ids that
    /// were added to the gap collection.
    pub fn fix_and_rebuild(&self) -> Result<Vec<u32>, VerifyError> {
        let bus = self.stages.bus();
        if self.lock().running {
            bus.advise(AdvisoryLevel::Warning, "Wait for the current verify run to finish");
            return Err(VerifyError::AlreadyRunning);
        }
        let gaps = self.failed_validation_gaps();
        if gaps.is_empty() {
            bus.advise(AdvisoryLevel::Info, "Every requirement passed; nothing to fix");
            return Ok(Vec::new());
        }

        let added = self.ledger.merge_verify(gaps);
        let iteration = state::meeting(self.stages.store())
            .map(|m| m.iteration)
            .unwrap_or(1)
            + 1;
        self.stages.update_loop_state(
            LoopPatch::new()
                .stage(
                    Stage::Build,
                    StagePatch::status(StageStatus::Waiting)
                        .primary(format!("{} to fix", added.len()))
                        .status_text("Waiting to redispatch"),
                )
                .meeting_iteration(iteration),
        )?;

        info!(added = added.len(), iteration, "Queued failed validations for rebuild");
        bus.advise(
            AdvisoryLevel::Info,
            format!("{} failed requirements queued for another build pass", added.len()),
        );
        Ok(added)
    }

    fn begin_run(&self, redeploy: bool) -> Result<(), VerifyError> {
        let requirements = state::requirements(self.stages.store());
        {
            let mut qa = self.lock();
            if qa.running {
                drop(qa);
                self.stages
                    .bus()
                    .advise(AdvisoryLevel::Warning, "A verify run is already in progress");
                return Err(VerifyError::AlreadyRunning);
            }
            qa.running = true;
            qa.validate = PhaseStatus::Idle;
            if redeploy {
                qa.deploy = PhaseStatus::Idle;
            }
            qa.rows = requirements
                .into_iter()
                .map(|requirement| QaRow {
                    requirement,
                    ..Default::default()
                })
                .collect();
        }

        let status_text = if redeploy { "Deploying" } else { "Validating" };
        if let Err(err) = self.stages.set_stage(
            Stage::Verify,
            StagePatch::status(StageStatus::Active).status_text(status_text),
        ) {
            self.lock().running = false;
            return Err(err.into());
        }
        Ok(())
    }

    fn finish_run(&self, outcome: Result<String, VerifyError>) -> Result<QaSummary, VerifyError> {
        let (rows, results) = {
            let mut qa = self.lock();
            qa.running = false;
            let results: Vec<ValidationResult> =
                qa.rows.iter().filter_map(|row| row.result.clone()).collect();
            (qa.rows.len(), results)
        };
        let bus = self.stages.bus();

        match outcome {
            Ok(url) => {
                let passed = results.iter().filter(|r| r.passed).count();
                let failed = results.len() - passed;
                let mut patch = StagePatch::status(StageStatus::Complete)
                    .primary(format!("{}/{} passed", passed, rows))
                    .status_text("Validation complete");
                if failed > 0 {
                    patch = patch.secondary(format!("{} failed", failed));
                }
                self.stages.set_stage(Stage::Verify, patch)?;
                if failed > 0 {
                    bus.advise(
                        AdvisoryLevel::Warning,
                        format!("{} requirements failed validation", failed),
                    );
                } else {
                    bus.advise(AdvisoryLevel::Success, "All requirements passed validation");
                }
                Ok(QaSummary {
                    url,
                    passed,
                    failed,
                    results,
                })
            }
            Err(err) => {
                self.stages.set_stage(
                    Stage::Verify,
                    StagePatch::status(StageStatus::Error).status_text(err.to_string()),
                )?;
                bus.advise(AdvisoryLevel::Error, err.to_string());
                Err(err)
            }
        }
    }

    fn set_phase(&self, phase: QaPhase, status: PhaseStatus) {
        {
            let mut qa = self.lock();
            match phase {
                QaPhase::Deploy => qa.deploy = status,
                QaPhase::Validate => qa.validate = status,
            }
        }
        self.stages
            .bus()
            .emit(UiEvent::QaPhaseChanged { phase, status });
    }

    fn mark_validating(&self) {
        let count = {
            let mut qa = self.lock();
            for row in qa.rows.iter_mut() {
                row.status = QaStatus::Validating;
            }
            qa.rows.len()
        };
        for index in 0..count {
            self.stages.bus().emit(UiEvent::QaRowUpdated {
                index,
                status: QaStatus::Validating,
                evidence: None,
            });
        }
    }

    fn record_result(&self, requirements: &[String], result: ValidationResult) {
        let Some(index) = match_requirement(requirements, &result.requirement, self.match_len) else {
            debug!(requirement = %result.requirement, "Dropping unmatched validation result");
            return;
        };
        let status = if result.passed {
            QaStatus::Passed
        } else {
            QaStatus::Failed
        };
        let evidence = result.explanation().map(str::to_string);
        {
            let mut qa = self.lock();
            if let Some(row) = qa.rows.get_mut(index) {
                row.status = status;
                row.evidence = evidence.clone();
                row.result = Some(result);
            }
        }
        self.stages.bus().emit(UiEvent::QaRowUpdated {
            index,
            status,
            evidence,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{Script, ScriptedApi, frame};
    use crate::bus::{EventBus, StageActions};
    use crate::gaps::gap;
    use crate::models::Lane;
    use crate::stage::NullView;
    use crate::state::{AppState, paths};

    const REQUIREMENTS: [&str; 5] = [
        "Users can log in with SSO",
        "Reports can be exported to CSV from the dashboard page",
        "Dashboard shows weekly totals",
        "Admins can invite users by email",
        "Audit log is searchable",
    ];

    struct Fixture {
        api: Arc<ScriptedApi>,
        engine: VerifyEngine,
        ledger: GapLedger,
        stages: StageController,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(ScriptedApi::new());
        let store = AppState::new("Planning").into_store();
        store.set(paths::REQUIREMENTS, json!(REQUIREMENTS)).unwrap();
        store
            .patch([
                ("stages.meet.status", json!("complete")),
                ("stages.analyze.status", json!("complete")),
                ("stages.build.status", json!("complete")),
                ("stages.verify.status", json!("waiting")),
            ])
            .unwrap();
        let stages = StageController::new(store, EventBus::new(), StageActions::new(), Arc::new(NullView));
        let ledger = GapLedger::new(Lane::Local);
        let engine = VerifyEngine::new(api.clone(), stages.clone(), ledger.clone(), 9000, 40);
        Fixture {
            api,
            engine,
            ledger,
            stages,
        }
    }

    fn result_frame(requirement: &str, passed: bool, evidence: Option<&str>) -> String {
        frame(
            "result",
            json!({"requirement": requirement, "passed": passed, "evidence": evidence}),
        )
    }

    fn deploy_ok(api: &ScriptedApi) {
        api.script(
            Endpoint::Deploy,
            Script::Frames(vec![
                frame("log", json!({"message": "building image"})),
                frame("complete", json!({"url": "https://preview.app"})),
            ]),
        );
    }

    fn two_failures(api: &ScriptedApi) {
        api.script(
            Endpoint::Validate,
            Script::Frames(vec![
                frame("validation-start", json!({})),
                // Out of order, one truncated and re-cased, one unknown.
                result_frame("Audit log is searchable", true, None),
                result_frame("reports can be exported to csv from the", false, Some("Export button missing")),
                result_frame("Users can log in with SSO", true, None),
                result_frame("Completely unrelated check", false, Some("ignored")),
                result_frame("Dashboard shows weekly totals", false, Some("Totals are daily")),
                result_frame("Admins can invite users by email", true, None),
                frame("complete", json!({})),
            ]),
        );
    }

    #[tokio::test]
    async fn test_qa_workflow_matches_results_and_drops_unmatched() {
        let fx = fixture();
        deploy_ok(&fx.api);
        two_failures(&fx.api);

        let summary = fx.engine.launch_qa_workflow().await.unwrap();
        assert_eq!(summary.url, "https://preview.app");
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.results.len(), 5);

        let qa = fx.engine.qa();
        assert_eq!(qa.deploy, PhaseStatus::Succeeded);
        assert_eq!(qa.validate, PhaseStatus::Succeeded);
        assert_eq!(qa.rows[1].status, QaStatus::Failed);
        assert_eq!(qa.rows[1].evidence.as_deref(), Some("Export button missing"));
        assert_eq!(qa.rows[4].status, QaStatus::Passed);
        assert!(!qa.rows.iter().any(|r| r.evidence.as_deref() == Some("ignored")));

        assert_eq!(
            fx.api.calls_to(Endpoint::Validate)[0]["url"],
            "https://preview.app"
        );
        let record = fx.stages.record(Stage::Verify);
        assert_eq!(record.status, StageStatus::Complete);
        assert_eq!(record.metrics.primary.as_deref(), Some("3/5 passed"));
    }

    #[tokio::test]
    async fn test_failed_validations_become_synthetic_gaps() {
        let fx = fixture();
        deploy_ok(&fx.api);
        two_failures(&fx.api);
        fx.engine.launch_qa_workflow().await.unwrap();

        let gaps = fx.engine.failed_validation_gaps();
        assert_eq!(gaps.len(), 2);
        for gap in &gaps {
            assert!(gap.has_gap);
            assert_eq!(gap.source, GapSource::Verify);
            assert!(gap.id >= 9000);
        }
        assert_eq!(gaps[0].requirement, REQUIREMENTS[1]);
        assert_eq!(gaps[0].gap, "Export button missing");
        assert_eq!(gaps[1].id, 9001);
    }

    #[tokio::test]
    async fn test_all_pass_yields_no_gaps() {
        let fx = fixture();
        deploy_ok(&fx.api);
        let frames = REQUIREMENTS
            .iter()
            .map(|r| result_frame(r, true, None))
            .collect();
        fx.api.script(Endpoint::Validate, Script::Frames(frames));

        let summary = fx.engine.launch_qa_workflow().await.unwrap();
        assert_eq!(summary.failed, 0);
        assert!(fx.engine.failed_validation_gaps().is_empty());
        assert!(!fx.engine.has_failures());
        assert_eq!(fx.engine.fix_and_rebuild().unwrap(), Vec::<u32>::new());
    }

    #[tokio::test]
    async fn test_deploy_failure_skips_validation() {
        let fx = fixture();
        fx.api.script(
            Endpoint::Deploy,
            Script::Frames(vec![frame("error", json!({"message": "image build failed"}))]),
        );

        let err = fx.engine.launch_qa_workflow().await.unwrap_err();
        assert!(matches!(err, VerifyError::Deploy(_)));
        assert!(err.to_string().contains("image build failed"));

        let qa = fx.engine.qa();
        assert_eq!(qa.deploy, PhaseStatus::Failed);
        assert_eq!(qa.validate, PhaseStatus::Idle);
        assert!(fx.api.calls_to(Endpoint::Validate).is_empty());
        assert_eq!(fx.stages.status(Stage::Verify), StageStatus::Error);
        assert_eq!(fx.stages.active_stage(), None);
    }

    #[tokio::test]
    async fn test_deploy_without_url_fails() {
        let fx = fixture();
        fx.api
            .script(Endpoint::Deploy, Script::Frames(vec![frame("complete", json!({}))]));
        assert!(matches!(
            fx.engine.launch_qa_workflow().await,
            Err(VerifyError::NoDeployUrl)
        ));
        assert_eq!(fx.engine.deployed_url(), None);
    }

    #[tokio::test]
    async fn test_validation_failure_marks_only_validate_phase() {
        let fx = fixture();
        deploy_ok(&fx.api);
        fx.api
            .script(Endpoint::Validate, Script::Reject("validator crashed".into()));

        let err = fx.engine.launch_qa_workflow().await.unwrap_err();
        assert!(matches!(err, VerifyError::Validation(_)));
        let qa = fx.engine.qa();
        assert_eq!(qa.deploy, PhaseStatus::Succeeded);
        assert_eq!(qa.validate, PhaseStatus::Failed);
        assert_eq!(fx.engine.deployed_url().as_deref(), Some("https://preview.app"));
    }

    #[tokio::test]
    async fn test_validate_only_requires_deployment() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.run_validate_only().await,
            Err(VerifyError::NoDeployment)
        ));
        assert!(fx.api.calls().is_empty());
        assert_eq!(fx.stages.status(Stage::Verify), StageStatus::Waiting);
    }

    #[tokio::test]
    async fn test_validate_only_reuses_deployment_and_clears_results() {
        let fx = fixture();
        deploy_ok(&fx.api);
        two_failures(&fx.api);
        fx.engine.launch_qa_workflow().await.unwrap();
        assert!(fx.engine.has_failures());

        let frames = REQUIREMENTS
            .iter()
            .map(|r| result_frame(r, true, None))
            .collect();
        fx.api.script(Endpoint::Validate, Script::Frames(frames));
        let summary = fx.engine.run_validate_only().await.unwrap();

        assert_eq!(summary.failed, 0);
        assert!(fx.engine.failed_validation_gaps().is_empty());
        assert_eq!(fx.api.calls_to(Endpoint::Deploy).len(), 1);
    }

    #[tokio::test]
    async fn test_redeploy_clears_previous_results_first() {
        let fx = fixture();
        deploy_ok(&fx.api);
        two_failures(&fx.api);
        fx.engine.launch_qa_workflow().await.unwrap();

        fx.api
            .script(Endpoint::Deploy, Script::Reject("registry unavailable".into()));
        assert!(fx.engine.redeploy_and_validate().await.is_err());
        assert!(fx.engine.results().is_empty());
        assert!(fx.engine.failed_validation_gaps().is_empty());
    }

    #[tokio::test]
    async fn test_fix_and_rebuild_requeues_failures() {
        let fx = fixture();
        fx.ledger.replace_analyze(vec![
            gap(1, REQUIREMENTS[0], true),
            gap(2, REQUIREMENTS[1], true),
            gap(3, REQUIREMENTS[2], true),
        ]);
        fx.ledger.mark_dispatched([1, 2, 3, 9000]);
        deploy_ok(&fx.api);
        two_failures(&fx.api);
        fx.engine.launch_qa_workflow().await.unwrap();

        let added = fx.engine.fix_and_rebuild().unwrap();
        assert_eq!(added, vec![9000, 9001]);
        assert!(!fx.ledger.is_dispatched(9000));
        let remaining: Vec<u32> = fx.ledger.remaining_undispatched().iter().map(|g| g.id).collect();
        assert_eq!(remaining, vec![9000, 9001]);

        let store = fx.stages.store();
        assert_eq!(state::stage_status(store, Stage::Build), StageStatus::Waiting);
        assert_eq!(state::meeting(store).unwrap().iteration, 2);
    }
}
