//! Build stage: the dispatch engine.
//!
//! A batch of gap items is partitioned by executor into up to three lanes
//! that run concurrently on the calling task:
//!
//! - **cloud**: create issues, then assign them to the coding agent;
//! - **local**: hand the items to the local agent directly;
//! - **developer**: create issues for a human developer.
//!
//! Lanes settle independently. A lane failure never escapes a dispatch call;
//! it only decides which items count as dispatched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::{Endpoint, PipelineApi};
use crate::bus::{AdvisoryLevel, UiEvent};
use crate::errors::{DispatchError, LaneError};
use crate::gaps::GapLedger;
use crate::models::{GapItem, IssueRecord, Lane, RowStatus, Stage, StageStatus};
use crate::stage::{LoopPatch, StageController, StagePatch};
use crate::state::{self, paths};
use crate::stream::events::{AssignEvent, IssueEvent, LocalEvent};

use super::matching::IssueMatcher;

/// How one lane settled.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneOutcome {
    pub lane: Lane,
    pub items: Vec<u32>,
    pub error: Option<String>,
}

impl LaneOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Ids added to the dispatch-tracking set by this call.
    pub dispatched: Vec<u32>,
    /// Ids left undispatched (failed row or failed lane).
    pub failed: Vec<u32>,
    pub lanes: Vec<LaneOutcome>,
}

/// Items of one dispatch call, partitioned by lane.
#[derive(Debug, Default)]
struct Batch {
    cloud: Vec<GapItem>,
    local: Vec<GapItem>,
    developer: Vec<GapItem>,
}

impl Batch {
    fn push(&mut self, lane: Lane, item: GapItem) {
        match lane {
            Lane::Cloud => self.cloud.push(item),
            Lane::Local => self.local.push(item),
            Lane::Developer => self.developer.push(item),
        }
    }

    fn len(&self) -> usize {
        self.cloud.len() + self.local.len() + self.developer.len()
    }
}

/// Per-call completion bookkeeping: each gap counts once, on its first
/// terminal outcome.
struct Progress {
    total: usize,
    finished: Mutex<HashSet<u32>>,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            total,
            finished: Mutex::new(HashSet::new()),
        }
    }

    /// Record a terminal outcome; returns the new completed count if this is
    /// the first one for `id`.
    fn finish(&self, id: u32) -> Option<usize> {
        let mut finished = self
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.insert(id).then(|| finished.len())
    }
}

#[derive(Clone)]
pub struct DispatchEngine {
    api: Arc<dyn PipelineApi>,
    stages: StageController,
    ledger: GapLedger,
    title_match_len: usize,
}

impl DispatchEngine {
    pub fn new(
        api: Arc<dyn PipelineApi>,
        stages: StageController,
        ledger: GapLedger,
        title_match_len: usize,
    ) -> Self {
        Self {
            api,
            stages,
            ledger,
            title_match_len,
        }
    }

    /// Dispatch every selected gap to its chosen executor.
    pub async fn dispatch_selected(&self) -> Result<DispatchReport, DispatchError> {
        let items = self.ledger.selected_dispatchable();
        if items.is_empty() {
            self.stages
                .bus()
                .advise(AdvisoryLevel::Warning, "Select at least one gap to dispatch");
            return Err(DispatchError::NothingSelected);
        }
        let mut batch = Batch::default();
        for item in items {
            let lane = self.ledger.executor(item.id);
            batch.push(lane, item);
        }
        self.run(batch).await
    }

    /// Dispatch every gap that has never been dispatched, through the cloud
    /// lane.
    pub async fn dispatch_remaining(&self) -> Result<DispatchReport, DispatchError> {
        let items = self.ledger.remaining_undispatched();
        if items.is_empty() {
            self.stages
                .bus()
                .advise(AdvisoryLevel::Info, "Every gap has already been dispatched");
            return Err(DispatchError::NothingRemaining);
        }
        let batch = Batch {
            cloud: items,
            ..Default::default()
        };
        self.run(batch).await
    }

    async fn run(&self, batch: Batch) -> Result<DispatchReport, DispatchError> {
        let store = self.stages.store();
        if state::dispatch_counters(store).in_progress {
            self.stages
                .bus()
                .advise(AdvisoryLevel::Warning, "A dispatch is already running");
            return Err(DispatchError::AlreadyInProgress);
        }

        let previous = self.stages.status(Stage::Build);
        let total = batch.len();
        self.stages.set_stage(
            Stage::Build,
            StagePatch::status(StageStatus::Active)
                .status_text(format!("Dispatching {} items", total)),
        )?;
        store
            .patch([
                (paths::DISPATCH_IN_PROGRESS, json!(true)),
                (paths::DISPATCH_TOTAL, json!(total)),
                (paths::DISPATCH_COMPLETED, json!(0)),
            ])
            .map_err(crate::errors::StageError::from)?;
        self.stages.bus().emit(UiEvent::DispatchProgress {
            completed: 0,
            total,
        });

        let result = self.execute(batch, previous).await;

        if let Err(err) = store.set(paths::DISPATCH_IN_PROGRESS, false) {
            warn!(error = %err, "Failed to clear dispatch flag");
        }
        result
    }

    async fn execute(
        &self,
        batch: Batch,
        previous: StageStatus,
    ) -> Result<DispatchReport, DispatchError> {
        let progress = Progress::new(batch.len());
        for item in batch.cloud.iter().chain(&batch.local).chain(&batch.developer) {
            self.ledger.set_row(item.id, RowStatus::Pending, None);
        }

        let (cloud, local, developer) = futures::join!(
            self.settle(Lane::Cloud, &batch.cloud, &progress),
            self.settle(Lane::Local, &batch.local, &progress),
            self.settle(Lane::Developer, &batch.developer, &progress),
        );
        let lanes: Vec<LaneOutcome> = [cloud, local, developer].into_iter().flatten().collect();

        let mut report = DispatchReport::default();
        for outcome in &lanes {
            for id in &outcome.items {
                let row = self.ledger.row(*id);
                match &outcome.error {
                    None if row.status == RowStatus::Failed => report.failed.push(*id),
                    None => {
                        if !row.status.is_terminal() {
                            self.update_row(&progress, *id, RowStatus::Dispatched, None);
                        }
                        report.dispatched.push(*id);
                    }
                    Some(error) => {
                        if !row.status.is_terminal() {
                            self.update_row(&progress, *id, RowStatus::Failed, Some(error.clone()));
                        }
                        report.failed.push(*id);
                    }
                }
            }
        }
        self.ledger.mark_dispatched(report.dispatched.iter().copied());
        report.lanes = lanes;

        let failures: Vec<(Lane, String)> = report
            .lanes
            .iter()
            .filter_map(|o| o.error.clone().map(|e| (o.lane, e)))
            .collect();
        let bus = self.stages.bus();

        if failures.len() == report.lanes.len() {
            let err = DispatchError::AllLanesFailed { failures };
            warn!(error = %err, "Dispatch failed");
            bus.advise(AdvisoryLevel::Error, err.to_string());
            self.stages.set_stage(
                Stage::Build,
                StagePatch::status(previous).status_text("Dispatch failed"),
            )?;
            return Err(err);
        }

        if !failures.is_empty() {
            let lanes: Vec<String> = failures
                .iter()
                .map(|(lane, msg)| format!("{} ({})", lane, msg))
                .collect();
            warn!(failed = failures.len(), "Partial dispatch failure");
            bus.advise(
                AdvisoryLevel::Warning,
                format!(
                    "Dispatched {} items; {} failed in lane(s): {}",
                    report.dispatched.len(),
                    report.failed.len(),
                    lanes.join(", ")
                ),
            );
        } else {
            bus.advise(
                AdvisoryLevel::Success,
                format!("Dispatched {} items", report.dispatched.len()),
            );
        }

        let mut build = StagePatch::status(StageStatus::Complete)
            .primary(format!("{} dispatched", report.dispatched.len()))
            .status_text("Dispatch complete");
        if !report.failed.is_empty() {
            build = build.secondary(format!("{} failed", report.failed.len()));
        }
        self.stages.update_loop_state(
            LoopPatch::new()
                .stage(Stage::Build, build)
                .stage(Stage::Verify, StagePatch::status(StageStatus::Waiting)),
        )?;

        info!(
            dispatched = report.dispatched.len(),
            failed = report.failed.len(),
            "Dispatch complete"
        );
        Ok(report)
    }

    /// Run one lane to completion. `None` when the lane has no items.
    async fn settle(&self, lane: Lane, items: &[GapItem], progress: &Progress) -> Option<LaneOutcome> {
        if items.is_empty() {
            return None;
        }
        let result = match lane {
            Lane::Cloud => self.run_cloud(items, progress).await,
            Lane::Local => self.run_local(items, progress).await,
            Lane::Developer => self.run_developer(items, progress).await,
        };
        let error = result.err().map(|e| e.to_string());
        match &error {
            None => info!(%lane, items = items.len(), "Lane settled"),
            Some(err) => warn!(%lane, error = %err, "Lane failed"),
        }
        self.stages.bus().emit(UiEvent::LaneSettled {
            lane,
            error: error.clone(),
        });
        Some(LaneOutcome {
            lane,
            items: items.iter().map(|g| g.id).collect(),
            error,
        })
    }

    async fn run_cloud(&self, items: &[GapItem], progress: &Progress) -> Result<(), LaneError> {
        let created = self
            .create_issues(Lane::Cloud, items, RowStatus::Assigning, progress)
            .await?;
        if created.is_empty() {
            return Err(LaneError::NoIssuesCreated(Lane::Cloud));
        }

        let by_number: HashMap<u64, u32> = created
            .iter()
            .map(|(gap_id, issue)| (issue.number, *gap_id))
            .collect();
        let numbers: Vec<u64> = created.iter().map(|(_, issue)| issue.number).collect();

        super::consume::<AssignEvent, _>(
            self.api.as_ref(),
            Endpoint::AssignCodingAgent,
            json!({ "issueNumbers": numbers }),
            self.stages.bus(),
            |event| {
                if let AssignEvent::Result {
                    issue_number,
                    success,
                    message,
                } = event
                {
                    match by_number.get(&issue_number) {
                        Some(gap_id) => {
                            let status = if success {
                                RowStatus::Assigned
                            } else {
                                RowStatus::Failed
                            };
                            self.update_row(progress, *gap_id, status, message);
                        }
                        None => debug!(issue_number, "Assignment result for unknown issue"),
                    }
                }
            },
        )
        .await
    }

    async fn run_local(&self, items: &[GapItem], progress: &Progress) -> Result<(), LaneError> {
        let ids: HashSet<u32> = items.iter().map(|g| g.id).collect();
        super::consume::<LocalEvent, _>(
            self.api.as_ref(),
            Endpoint::ExecuteLocalAgent,
            json!({ "gaps": items }),
            self.stages.bus(),
            |event| match event {
                LocalEvent::ItemStart { gap_id } if ids.contains(&gap_id) => {
                    self.update_row(progress, gap_id, RowStatus::Working, None);
                }
                LocalEvent::ItemProgress { gap_id, message } if ids.contains(&gap_id) => {
                    self.update_row(progress, gap_id, RowStatus::Working, Some(message));
                }
                LocalEvent::ItemComplete {
                    gap_id,
                    success,
                    summary,
                } if ids.contains(&gap_id) => {
                    let status = if success {
                        RowStatus::Implemented
                    } else {
                        RowStatus::Failed
                    };
                    self.update_row(progress, gap_id, status, summary);
                }
                LocalEvent::ItemStart { gap_id }
                | LocalEvent::ItemProgress { gap_id, .. }
                | LocalEvent::ItemComplete { gap_id, .. } => {
                    debug!(gap_id, "Local agent event for a gap outside this batch");
                }
                LocalEvent::Log { .. } | LocalEvent::Complete {} | LocalEvent::Error { .. } => {}
            },
        )
        .await
    }

    async fn run_developer(&self, items: &[GapItem], progress: &Progress) -> Result<(), LaneError> {
        let created = self
            .create_issues(Lane::Developer, items, RowStatus::Assigned, progress)
            .await?;
        if created.is_empty() {
            return Err(LaneError::NoIssuesCreated(Lane::Developer));
        }
        Ok(())
    }

    /// Stream `/api/create-issues` for `items` and move each matched gap's
    /// row to `status`. Returns the matched `(gap id, issue)` pairs.
    async fn create_issues(
        &self,
        lane: Lane,
        items: &[GapItem],
        status: RowStatus,
        progress: &Progress,
    ) -> Result<Vec<(u32, IssueRecord)>, LaneError> {
        let epic = state::epic_issue(self.stages.store());
        let mut matcher = IssueMatcher::new(items, self.title_match_len);
        let mut created = Vec::new();

        super::consume::<IssueEvent, _>(
            self.api.as_ref(),
            Endpoint::CreateIssues,
            json!({
                "gaps": items,
                "executor": lane,
                "epicIssueNumber": epic.map(|e| e.number),
            }),
            self.stages.bus(),
            |event| {
                let IssueEvent::Issue(issue) = event else {
                    return;
                };
                match matcher.match_issue(&issue) {
                    Some((gap_id, _)) => {
                        let issue = IssueRecord {
                            gap_id: Some(gap_id),
                            ..issue
                        };
                        self.record_issue(&issue);
                        self.ledger.attach_issue(gap_id, issue.clone());
                        self.update_row(progress, gap_id, status, Some(format!("#{}", issue.number)));
                        created.push((gap_id, issue));
                    }
                    None => self.record_issue(&issue),
                }
            },
        )
        .await?;

        Ok(created)
    }

    fn record_issue(&self, issue: &IssueRecord) {
        let store = self.stages.store();
        let mut issues = state::created_issues(store);
        issues.push(issue.clone());
        if let Err(err) = store.set(paths::CREATED_ISSUES, json!(issues)) {
            warn!(error = %err, "Failed to record created issue");
        }
        self.stages.bus().emit(UiEvent::IssueCreated {
            issue: issue.clone(),
        });
    }

    /// Update one row and, on its first terminal outcome, the completion
    /// counter.
    fn update_row(&self, progress: &Progress, id: u32, status: RowStatus, note: Option<String>) {
        self.ledger.set_row(id, status, note.clone());
        let bus = self.stages.bus();
        bus.emit(UiEvent::GapRowUpdated {
            gap_id: id,
            status,
            note,
        });

        if !status.is_terminal() {
            return;
        }
        let Some(completed) = progress.finish(id) else {
            return;
        };
        if let Err(err) = self.stages.store().set(paths::DISPATCH_COMPLETED, completed) {
            warn!(error = %err, "Failed to update dispatch progress");
        }
        bus.emit(UiEvent::DispatchProgress {
            completed,
            total: progress.total,
        });
        if let Err(err) = self.stages.set_stage(
            Stage::Build,
            StagePatch::default().status_text(format!("{}/{} complete", completed, progress.total)),
        ) {
            warn!(error = %err, "Failed to update Build progress");
        }
    }
}
