//! Analyze stage: check each requirement against the codebase.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::api::{Endpoint, PipelineApi};
use crate::bus::AdvisoryLevel;
use crate::errors::{FlowError, StageError};
use crate::gaps::GapLedger;
use crate::models::{GapItem, GapSource, Stage, StageStatus};
use crate::stage::{LoopPatch, StageController, StagePatch};
use crate::state;
use crate::stream::events::GapEvent;

#[derive(Clone)]
pub struct AnalyzeFlow {
    api: Arc<dyn PipelineApi>,
    stages: StageController,
    ledger: GapLedger,
}

impl AnalyzeFlow {
    pub fn new(api: Arc<dyn PipelineApi>, stages: StageController, ledger: GapLedger) -> Self {
        Self {
            api,
            stages,
            ledger,
        }
    }

    /// Stream `/api/analyze-gaps` over the recorded requirements and load the
    /// result into the ledger with every gap selected.
    pub async fn run(&self) -> Result<Vec<GapItem>, FlowError> {
        let bus = self.stages.bus();
        let requirements = state::requirements(self.stages.store());
        if requirements.is_empty() {
            bus.advise(
                AdvisoryLevel::Warning,
                "No requirements yet; analyze the meeting first",
            );
            return Err(FlowError::NoRequirements);
        }

        self.stages.advance_stage(None, Stage::Analyze)?;
        self.stages.set_stage(
            Stage::Analyze,
            StagePatch::default()
                .status_text(format!("Checking {} requirements", requirements.len())),
        )?;

        let mut streamed: Vec<GapItem> = Vec::new();
        let mut summary: Option<Vec<GapItem>> = None;
        let result = super::consume::<GapEvent, _>(
            self.api.as_ref(),
            Endpoint::AnalyzeGaps,
            json!({ "requirements": requirements }),
            bus,
            |event| match event {
                GapEvent::Gap(gap) => streamed.push(gap),
                GapEvent::Complete { gaps } => summary = gaps,
                GapEvent::Log { .. } | GapEvent::Error { .. } => {}
            },
        )
        .await;

        if let Err(err) = result {
            self.fail(&err.to_string())?;
            return Err(err.into());
        }

        let gaps = if streamed.is_empty() {
            summary.unwrap_or_default()
        } else {
            streamed
        };
        let gaps = normalize(gaps, &requirements);
        let with_gap = gaps.iter().filter(|g| g.is_dispatchable()).count();
        self.ledger.replace_analyze(gaps.clone());

        self.stages.update_loop_state(
            LoopPatch::new()
                .stage(
                    Stage::Analyze,
                    StagePatch::status(StageStatus::Complete)
                        .primary(format!("{} gaps", with_gap))
                        .secondary(format!("{} requirements checked", gaps.len()))
                        .status_text("Gap analysis complete"),
                )
                .stage(Stage::Build, StagePatch::status(StageStatus::Waiting)),
        )?;

        info!(gaps = with_gap, checked = gaps.len(), "Gap analysis complete");
        let level = if with_gap == 0 {
            AdvisoryLevel::Info
        } else {
            AdvisoryLevel::Success
        };
        bus.advise(level, format!("Found {} gaps", with_gap));
        Ok(gaps)
    }

    fn fail(&self, message: &str) -> Result<(), StageError> {
        self.stages.set_stage(
            Stage::Analyze,
            StagePatch::status(StageStatus::Error).status_text(message),
        )?;
        self.stages
            .bus()
            .advise(AdvisoryLevel::Error, format!("Gap analysis failed: {}", message));
        Ok(())
    }
}

/// Ids become the matching requirement's position plus one, so they stay
/// stable however the server orders its stream. An item naming no known
/// requirement keeps its stream position when that id is free, otherwise it
/// takes the next id past the requirement list. Items with a gap start
/// selected.
fn normalize(gaps: Vec<GapItem>, requirements: &[String]) -> Vec<GapItem> {
    let positions: HashMap<String, u32> = requirements
        .iter()
        .enumerate()
        .rev()
        .map(|(index, text)| (super::matching::normalize(text), index as u32 + 1))
        .collect();

    let mut claimed = HashSet::new();
    let mut placed = Vec::with_capacity(gaps.len());
    let mut unplaced = Vec::new();
    for (index, gap) in gaps.into_iter().enumerate() {
        match positions.get(&super::matching::normalize(&gap.requirement)) {
            Some(&id) if claimed.insert(id) => placed.push((id, gap)),
            _ => unplaced.push((index as u32 + 1, gap)),
        }
    }

    let mut next = requirements.len() as u32 + 1;
    for (stream_id, gap) in unplaced {
        let id = if claimed.insert(stream_id) {
            stream_id
        } else {
            while !claimed.insert(next) {
                next += 1;
            }
            next
        };
        warn!(requirement = %gap.requirement, id, "Gap does not match a requirement");
        placed.push((id, gap));
    }

    placed.sort_by_key(|(id, _)| *id);
    placed
        .into_iter()
        .map(|(id, mut gap)| {
            gap.id = id;
            gap.selected = gap.has_gap;
            gap.source = GapSource::Analyze;
            gap
        })
        .collect()
}
