//! Owned gap collection and dispatch tracking.
//!
//! Gap items live here rather than in the [`Store`](crate::store::Store):
//! they carry per-row dispatch state and executor choices that only the
//! Build and Verify flows touch.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::models::{GapItem, GapSource, IssueRecord, Lane, RowStatus};

/// Dispatch-table row for one gap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapRow {
    pub status: RowStatus,
    pub note: Option<String>,
    pub issue: Option<IssueRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapCounts {
    pub total: usize,
    pub with_gap: usize,
    pub selected: usize,
    pub dispatched: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    gaps: Vec<GapItem>,
    executors: HashMap<u32, Lane>,
    rows: BTreeMap<u32, GapRow>,
    dispatched: BTreeSet<u32>,
}

impl Ledger {
    fn forget(&mut self, ids: &[u32]) {
        for id in ids {
            self.dispatched.remove(id);
            self.rows.remove(id);
            self.executors.remove(id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct GapLedger {
    inner: Arc<Mutex<Ledger>>,
    default_lane: Lane,
}

impl GapLedger {
    pub fn new(default_lane: Lane) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ledger::default())),
            default_lane,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn gaps(&self) -> Vec<GapItem> {
        self.lock().gaps.clone()
    }

    pub fn gap(&self, id: u32) -> Option<GapItem> {
        self.lock().gaps.iter().find(|g| g.id == id).cloned()
    }

    /// Replace the analyze-sourced items. Verify-sourced items are kept.
    ///
    /// Analyze ids follow requirement positions, which are fixed for a
    /// meeting, so dispatch membership, rows and executors carry over to a
    /// rerun and an already dispatched gap is not sent twice.
    pub fn replace_analyze(&self, gaps: Vec<GapItem>) {
        let mut ledger = self.lock();
        ledger.gaps.retain(|g| g.source != GapSource::Analyze);
        let analyzed = gaps.into_iter().map(|mut gap| {
            gap.source = GapSource::Analyze;
            gap
        });
        let verify = std::mem::take(&mut ledger.gaps);
        ledger.gaps = analyzed.chain(verify).collect();
    }

    /// Merge items synthesized from failed validations.
    ///
    /// Previous verify-sourced items are replaced. A requirement that still
    /// has an undispatched analyze gap is skipped, as are duplicate
    /// requirements. The accepted ids lose any dispatch membership and row
    /// state so they can be dispatched again. Ids of the replaced round are
    /// forgotten too. Returns the accepted ids.
    pub fn merge_verify(&self, items: Vec<GapItem>) -> Vec<u32> {
        let mut ledger = self.lock();
        let replaced: Vec<u32> = ledger
            .gaps
            .iter()
            .filter(|g| g.source == GapSource::Verify)
            .map(|g| g.id)
            .collect();
        ledger.forget(&replaced);
        ledger.gaps.retain(|g| g.source != GapSource::Verify);

        let pending: HashSet<String> = ledger
            .gaps
            .iter()
            .filter(|g| g.is_dispatchable() && !ledger.dispatched.contains(&g.id))
            .map(|g| g.requirement.clone())
            .collect();

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for mut item in items {
            if pending.contains(&item.requirement) {
                debug!(requirement = %item.requirement, "Skipping failed validation with pending gap");
                continue;
            }
            if !seen.insert(item.requirement.clone()) {
                continue;
            }
            item.source = GapSource::Verify;
            item.has_gap = true;
            accepted.push(item);
        }

        let ids: Vec<u32> = accepted.iter().map(|g| g.id).collect();
        ledger.forget(&ids);
        ledger.gaps.extend(accepted);
        ids
    }

    /// Returns `false` if `id` is unknown or not dispatchable.
    pub fn set_selected(&self, id: u32, selected: bool) -> bool {
        let mut ledger = self.lock();
        match ledger.gaps.iter_mut().find(|g| g.id == id) {
            Some(gap) if gap.is_dispatchable() => {
                gap.selected = selected;
                true
            }
            _ => false,
        }
    }

    pub fn select_all(&self, selected: bool) {
        let mut ledger = self.lock();
        for gap in ledger.gaps.iter_mut().filter(|g| g.is_dispatchable()) {
            gap.selected = selected;
        }
    }

    pub fn set_executor(&self, id: u32, lane: Lane) {
        self.lock().executors.insert(id, lane);
    }

    pub fn set_all_executors(&self, lane: Lane) {
        let mut ledger = self.lock();
        let ids: Vec<u32> = ledger.gaps.iter().map(|g| g.id).collect();
        for id in ids {
            ledger.executors.insert(id, lane);
        }
    }

    pub fn executor(&self, id: u32) -> Lane {
        self.lock()
            .executors
            .get(&id)
            .copied()
            .unwrap_or(self.default_lane)
    }

    /// Items that are selected and have a gap.
    pub fn selected_dispatchable(&self) -> Vec<GapItem> {
        self.lock()
            .gaps
            .iter()
            .filter(|g| g.selected && g.is_dispatchable())
            .cloned()
            .collect()
    }

    /// Items with a gap that have never been dispatched.
    pub fn remaining_undispatched(&self) -> Vec<GapItem> {
        let ledger = self.lock();
        ledger
            .gaps
            .iter()
            .filter(|g| g.is_dispatchable() && !ledger.dispatched.contains(&g.id))
            .cloned()
            .collect()
    }

    pub fn is_dispatched(&self, id: u32) -> bool {
        self.lock().dispatched.contains(&id)
    }

    pub fn dispatched_ids(&self) -> BTreeSet<u32> {
        self.lock().dispatched.clone()
    }

    pub fn mark_dispatched(&self, ids: impl IntoIterator<Item = u32>) {
        self.lock().dispatched.extend(ids);
    }

    pub fn row(&self, id: u32) -> GapRow {
        self.lock().rows.get(&id).cloned().unwrap_or_default()
    }

    pub fn rows(&self) -> BTreeMap<u32, GapRow> {
        self.lock().rows.clone()
    }

    pub fn set_row(&self, id: u32, status: RowStatus, note: Option<String>) {
        let mut ledger = self.lock();
        let row = ledger.rows.entry(id).or_default();
        row.status = status;
        if note.is_some() {
            row.note = note;
        }
    }

    pub fn attach_issue(&self, id: u32, issue: IssueRecord) {
        self.lock().rows.entry(id).or_default().issue = Some(issue);
    }

    pub fn counts(&self) -> GapCounts {
        let ledger = self.lock();
        GapCounts {
            total: ledger.gaps.len(),
            with_gap: ledger.gaps.iter().filter(|g| g.is_dispatchable()).count(),
            selected: ledger
                .gaps
                .iter()
                .filter(|g| g.selected && g.is_dispatchable())
                .count(),
            dispatched: ledger.dispatched.len(),
        }
    }

    /// Drop everything, as for a new meeting.
    pub fn reset(&self) {
        *self.lock() = Ledger::default();
    }
}

#[cfg(test)]
pub(crate) fn gap(id: u32, requirement: &str, has_gap: bool) -> GapItem {
    GapItem {
        id,
        requirement: requirement.to_string(),
        has_gap,
        gap: if has_gap { format!("{} is missing", requirement) } else { String::new() },
        current_state: String::new(),
        complexity: Default::default(),
        estimated_effort: String::new(),
        details: String::new(),
        selected: has_gap,
        source: GapSource::Analyze,
    }
}
