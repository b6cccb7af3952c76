//! Fuzzy correlation of server responses back to local rows.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::models::{GapItem, IssueRecord};

/// Lowercase and collapse runs of whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// First `len` characters of the normalized text.
pub fn normalized_prefix(text: &str, len: usize) -> String {
    normalize(text).chars().take(len).collect()
}

/// How an issue was tied to a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// The server echoed the gap id.
    Hint,
    /// The title contains the start of the requirement.
    Title,
    /// Nth issue of the response assigned to the Nth gap of the request.
    Position,
}

/// Matches created issues to the gaps of one create-issues request.
///
/// Each gap is claimed at most once. The positional fallback can disagree
/// with the server's own notion of which issue belongs to which gap, so it
/// is logged at warn level whenever it is used.
pub struct IssueMatcher<'a> {
    gaps: &'a [GapItem],
    title_len: usize,
    claimed: HashSet<u32>,
    seen: usize,
}

impl<'a> IssueMatcher<'a> {
    pub fn new(gaps: &'a [GapItem], title_len: usize) -> Self {
        Self {
            gaps,
            title_len,
            claimed: HashSet::new(),
            seen: 0,
        }
    }

    pub fn match_issue(&mut self, issue: &IssueRecord) -> Option<(u32, MatchStrategy)> {
        let ordinal = self.seen;
        self.seen += 1;

        if let Some(hint) = issue.gap_id
            && self.gaps.iter().any(|g| g.id == hint)
            && self.claimed.insert(hint)
        {
            return Some((hint, MatchStrategy::Hint));
        }

        let title = normalize(&issue.title);
        let by_title = self.gaps.iter().find(|g| {
            let prefix = normalized_prefix(&g.requirement, self.title_len);
            !prefix.is_empty() && !self.claimed.contains(&g.id) && title.contains(&prefix)
        });
        if let Some(gap) = by_title {
            self.claimed.insert(gap.id);
            debug!(issue = issue.number, gap = gap.id, "Matched issue by title");
            return Some((gap.id, MatchStrategy::Title));
        }

        if let Some(gap) = self.gaps.get(ordinal)
            && self.claimed.insert(gap.id)
        {
            warn!(
                issue = issue.number,
                gap = gap.id,
                "Matched issue to gap by position; no id hint or title match"
            );
            return Some((gap.id, MatchStrategy::Position));
        }

        warn!(issue = issue.number, title = %issue.title, "Created issue matches no gap");
        None
    }
}

/// Index of the row a validation result refers to: exact text first, then
/// overlap of the normalized first `len` characters in either direction.
pub fn match_requirement(rows: &[String], text: &str, len: usize) -> Option<usize> {
    if text.trim().is_empty() {
        return None;
    }
    if let Some(index) = rows.iter().position(|row| row == text) {
        return Some(index);
    }
    if len == 0 {
        return None;
    }
    let needle = normalized_prefix(text, len);
    let haystack = normalize(text);
    rows.iter().position(|row| {
        let prefix = normalized_prefix(row, len);
        !prefix.is_empty() && (normalize(row).contains(&needle) || haystack.contains(&prefix))
    })
}
