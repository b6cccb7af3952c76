//! Terminal rendering for the control panel, via `indicatif` and `console`.
//!
//! [`TerminalView`] draws one line per stage card. Everything else the user
//! sees (advisories, lane results, QA rows) arrives on the bus and is printed
//! by the task started with [`spawn_event_printer`].

use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::bus::{AdvisoryLevel, EventBus, QaPhase, UiEvent};
use crate::models::{PhaseStatus, QaStatus, Stage, StageStatus};
use crate::stage::{StageCard, StageView};
use crate::ui::icons::{
    CHECK, CROSS, IDLE, INFO, ISSUE, REVIEW, ROCKET, RUNNING, SPARKLE, WAITING, WARN,
};

/// Stage cards rendered as stacked spinner lines.
pub struct TerminalView {
    multi: MultiProgress,
    bars: Vec<(Stage, ProgressBar)>,
}

impl TerminalView {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let bars = Stage::ALL
            .iter()
            .map(|stage| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(style.clone());
                bar.set_prefix(format!("{:>7}", stage.title()));
                (*stage, bar)
            })
            .collect();
        Self { multi, bars }
    }

    /// Handle for printing above the stage lines.
    pub fn multi(&self) -> MultiProgress {
        self.multi.clone()
    }

    /// Leave the final card state on screen.
    pub fn finish(&self) {
        for (_, bar) in &self.bars {
            bar.disable_steady_tick();
            bar.abandon();
        }
    }
}

impl Default for TerminalView {
    fn default() -> Self {
        Self::new()
    }
}

impl StageView for TerminalView {
    fn render_stages(&self, cards: &[StageCard]) {
        for card in cards {
            let Some((_, bar)) = self.bars.iter().find(|(stage, _)| *stage == card.stage) else {
                continue;
            };
            bar.set_message(format_card(card));
            if card.record.status == StageStatus::Active {
                bar.enable_steady_tick(Duration::from_millis(100));
            } else {
                bar.disable_steady_tick();
                bar.tick();
            }
        }
    }

    fn render_detail(&self, card: &StageCard) {
        for line in detail_lines(card) {
            print_line(&self.multi, line);
        }
    }
}

fn print_line(multi: &MultiProgress, line: impl AsRef<str>) {
    if multi.println(line.as_ref()).is_err() {
        eprintln!("{}", line.as_ref());
    }
}

fn status_icon(status: StageStatus) -> String {
    match status {
        StageStatus::Idle => IDLE.to_string(),
        StageStatus::Waiting => WAITING.to_string(),
        StageStatus::Active => RUNNING.to_string(),
        StageStatus::Complete => CHECK.to_string(),
        StageStatus::Error => CROSS.to_string(),
    }
}

/// One-line summary of a stage card.
pub fn format_card(card: &StageCard) -> String {
    let status = card.record.status;
    let label = match status {
        StageStatus::Idle => style(status.as_str()).dim(),
        StageStatus::Waiting => style(status.as_str()).yellow(),
        StageStatus::Active => style(status.as_str()).cyan().bold(),
        StageStatus::Complete => style(status.as_str()).green(),
        StageStatus::Error => style(status.as_str()).red().bold(),
    };

    let metrics = &card.record.metrics;
    let mut line = format!("{}{}", status_icon(status), label);
    if let Some(primary) = &metrics.primary {
        line.push_str(&format!("  {}", primary));
    }
    if let Some(secondary) = &metrics.secondary {
        line.push_str(&format!(" · {}", style(secondary).dim()));
    }
    if let Some(text) = &metrics.status_text {
        line.push_str(&format!("  {}", style(text).italic()));
    }
    if !card.actions.is_empty() {
        let labels: Vec<&str> = card.actions.iter().map(|a| a.label()).collect();
        line.push_str(&format!("  [{}]", labels.join(" | ")));
    }
    line
}

/// Lines shown when a stage is opened in the detail surface.
pub fn detail_lines(card: &StageCard) -> Vec<String> {
    let record = &card.record;
    let mut lines = vec![format!(
        "{}{} ({})",
        REVIEW,
        style(card.stage.title()).bold(),
        record.status
    )];
    if let Some(start) = record.start_time {
        lines.push(format!("  started  {}", start.format("%H:%M:%S")));
    }
    if let Some(end) = record.end_time {
        lines.push(format!("  finished {}", end.format("%H:%M:%S")));
        if let Some(start) = record.start_time {
            let secs = (end - start).num_seconds().max(0);
            lines.push(format!("  took     {}s", secs));
        }
    }
    for text in [
        &record.metrics.primary,
        &record.metrics.secondary,
        &record.metrics.status_text,
    ]
    .into_iter()
    .flatten()
    {
        lines.push(format!("  {}", text));
    }
    lines
}

fn phase_label(phase: QaPhase) -> &'static str {
    match phase {
        QaPhase::Deploy => "Deploy",
        QaPhase::Validate => "Validation",
    }
}

/// Text printed for a bus event, or `None` if the event is silent.
pub fn format_event(event: &UiEvent, verbose: bool) -> Option<String> {
    match event {
        UiEvent::Advisory { level, message } => Some(match level {
            AdvisoryLevel::Info => format!("{}{}", INFO, message),
            AdvisoryLevel::Success => format!("{}{}", SPARKLE, style(message).green()),
            AdvisoryLevel::Warning => format!("{}{}", WARN, style(message).yellow()),
            AdvisoryLevel::Error => format!("{}{}", CROSS, style(message).red().bold()),
        }),
        UiEvent::Log { source, message } if verbose => Some(format!(
            "  {} {}",
            style(format!("[{}]", source)).dim(),
            message
        )),
        UiEvent::StageTransition { to, .. } => {
            Some(format!("{}{}", RUNNING, style(to.title()).cyan().bold()))
        }
        UiEvent::IssueCreated { issue } => Some(format!(
            "  {}#{} {}",
            ISSUE,
            issue.number,
            style(&issue.title).dim()
        )),
        UiEvent::GapRowUpdated {
            gap_id,
            status,
            note,
        } if verbose => Some(format!(
            "  gap {} {}{}",
            gap_id,
            status,
            note.as_deref()
                .map(|n| format!(" ({})", n))
                .unwrap_or_default()
        )),
        UiEvent::LaneSettled { lane, error } => Some(match error {
            None => format!("  {}{} lane finished", CHECK, lane),
            Some(err) => format!("  {}{} lane failed: {}", CROSS, lane, style(err).red()),
        }),
        UiEvent::QaPhaseChanged { phase, status } => match status {
            PhaseStatus::Idle => None,
            PhaseStatus::Running => Some(format!("{}{} running", ROCKET, phase_label(*phase))),
            PhaseStatus::Succeeded => Some(format!("  {}{} succeeded", CHECK, phase_label(*phase))),
            PhaseStatus::Failed => Some(format!("  {}{} failed", CROSS, phase_label(*phase))),
        },
        UiEvent::QaRowUpdated {
            index,
            status,
            evidence,
        } => {
            let icon = match status {
                QaStatus::Passed => &CHECK,
                QaStatus::Failed => &CROSS,
                QaStatus::Pending | QaStatus::Validating => return None,
            };
            Some(format!(
                "  {}requirement {}{}",
                icon,
                index + 1,
                evidence
                    .as_deref()
                    .map(|e| format!(": {}", style(e).dim()))
                    .unwrap_or_default()
            ))
        }
        _ => None,
    }
}

/// Print bus events above the stage lines until the bus closes.
pub fn spawn_event_printer(bus: &EventBus, multi: MultiProgress, verbose: bool) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let mut dispatch_bar: Option<ProgressBar> = None;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event printer lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if let UiEvent::DispatchProgress { completed, total } = event {
                let bar = dispatch_bar.get_or_insert_with(|| {
                    let bar = multi.add(ProgressBar::new(total as u64));
                    bar.set_style(
                        ProgressStyle::default_bar()
                            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len}")
                            .expect("progress bar template is a valid static string")
                            .progress_chars("█▓▒░"),
                    );
                    bar.set_prefix("Dispatch");
                    bar
                });
                bar.set_length(total as u64);
                bar.set_position(completed as u64);
                if total > 0 && completed >= total {
                    bar.finish_and_clear();
                    dispatch_bar = None;
                }
                continue;
            }

            if let Some(line) = format_event(&event, verbose) {
                print_line(&multi, line);
            }
        }
    })
}
