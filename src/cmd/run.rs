//! Headless pipeline run: `meetloop run`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use tracing::info;

use meetloop::bus::EventBus;
use meetloop::config::PanelConfig;
use meetloop::flow::MeetRequest;
use meetloop::models::Lane;
use meetloop::session::Session;
use meetloop::ui::{TerminalView, spawn_event_printer};

pub struct RunArgs {
    pub meeting: String,
    pub transcript: Option<PathBuf>,
    pub executor: Option<Lane>,
    pub max_rounds: u32,
    pub skip_verify: bool,
}

/// Meet, analyze, dispatch every gap, then verify and feed failures back
/// into Build for up to `max_rounds` rounds.
pub async fn cmd_run(config: PanelConfig, args: RunArgs) -> Result<()> {
    let transcript = match &args.transcript {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read transcript: {}", path.display()))?,
        ),
        None => None,
    };

    let view = Arc::new(TerminalView::new());
    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus, view.multi(), config.verbose);
    let session = Session::connect(config, view.clone(), bus, &args.meeting)?;
    session.stages().render();

    let outcome = drive(&session, &args, transcript).await;

    view.finish();
    // Dropping the session closes the bus, which ends the printer.
    drop(session);
    let _ = printer.await;
    outcome
}

async fn drive(session: &Session, args: &RunArgs, transcript: Option<String>) -> Result<()> {
    let lane = args.executor.unwrap_or(session.config().default_executor());

    session
        .meet()
        .run(&MeetRequest {
            meeting_name: Some(args.meeting.clone()),
            transcript,
        })
        .await?;

    session.analyze().run().await?;
    if session.ledger().selected_dispatchable().is_empty() {
        println!("{}", style("No gaps found; nothing to build.").green());
        return Ok(());
    }

    session.ledger().select_all(true);
    session.ledger().set_all_executors(lane);
    session.dispatch().dispatch_selected().await?;

    if args.skip_verify {
        return Ok(());
    }

    let rounds = args.max_rounds.max(1);
    for round in 1..=rounds {
        info!(round, "Verify round");
        let summary = session.verify().launch_qa_workflow().await?;
        if summary.failed == 0 {
            println!(
                "{}",
                style(format!("All {} requirements passed on {}", summary.passed, summary.url))
                    .green()
                    .bold()
            );
            return Ok(());
        }
        if round == rounds {
            break;
        }

        let added = session.verify().fix_and_rebuild()?;
        if added.is_empty() {
            break;
        }
        session.ledger().select_all(false);
        for id in &added {
            session.ledger().set_selected(*id, true);
        }
        session.ledger().set_all_executors(lane);
        session.dispatch().dispatch_selected().await?;
    }

    let failed = session.verify().failed_validation_gaps().len();
    anyhow::bail!(
        "{} requirements still failing after {} rounds",
        failed,
        rounds
    )
}
