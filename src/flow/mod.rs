//! Orchestration flows for the four stages.
//!
//! Each flow owns one stage's entry points, drives the remote endpoint
//! through [`PipelineApi`], and reports progress through the
//! [`StageController`](crate::stage::StageController) and the bus.

pub mod analyze;
pub mod build;
pub mod matching;
pub mod meet;
pub mod verify;

pub use analyze::AnalyzeFlow;
pub use build::{DispatchEngine, DispatchReport, LaneOutcome};
pub use meet::{MeetFlow, MeetOutcome, MeetRequest};
pub use verify::{QaRow, QaSummary, VerifyEngine};

use serde_json::Value;

use crate::api::{Endpoint, PipelineApi};
use crate::bus::EventBus;
use crate::errors::LaneError;
use crate::stream::{EventStream, StreamEvent};

/// Run one streamed request to completion.
///
/// `log` events go to the activity log, an `error` event fails the call,
/// and every other event is handed to `on_event` in arrival order.
pub(crate) async fn consume<E, F>(
    api: &dyn PipelineApi,
    endpoint: Endpoint,
    body: Value,
    bus: &EventBus,
    mut on_event: F,
) -> Result<(), LaneError>
where
    E: StreamEvent,
    F: FnMut(E),
{
    let bytes = api.open_stream(endpoint, body).await?;
    let mut events = EventStream::<E>::new(bytes);
    while let Some(event) = events.next().await {
        let event = event?;
        if let Some(line) = event.log_line() {
            bus.log(endpoint.name(), line);
            continue;
        }
        if let Some(message) = event.failure() {
            return Err(LaneError::Remote(message.to_string()));
        }
        on_event(event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{Script, ScriptedApi, frame};
    use crate::bus::UiEvent;
    use crate::stream::events::DeployEvent;
    use serde_json::json;

    #[tokio::test]
    async fn test_consume_routes_logs_and_events() {
        let api = ScriptedApi::new();
        api.script(
            Endpoint::Deploy,
            Script::Frames(vec![
                frame("log", json!({"message": "building"})),
                frame("complete", json!({"url": "https://app"})),
            ]),
        );
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let mut seen = Vec::new();
        consume::<DeployEvent, _>(&api, Endpoint::Deploy, json!({}), &bus, |e| seen.push(e))
            .await
            .unwrap();

        assert_eq!(
            seen,
            vec![DeployEvent::Complete {
                url: Some("https://app".into())
            }]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            UiEvent::Log {
                source: "deploy".into(),
                message: "building".into()
            }
        );
    }

    #[tokio::test]
    async fn test_consume_error_event_fails() {
        let api = ScriptedApi::new();
        api.script(
            Endpoint::Deploy,
            Script::Frames(vec![
                frame("error", json!({"message": "quota exceeded"})),
                frame("complete", json!({"url": "https://app"})),
            ]),
        );
        let mut seen = Vec::new();
        let err = consume::<DeployEvent, _>(&api, Endpoint::Deploy, json!({}), &EventBus::new(), |e| {
            seen.push(e)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LaneError::Remote(ref m) if m == "quota exceeded"));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_consume_rejected_request() {
        let api = ScriptedApi::new();
        api.script(Endpoint::Deploy, Script::Reject("bad gateway".into()));
        let err = consume::<DeployEvent, _>(&api, Endpoint::Deploy, json!({}), &EventBus::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad gateway");
    }
}
