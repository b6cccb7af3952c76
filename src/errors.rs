//! Typed error hierarchy for meetloop.
//!
//! One enum per subsystem:
//! - `StoreError`: path store writes
//! - `ApiError`: transport and streamed-response failures
//! - `LaneError`: a single dispatch lane settling as failed
//! - `StageError`: stage state machine and detail surface
//! - `FlowError`: Meet and Analyze flows
//! - `DispatchError`: Build dispatch entry points
//! - `VerifyError`: deploy/validate entry points

use thiserror::Error;

use crate::models::{Lane, Stage};

/// Errors from the observable path store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store path must not be empty")]
    EmptyPath,

    #[error("Patch must be a JSON object, got {0}")]
    PatchNotObject(String),

    #[error("Cannot index a list of length {len} with `{segment}`")]
    BadIndex { segment: String, len: usize },
}

/// Errors from the remote pipeline API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response. `message` is the body's `error` string when present.
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Stream read failed: {0}")]
    Stream(String),

    #[error("Invalid request body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Why a dispatch lane (or a deploy/validate phase) settled as failed.
#[derive(Debug, Error)]
pub enum LaneError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The server sent an `error` event on the stream.
    #[error("Server reported: {0}")]
    Remote(String),

    #[error("No issues were created for the {0} lane")]
    NoIssuesCreated(Lane),
}

/// Errors from the stage controller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Stages {first} and {second} cannot both be active")]
    MultipleActive { first: Stage, second: Stage },

    #[error("Nothing to show for {0} yet")]
    NothingToShow(Stage),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the Meet and Analyze flows.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Requirements are already recorded for this meeting; start a new meeting first")]
    RequirementsLocked,

    #[error("No requirements to analyze; run the meeting analysis first")]
    NoRequirements,

    #[error("The meeting analysis produced no requirements")]
    EmptyAnalysis,

    #[error(transparent)]
    Lane(#[from] LaneError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

impl From<ApiError> for FlowError {
    fn from(err: ApiError) -> Self {
        FlowError::Lane(LaneError::Api(err))
    }
}

/// Errors from `dispatch_selected` / `dispatch_remaining`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No gaps selected for dispatch")]
    NothingSelected,

    #[error("Every gap has already been dispatched")]
    NothingRemaining,

    #[error("A dispatch is already in progress")]
    AlreadyInProgress,

    #[error("All dispatch lanes failed: {}", summarize_lanes(.failures))]
    AllLanesFailed { failures: Vec<(Lane, String)> },

    #[error(transparent)]
    Stage(#[from] StageError),
}

fn summarize_lanes(failures: &[(Lane, String)]) -> String {
    failures
        .iter()
        .map(|(lane, msg)| format!("{}: {}", lane, msg))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the deploy/validate engine.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("No successful deployment yet; deploy before validating")]
    NoDeployment,

    #[error("Deploy finished without reporting a URL")]
    NoDeployUrl,

    #[error("Deploy failed: {0}")]
    Deploy(#[source] LaneError),

    #[error("Validation failed: {0}")]
    Validation(#[source] LaneError),

    #[error("A verify run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Stage(#[from] StageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_status_error_displays_server_message_verbatim() {
        let err = ApiError::Status {
            status: 422,
            message: "requirements must not be empty".to_string(),
        };
        assert_eq!(err.to_string(), "requirements must not be empty");
    }

    #[test]
    fn lane_error_converts_from_api_error() {
        let err: LaneError = ApiError::Stream("connection reset".into()).into();
        match &err {
            LaneError::Api(ApiError::Stream(msg)) => assert_eq!(msg, "connection reset"),
            _ => panic!("Expected LaneError::Api(Stream)"),
        }
    }

    #[test]
    fn all_lanes_failed_lists_each_lane() {
        let err = DispatchError::AllLanesFailed {
            failures: vec![
                (Lane::Cloud, "boom".to_string()),
                (Lane::Local, "offline".to_string()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("cloud: boom"));
        assert!(text.contains("local: offline"));
    }

    #[test]
    fn stage_error_multiple_active_is_matchable() {
        let err = StageError::MultipleActive {
            first: Stage::Build,
            second: Stage::Verify,
        };
        assert!(matches!(err, StageError::MultipleActive { .. }));
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn flow_error_converts_from_api_error() {
        let err: FlowError = ApiError::Status {
            status: 500,
            message: "x".into(),
        }
        .into();
        assert!(matches!(err, FlowError::Lane(LaneError::Api(_))));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::EmptyPath);
        assert_std_error(&LaneError::Remote("x".into()));
        assert_std_error(&StageError::NothingToShow(Stage::Meet));
        assert_std_error(&FlowError::NoRequirements);
        assert_std_error(&DispatchError::NothingSelected);
        assert_std_error(&VerifyError::NoDeployment);
    }
}
