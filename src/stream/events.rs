//! Event vocabularies of the pipeline endpoints.
//!
//! Every endpoint shares `log` and `error`; the rest is endpoint-specific.
//! Payload keys are camelCase on the wire.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::models::{EpicIssue, GapItem, IssueRecord, MeetingInfo, ValidationResult};

/// Behaviour shared by every endpoint's event enum.
pub trait StreamEvent: DeserializeOwned + Send {
    /// Free-text progress line to forward to the activity log.
    fn log_line(&self) -> Option<&str>;

    /// Server-reported failure; ends the stream as failed.
    fn failure(&self) -> Option<&str>;
}

/// `/api/analyze`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum MeetEvent {
    Log {
        #[serde(default)]
        message: String,
    },
    Meeting(MeetingInfo),
    Requirement {
        text: String,
    },
    Epic(EpicIssue),
    Complete(MeetSummary),
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
}

/// Final `complete` payload of `/api/analyze`. Every field is optional; the
/// incremental events take precedence when both are present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeetSummary {
    pub requirements: Option<Vec<String>>,
    pub epic: Option<EpicIssue>,
    pub meeting: Option<MeetingInfo>,
}

/// `/api/analyze-gaps`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum GapEvent {
    Log {
        #[serde(default)]
        message: String,
    },
    Gap(GapItem),
    Complete {
        #[serde(default)]
        gaps: Option<Vec<GapItem>>,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
}

/// `/api/create-issues`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum IssueEvent {
    Log {
        #[serde(default)]
        message: String,
    },
    Issue(IssueRecord),
    Complete {},
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
}

/// `/api/assign-coding-agent`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum AssignEvent {
    Log {
        #[serde(default)]
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        issue_number: u64,
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    Complete {},
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
}

/// `/api/execute-local-agent`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum LocalEvent {
    Log {
        #[serde(default)]
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ItemStart { gap_id: u32 },
    #[serde(rename_all = "camelCase")]
    ItemProgress {
        gap_id: u32,
        #[serde(default)]
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ItemComplete {
        gap_id: u32,
        success: bool,
        #[serde(default)]
        summary: Option<String>,
    },
    Complete {},
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
}

/// `/api/deploy`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum DeployEvent {
    Log {
        #[serde(default)]
        message: String,
    },
    Complete {
        #[serde(default)]
        url: Option<String>,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
}

/// `/api/validate`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ValidateEvent {
    Log {
        #[serde(default)]
        message: String,
    },
    ValidationStart {},
    Result(ValidationResult),
    Complete {},
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
}

/// Every endpoint enum carries `Log { message }` and `Error { message }`.
macro_rules! impl_stream_event {
    ($($event:ty),+ $(,)?) => {
        $(
            impl StreamEvent for $event {
                fn log_line(&self) -> Option<&str> {
                    match self {
                        Self::Log { message } => Some(message),
                        _ => None,
                    }
                }

                fn failure(&self) -> Option<&str> {
                    match self {
                        Self::Error { message } => Some(message),
                        _ => None,
                    }
                }
            }
        )+
    };
}

impl_stream_event!(
    MeetEvent,
    GapEvent,
    IssueEvent,
    AssignEvent,
    LocalEvent,
    DeployEvent,
    ValidateEvent,
);
