use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::plan::{ChartFragment, QueryPlan};
use super::rejection::Rejection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub row_cap: usize,
    pub duration_ms: u64,
}

impl ExecutionResult {
    #[must_use]
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }

    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    /// Rows as column-name keyed objects, in column order.
    #[must_use]
    pub fn records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let record = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<serde_json::Map<_, _>>();
                Value::Object(record)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Succeeded,
    PlannerExhausted,
    ValidationRejected,
    ExecutionFailed,
}

impl TurnStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::PlannerExhausted => "planner_exhausted",
            Self::ValidationRejected => "validation_rejected",
            Self::ExecutionFailed => "execution_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotAnswerable,
    PlannerExhausted,
    UnknownReference,
    WriteNotAllowed,
    PlanTooExpensive,
    ChartReferencesUnknownColumn,
    ExecutionTimeout,
    ExecutionFailed,
}

impl FailureKind {
    #[must_use]
    pub fn from_rejection(rejection: &Rejection) -> Self {
        match rejection {
            Rejection::UnknownReference { .. } => Self::UnknownReference,
            Rejection::WriteNotAllowed { .. } => Self::WriteNotAllowed,
            Rejection::PlanTooExpensive { .. } => Self::PlanTooExpensive,
            Rejection::ChartReferencesUnknownColumn { .. } => Self::ChartReferencesUnknownColumn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnFailure {
    pub kind: FailureKind,
    /// Internal detail for auditing; never shown to the user verbatim.
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Rejected { rejection: Rejection },
    PlanningFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match &self.outcome {
            AttemptOutcome::Rejected { rejection } => Some(rejection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: TurnStatus,
    pub text: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartFragment>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_ups: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub sequence: u64,
    pub question: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<QueryPlan>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,

    pub response: Response,
    pub status: TurnStatus,
    pub attempts: Vec<AttemptRecord>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,

    pub created_at_utc: String,
}

impl Turn {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == TurnStatus::Succeeded
    }

    /// Rejections collected across every attempt of this turn.
    pub fn rejections(&self) -> impl Iterator<Item = &Rejection> {
        self.attempts.iter().filter_map(AttemptRecord::rejection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

#[must_use]
pub fn messages_from_turns(turns: &[Turn]) -> Vec<Message> {
    turns
        .iter()
        .flat_map(|turn| {
            [
                Message {
                    role: MessageRole::User,
                    content: turn.question.clone(),
                },
                Message {
                    role: MessageRole::Assistant,
                    content: turn.response.text.clone(),
                },
            ]
        })
        .filter(|message| !message.content.is_empty())
        .collect()
}
