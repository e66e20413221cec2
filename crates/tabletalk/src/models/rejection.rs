use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured reason a plan was turned away by the validator.
///
/// Planners act on these values directly when retrying, so every variant carries the exact
/// reference or measurement that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("unknown reference `{}`", reference_path(.table, .column.as_deref()))]
    UnknownReference {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<String>,
    },

    #[error("write operation `{operation}` is not allowed")]
    WriteNotAllowed { operation: String },

    #[error(
        "plan too expensive: ~{estimated_rows} rows (max {max_estimated_rows}), fan-out {join_fan_out:.1} (max {max_join_fan_out:.1}), {join_count} joins (max {max_joins})"
    )]
    PlanTooExpensive {
        estimated_rows: u64,
        join_fan_out: f64,
        join_count: usize,
        max_estimated_rows: u64,
        max_join_fan_out: f64,
        max_joins: usize,
    },

    #[error("chart references unknown column `{column}`")]
    ChartReferencesUnknownColumn { column: String },
}

fn reference_path(table: &str, column: Option<&str>) -> String {
    match column {
        Some(column) => format!("{table}.{column}"),
        None => table.to_string(),
    }
}

impl Rejection {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownReference { .. } => "unknown_reference",
            Self::WriteNotAllowed { .. } => "write_not_allowed",
            Self::PlanTooExpensive { .. } => "plan_too_expensive",
            Self::ChartReferencesUnknownColumn { .. } => "chart_references_unknown_column",
        }
    }

    #[must_use]
    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownReference {
            table: table.into(),
            column: None,
        }
    }

    #[must_use]
    pub fn unknown_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::UnknownReference {
            table: table.into(),
            column: Some(column.into()),
        }
    }
}
