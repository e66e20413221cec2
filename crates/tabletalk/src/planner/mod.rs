mod heuristic;
mod joins;
mod lexicon;

use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogDigest;
use crate::models::{QueryPlan, Rejection, Turn};

pub use heuristic::HeuristicPlanner;

/// Why earlier attempts in the current turn failed, handed to the next attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlannerFeedback {
    /// Attempt number the planner is about to make (2 for the first retry).
    pub attempt: u32,
    /// Every rejection so far in this turn, oldest first.
    pub rejections: Vec<Rejection>,
}

impl PlannerFeedback {
    #[must_use]
    pub fn count(&self, code: &str) -> usize {
        self.rejections
            .iter()
            .filter(|rejection| rejection.code() == code)
            .count()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Rejection> {
        self.rejections.last()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub question: &'a str,
    /// Most recent turn first, already bounded by the transcript window.
    pub transcript_tail: &'a [Turn],
    pub digest: &'a CatalogDigest<'a>,
    pub feedback: Option<&'a PlannerFeedback>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningFailure {
    #[error("question cannot be answered from this schema: {reason}")]
    Ungrounded { reason: String },
}

impl PlanningFailure {
    pub(crate) fn ungrounded(reason: impl Into<String>) -> Self {
        Self::Ungrounded {
            reason: reason.into(),
        }
    }
}

/// Turns a question into a candidate plan. Implementations only propose; they never execute.
pub trait Planner: Send + Sync {
    fn propose(&self, request: &PlanRequest<'_>) -> Result<QueryPlan, PlanningFailure>;
}
