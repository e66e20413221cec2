use crate::catalog::Catalog;
use crate::compose;
use crate::config::AgentConfig;
use crate::executor::{ExecutionError, Executor};
use crate::models::{
    AttemptOutcome, AttemptRecord, ExecutionResult, FailureKind, QueryPlan, Turn, TurnFailure,
    TurnStatus,
};
use crate::planner::{PlanRequest, Planner, PlannerFeedback, PlanningFailure};
use crate::utils::time::now_utc_rfc3339;
use crate::validate::{ValidatedPlan, Verdict, validate};

/// Where a turn is in its lifecycle. A turn only ever moves forward, except for the bounded
/// `Validating -> Planning` loop taken on a rejection.
#[derive(Debug)]
pub(crate) enum TurnPhase {
    Planning,
    Validating(QueryPlan),
    Executing(ValidatedPlan),
    Composing(ValidatedPlan, ExecutionResult),
    Done(Box<Turn>),
}

impl TurnPhase {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Validating(_) => "validating",
            Self::Executing(_) => "executing",
            Self::Composing(..) => "composing",
            Self::Done(_) => "done",
        }
    }
}

/// Everything one turn needs while it runs; dropped once the turn is finalized.
pub(crate) struct TurnRun<'a> {
    pub question: &'a str,
    pub catalog: &'a Catalog,
    pub tail: &'a [Turn],
    pub planner: &'a dyn Planner,
    pub executor: &'a Executor,
    pub config: &'a AgentConfig,
    pub attempts: Vec<AttemptRecord>,
    pub feedback: PlannerFeedback,
    pinned: Vec<String>,
}

impl<'a> TurnRun<'a> {
    pub(crate) fn new(
        question: &'a str,
        catalog: &'a Catalog,
        tail: &'a [Turn],
        planner: &'a dyn Planner,
        executor: &'a Executor,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            question,
            catalog,
            tail,
            planner,
            executor,
            config,
            attempts: Vec::new(),
            feedback: PlannerFeedback::default(),
            pinned: pinned_tables(tail),
        }
    }

    pub(crate) fn advance(&mut self, phase: TurnPhase) -> TurnPhase {
        match phase {
            TurnPhase::Planning => self.plan(),
            TurnPhase::Validating(plan) => self.validate(plan),
            TurnPhase::Executing(validated) => self.execute(validated),
            TurnPhase::Composing(validated, result) => self.compose(&validated, result),
            done @ TurnPhase::Done(_) => done,
        }
    }

    /// Drives the turn to completion.
    pub(crate) fn finish(mut self) -> Turn {
        let mut phase = TurnPhase::Planning;
        loop {
            phase = match self.advance(phase) {
                TurnPhase::Done(turn) => return *turn,
                next => next,
            };
        }
    }

    fn attempt_number(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX).saturating_add(1)
    }

    fn plan(&mut self) -> TurnPhase {
        let attempt = self.attempt_number();
        let digest = self.catalog.describe(
            self.question,
            &self.pinned,
            self.config.digest_token_budget,
        );
        self.feedback.attempt = attempt;
        let request = PlanRequest {
            question: self.question,
            transcript_tail: self.tail,
            digest: &digest,
            feedback: (attempt > 1).then_some(&self.feedback),
        };

        match self.planner.propose(&request) {
            Ok(plan) => {
                tracing::info!(
                    attempt,
                    platform = %plan.platform,
                    tables = ?plan.referenced_tables(),
                    "plan_proposed"
                );
                TurnPhase::Validating(plan)
            }
            Err(PlanningFailure::Ungrounded { reason }) => {
                tracing::info!(attempt, %reason, "plan_not_grounded");
                self.attempts.push(AttemptRecord {
                    attempt,
                    sql: None,
                    outcome: AttemptOutcome::PlanningFailed {
                        reason: reason.clone(),
                    },
                });
                // A first-attempt failure means nothing in the schema fits the question.
                let kind = if attempt == 1 {
                    FailureKind::NotAnswerable
                } else {
                    FailureKind::PlannerExhausted
                };
                self.fail(TurnStatus::PlannerExhausted, kind, reason, None)
            }
        }
    }

    fn validate(&mut self, plan: QueryPlan) -> TurnPhase {
        let attempt = self.attempt_number();
        let sql = plan.render().sql;
        match validate(&plan, self.catalog, &self.config.plan_limits) {
            Verdict::Accepted(validated) => {
                self.attempts.push(AttemptRecord {
                    attempt,
                    sql: Some(sql),
                    outcome: AttemptOutcome::Accepted,
                });
                TurnPhase::Executing(validated)
            }
            Verdict::Rejected(rejection) => {
                tracing::warn!(
                    attempt,
                    reason = rejection.code(),
                    detail = %rejection,
                    "plan_rejected"
                );
                self.attempts.push(AttemptRecord {
                    attempt,
                    sql: Some(sql),
                    outcome: AttemptOutcome::Rejected {
                        rejection: rejection.clone(),
                    },
                });
                self.feedback.rejections.push(rejection.clone());
                if self.attempts.len() < self.config.max_plan_attempts as usize {
                    return TurnPhase::Planning;
                }
                self.fail(
                    TurnStatus::ValidationRejected,
                    FailureKind::from_rejection(&rejection),
                    rejection.to_string(),
                    None,
                )
            }
        }
    }

    fn execute(&mut self, validated: ValidatedPlan) -> TurnPhase {
        match self.executor.execute(&validated) {
            Ok(result) => {
                tracing::info!(
                    rows = result.row_count,
                    truncated = result.truncated,
                    duration_ms = result.duration_ms,
                    "execution_finished"
                );
                TurnPhase::Composing(validated, result)
            }
            Err(error) => {
                tracing::warn!(%error, "execution_finished");
                let kind = match error {
                    ExecutionError::Timeout { .. } => FailureKind::ExecutionTimeout,
                    ExecutionError::Failed { .. } => FailureKind::ExecutionFailed,
                };
                self.fail(
                    TurnStatus::ExecutionFailed,
                    kind,
                    error.to_string(),
                    Some(validated.into_plan()),
                )
            }
        }
    }

    fn compose(&mut self, validated: &ValidatedPlan, result: ExecutionResult) -> TurnPhase {
        let response = compose::compose(self.question, validated.plan(), &result, self.catalog);
        TurnPhase::Done(Box::new(Turn {
            sequence: 0,
            question: self.question.to_string(),
            plan: Some(validated.plan().clone()),
            result: Some(result),
            response,
            status: TurnStatus::Succeeded,
            attempts: std::mem::take(&mut self.attempts),
            failure: None,
            created_at_utc: now_utc_rfc3339(),
        }))
    }

    fn fail(
        &mut self,
        status: TurnStatus,
        kind: FailureKind,
        detail: String,
        plan: Option<QueryPlan>,
    ) -> TurnPhase {
        TurnPhase::Done(Box::new(Turn {
            sequence: 0,
            question: self.question.to_string(),
            plan,
            result: None,
            response: compose::compose_failure(status, kind),
            status,
            attempts: std::mem::take(&mut self.attempts),
            failure: Some(TurnFailure { kind, detail }),
            created_at_utc: now_utc_rfc3339(),
        }))
    }
}

/// Tables any earlier turn planned against, most recent first. Turns that failed after
/// planning count too; only turns that never produced a plan pin nothing.
fn pinned_tables(tail: &[Turn]) -> Vec<String> {
    let mut pinned = Vec::new();
    for plan in tail.iter().filter_map(|turn| turn.plan.as_ref()) {
        for table in plan.referenced_tables() {
            if !pinned.contains(&table) {
                pinned.push(table);
            }
        }
    }
    pinned
}

#[cfg(test)]
mod tests {
    use super::pinned_tables;
    use crate::catalog::Catalog;
    use crate::compose::compose_failure;
    use crate::models::{FailureKind, QueryPlan, Turn, TurnFailure, TurnStatus};
    use crate::planner::{HeuristicPlanner, PlanRequest, Planner};

    fn plan_for(catalog: &Catalog, question: &str) -> QueryPlan {
        let digest = catalog.describe(question, &[], 100_000);
        HeuristicPlanner::new()
            .propose(&PlanRequest {
                question,
                transcript_tail: &[],
                digest: &digest,
                feedback: None,
            })
            .expect("question should be grounded")
    }

    fn failed_turn(plan: Option<QueryPlan>, status: TurnStatus, kind: FailureKind) -> Turn {
        Turn {
            sequence: 1,
            question: "earlier".to_string(),
            plan,
            result: None,
            response: compose_failure(status, kind),
            status,
            attempts: Vec::new(),
            failure: Some(TurnFailure {
                kind,
                detail: "earlier failure".to_string(),
            }),
            created_at_utc: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn failed_executions_still_pin_their_tables() {
        let catalog = Catalog::from_ddl("hr", include_str!("../../schemas/hr.sql"))
            .expect("hr ddl should load");
        let plan = plan_for(&catalog, "list trainings with their enrollments");
        let expected = plan.referenced_tables().into_iter().collect::<Vec<_>>();
        assert!(expected.len() >= 2);

        let tail = vec![
            failed_turn(Some(plan), TurnStatus::ExecutionFailed, FailureKind::ExecutionTimeout),
            failed_turn(None, TurnStatus::PlannerExhausted, FailureKind::NotAnswerable),
        ];
        assert_eq!(pinned_tables(&tail), expected);
    }
}
