//! The conversational query agent: sessions, catalogs, planning, validation and execution
//! wired into one per-turn state machine.

mod turn;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::catalog::{Catalog, CatalogCache, CatalogError};
use crate::compose;
use crate::config::{AgentConfig, PlatformSpec};
use crate::executor::Executor;
use crate::models::{
    AttemptRecord, Literal, Message, QueryPlan, Turn, TurnFailure, messages_from_turns,
};
use crate::planner::{HeuristicPlanner, Planner};
use crate::session::{PlatformSelection, SessionError, SessionJournal, SessionStore};
use crate::utils::text::check_question;
use crate::validate::CostEstimate;

use turn::{TurnPhase, TurnRun};

/// Caller-level failures. Anything that goes wrong inside a turn is recorded on the turn
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("unknown platform `{platform}`")]
    UnknownPlatform { platform: String },

    #[error("invalid platform `{platform}`")]
    InvalidPlatform { platform: String },

    #[error("failed to load schema for platform `{platform}`: {detail}")]
    SchemaLoad { platform: String, detail: String },

    #[error("session `{session_id}` has no platform selected")]
    NoPlatformSelected { session_id: String },

    #[error("session `{session_id}` already has a turn in progress")]
    SessionBusy { session_id: String },

    #[error("invalid question: {reason}")]
    InvalidQuestion { reason: String },

    #[error("session journal failure: {detail}")]
    Journal { detail: String },
}

impl AgentError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownPlatform { .. } => "unknown_platform",
            Self::InvalidPlatform { .. } => "invalid_platform",
            Self::SchemaLoad { .. } => "schema_load_error",
            Self::NoPlatformSelected { .. } => "no_platform_selected",
            Self::SessionBusy { .. } => "session_busy",
            Self::InvalidQuestion { .. } => "invalid_question",
            Self::Journal { .. } => "journal_error",
        }
    }
}

impl From<SessionError> for AgentError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::InvalidPlatform { platform } => Self::InvalidPlatform { platform },
            SessionError::SessionBusy { session_id } => Self::SessionBusy { session_id },
            SessionError::Journal { detail } => Self::Journal { detail },
        }
    }
}

impl From<CatalogError> for AgentError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::UnknownPlatform { platform } => Self::UnknownPlatform { platform },
            CatalogError::SchemaLoad { platform, detail } => Self::SchemaLoad { platform, detail },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub session_id: String,
    pub question: String,
    /// Switches the session to this platform first, with the usual switch semantics.
    pub platform: Option<String>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(session_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            question: question.into(),
            platform: None,
        }
    }

    #[must_use]
    pub fn on_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub session_id: String,
    pub platform: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_selection: Option<PlatformSelection>,

    pub turn: Turn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogDescription {
    pub platform: String,
    pub text: String,
    pub approx_tokens: usize,
    pub tables: Vec<String>,
    pub omitted: Vec<String>,
}

/// Outcome of planning and validating a question without executing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRun {
    pub platform: String,
    pub question: String,
    pub accepted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<QueryPlan>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Literal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostEstimate>,

    pub attempts: Vec<AttemptRecord>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TurnFailure>,
}

/// Shared entry point for every caller. `Send + Sync`; share it behind an `Arc`.
pub struct Agent {
    config: AgentConfig,
    catalogs: CatalogCache,
    sessions: SessionStore,
    executor: Executor,
    planner: Box<dyn Planner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("catalogs", &self.catalogs)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            catalogs: CatalogCache::new(config.platforms.clone()),
            sessions: SessionStore::new(config.platform_ids().map(ToString::to_string)),
            executor: Executor::new(&config.platforms, config.execution),
            planner: Box::new(HeuristicPlanner::new()),
            config,
        })
    }

    #[must_use]
    pub fn with_journal(self, journal: SessionJournal) -> Self {
        Self {
            sessions: self.sessions.with_journal(journal),
            ..self
        }
    }

    #[must_use]
    pub fn with_planner(self, planner: impl Planner + 'static) -> Self {
        Self {
            planner: Box::new(planner),
            ..self
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn platforms(&self) -> &[PlatformSpec] {
        self.catalogs.platforms()
    }

    /// Points the session at `platform`, loading its catalog first so schema problems
    /// surface here rather than on the first question.
    pub fn select_platform(
        &self,
        session_id: &str,
        platform: &str,
    ) -> Result<PlatformSelection, AgentError> {
        self.check_platform(platform)?;
        Ok(self.sessions.select_platform(session_id, platform)?)
    }

    fn check_platform(&self, platform: &str) -> Result<(), AgentError> {
        if !self.catalogs.is_known(platform) {
            return Err(AgentError::InvalidPlatform {
                platform: platform.to_string(),
            });
        }
        self.catalogs.get(platform)?;
        Ok(())
    }

    /// Runs one turn: plan, validate (retrying on rejection), execute, compose, record.
    ///
    /// Every outcome that gets past input checks is appended to the session as a turn,
    /// including failed ones.
    pub fn chat(&self, request: &ChatRequest) -> Result<TurnReport, AgentError> {
        let session_id = request.session_id.as_str();
        check_question(&request.question, self.config.max_question_chars).map_err(|issue| {
            AgentError::InvalidQuestion {
                reason: issue.message(),
            }
        })?;
        let permit = self.sessions.begin_turn(session_id)?;

        let platform_selection = match &request.platform {
            Some(platform) => {
                self.check_platform(platform)?;
                Some(self.sessions.select_platform_in_turn(&permit, platform)?)
            }
            None => None,
        };
        let platform = self
            .sessions
            .get_or_create(session_id)?
            .platform
            .ok_or_else(|| AgentError::NoPlatformSelected {
                session_id: session_id.to_string(),
            })?;
        let catalog = self.catalogs.get(&platform)?;
        let tail = self
            .sessions
            .recent_turns(session_id, self.config.transcript_window)?;

        tracing::info!(
            session_id,
            platform = %platform,
            transcript_tail = tail.len(),
            max_attempts = self.config.max_plan_attempts,
            "turn_started"
        );
        let turn = TurnRun::new(
            request.question.trim(),
            &catalog,
            &tail,
            self.planner.as_ref(),
            &self.executor,
            &self.config,
        )
        .finish();
        let turn = self.sessions.append_turn(&permit, turn)?;
        tracing::info!(
            session_id,
            sequence = turn.sequence,
            status = turn.status.as_str(),
            attempts = turn.attempts.len(),
            "turn_finalized"
        );
        drop(permit);

        Ok(TurnReport {
            session_id: session_id.to_string(),
            platform,
            platform_selection,
            turn,
        })
    }

    pub fn clear_history(&self, session_id: &str) -> Result<usize, AgentError> {
        Ok(self.sessions.clear_history(session_id)?)
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        Ok(messages_from_turns(&self.sessions.list_turns(session_id)?))
    }

    pub fn list_turns(&self, session_id: &str) -> Result<Vec<Turn>, AgentError> {
        Ok(self.sessions.list_turns(session_id)?)
    }

    pub fn selected_platform(&self, session_id: &str) -> Result<Option<String>, AgentError> {
        Ok(self.sessions.get_or_create(session_id)?.platform)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool, AgentError> {
        Ok(self.sessions.delete_session(session_id)?)
    }

    pub fn describe_catalog(
        &self,
        platform: &str,
        question: Option<&str>,
    ) -> Result<CatalogDescription, AgentError> {
        let catalog = self.catalogs.get(platform)?;
        // Without a question the budget is lifted so the whole schema is listed.
        let budget = match question {
            Some(_) => self.config.digest_token_budget,
            None => usize::MAX,
        };
        let digest = catalog.describe(question.unwrap_or_default(), &[], budget);
        Ok(CatalogDescription {
            platform: platform.to_string(),
            text: digest.text.clone(),
            approx_tokens: digest.approx_tokens,
            tables: digest.tables.iter().map(|table| table.name.clone()).collect(),
            omitted: digest.omitted.iter().map(ToString::to_string).collect(),
        })
    }

    /// Plans and validates `question` against `platform` with an empty transcript. Nothing is
    /// executed and no session is touched.
    pub fn dry_run(&self, platform: &str, question: &str) -> Result<DryRun, AgentError> {
        check_question(question, self.config.max_question_chars).map_err(|issue| {
            AgentError::InvalidQuestion {
                reason: issue.message(),
            }
        })?;
        let catalog = self.catalogs.get(platform)?;
        let mut run = TurnRun::new(
            question.trim(),
            &catalog,
            &[],
            self.planner.as_ref(),
            &self.executor,
            &self.config,
        );

        let mut phase = TurnPhase::Planning;
        loop {
            phase = match run.advance(phase) {
                TurnPhase::Executing(validated) => {
                    return Ok(DryRun {
                        platform: platform.to_string(),
                        question: question.trim().to_string(),
                        accepted: true,
                        sql: Some(validated.sql().to_string()),
                        params: validated.params().to_vec(),
                        cost: Some(validated.cost()),
                        plan: Some(validated.into_plan()),
                        attempts: std::mem::take(&mut run.attempts),
                        failure: None,
                    });
                }
                TurnPhase::Done(turn) => {
                    return Ok(DryRun {
                        platform: platform.to_string(),
                        question: turn.question,
                        accepted: false,
                        plan: turn.plan,
                        sql: None,
                        params: Vec::new(),
                        cost: None,
                        attempts: turn.attempts,
                        failure: turn.failure,
                    });
                }
                next => {
                    tracing::trace!(phase = next.name(), "dry_run_phase");
                    next
                }
            };
        }
    }

    pub fn sample_questions(&self, platform: &str, count: usize) -> Result<Vec<String>, AgentError> {
        let catalog = self.catalogs.get(platform)?;
        Ok(compose::sample_questions(&catalog, count))
    }

    pub fn catalog(&self, platform: &str) -> Result<Arc<Catalog>, AgentError> {
        Ok(self.catalogs.get(platform)?)
    }

    /// Re-reads the platform's DDL and row counts; sessions keep their transcripts.
    pub fn reload_catalog(&self, platform: &str) -> Result<Arc<Catalog>, AgentError> {
        Ok(self.catalogs.reload(platform)?)
    }
}
