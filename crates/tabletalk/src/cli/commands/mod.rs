pub mod ask;
pub mod catalog;
pub mod clear;
pub mod forget;
pub mod history;
pub mod plan;
pub mod plan_schema;
pub mod platforms;
pub mod questions;
pub mod select;

use std::path::Path;

use anyhow::{Context, Error, Result};
use serde::Serialize;
use serde_json::Value;

use crate::agent::{Agent, AgentError};
use crate::cli::envelope::{CommandEnvelope, CommandFailure};
use crate::config::{AgentConfig, RuntimePaths, load_config};
use crate::session::SessionJournal;

pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Clone)]
pub struct CommandContext {
    pub paths: RuntimePaths,
    pub config: AgentConfig,
}

impl CommandContext {
    pub fn new(paths: RuntimePaths, config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => load_config(path)?,
            None => AgentConfig::for_data_dir(&paths.data_dir),
        };
        Ok(Self { paths, config })
    }

    /// An agent whose sessions survive across invocations through the state-dir journal.
    pub fn session_agent(&self) -> Result<Agent> {
        std::fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "failed to create state directory: {}",
                self.paths.state_dir.display()
            )
        })?;
        let journal = SessionJournal::open(&self.paths.journal_path())?;
        Ok(Agent::new(self.config.clone())?.with_journal(journal))
    }

    /// An agent for catalog-only commands; no session state is opened.
    pub fn catalog_agent(&self) -> Result<Agent> {
        Agent::new(self.config.clone())
    }
}

pub fn emit(envelope: &CommandEnvelope) -> Result<()> {
    let encoded = serde_json::to_string(envelope).context("failed to encode command envelope")?;
    println!("{encoded}");
    Ok(())
}

pub fn to_data<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to encode command data")
}

/// Wraps an agent error into an error envelope that `main` prints on stdout.
#[must_use]
pub fn agent_failure(command: &str, error: &AgentError) -> Error {
    Error::new(CommandFailure::new(CommandEnvelope::from_agent_error(
        command, error,
    )))
}
