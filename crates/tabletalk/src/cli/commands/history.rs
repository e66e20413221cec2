use anyhow::Result;
use clap::Args;
use serde_json::{Map, Value, json};

use super::{CommandContext, DEFAULT_SESSION_ID, agent_failure, emit, to_data};
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct HistoryArgs {
    #[arg(long, default_value = DEFAULT_SESSION_ID)]
    pub session: String,

    /// Show full turns (plans, attempts, results) instead of messages.
    #[arg(long, default_value_t = false)]
    pub turns: bool,
}

pub fn run(args: &HistoryArgs, context: &CommandContext) -> Result<()> {
    let agent = context.session_agent()?;
    let platform = agent
        .selected_platform(&args.session)
        .map_err(|error| agent_failure("history", &error))?;

    let (key, data, count) = if args.turns {
        let turns = agent
            .list_turns(&args.session)
            .map_err(|error| agent_failure("history", &error))?;
        ("turns", to_data(&turns)?, turns.len())
    } else {
        let messages = agent
            .list_messages(&args.session)
            .map_err(|error| agent_failure("history", &error))?;
        ("messages", to_data(&messages)?, messages.len())
    };

    let mut body = Map::new();
    body.insert(key.to_string(), data);
    emit(
        &CommandEnvelope::ok("history", Value::Object(body))
            .with_meta("session_id", json!(args.session))
            .with_meta("platform", json!(platform))
            .with_meta("count", json!(count)),
    )
}
