use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{CommandContext, DEFAULT_SESSION_ID, agent_failure, emit};
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct ClearArgs {
    #[arg(long, default_value = DEFAULT_SESSION_ID)]
    pub session: String,
}

pub fn run(args: &ClearArgs, context: &CommandContext) -> Result<()> {
    let agent = context.session_agent()?;
    let cleared = agent
        .clear_history(&args.session)
        .map_err(|error| agent_failure("clear", &error))?;
    emit(
        &CommandEnvelope::ok("clear", json!({ "cleared_turns": cleared }))
            .with_meta("session_id", json!(args.session)),
    )
}
