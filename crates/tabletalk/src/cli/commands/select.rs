use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{CommandContext, DEFAULT_SESSION_ID, agent_failure, emit, to_data};
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct SelectArgs {
    #[arg(value_name = "PLATFORM")]
    pub platform: String,

    #[arg(long, default_value = DEFAULT_SESSION_ID)]
    pub session: String,
}

pub fn run(args: &SelectArgs, context: &CommandContext) -> Result<()> {
    let agent = context.session_agent()?;
    let selection = agent
        .select_platform(&args.session, &args.platform)
        .map_err(|error| agent_failure("select", &error))?;

    let mut envelope = CommandEnvelope::ok("select", to_data(&selection)?)
        .with_meta("session_id", json!(args.session));
    if selection.cleared_turns > 0 {
        envelope = envelope.with_warning(
            "transcript_cleared",
            format!(
                "switching platform cleared {} earlier turn(s)",
                selection.cleared_turns
            ),
        );
    }
    emit(&envelope)
}
