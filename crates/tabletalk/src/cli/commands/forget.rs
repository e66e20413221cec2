use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{CommandContext, agent_failure, emit};
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct ForgetArgs {
    #[arg(long)]
    pub session: String,
}

pub fn run(args: &ForgetArgs, context: &CommandContext) -> Result<()> {
    let agent = context.session_agent()?;
    let deleted = agent
        .delete_session(&args.session)
        .map_err(|error| agent_failure("forget", &error))?;
    let mut envelope = CommandEnvelope::ok("forget", json!({ "deleted": deleted }))
        .with_meta("session_id", json!(args.session));
    if !deleted {
        envelope = envelope.with_warning("session_not_found", "no such session was stored");
    }
    emit(&envelope)
}
