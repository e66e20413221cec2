use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{CommandContext, agent_failure, emit, to_data};
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct PlanArgs {
    #[arg(value_name = "PLATFORM")]
    pub platform: String,

    #[arg(value_name = "QUESTION")]
    pub question: String,
}

pub fn run(args: &PlanArgs, context: &CommandContext) -> Result<()> {
    let agent = context.catalog_agent()?;
    let dry_run = agent
        .dry_run(&args.platform, &args.question)
        .map_err(|error| agent_failure("plan", &error))?;

    let mut envelope = CommandEnvelope::ok("plan", to_data(&dry_run)?)
        .with_meta("accepted", json!(dry_run.accepted))
        .with_meta("attempts", json!(dry_run.attempts.len()));
    if let Some(failure) = &dry_run.failure {
        envelope = envelope.with_warning("plan_not_accepted", failure.detail.clone());
    }
    emit(&envelope)
}
