use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{CommandContext, agent_failure, emit};
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct QuestionsArgs {
    #[arg(value_name = "PLATFORM")]
    pub platform: String,

    #[arg(long, default_value_t = 5)]
    pub count: usize,
}

pub fn run(args: &QuestionsArgs, context: &CommandContext) -> Result<()> {
    let agent = context.catalog_agent()?;
    let questions = agent
        .sample_questions(&args.platform, args.count)
        .map_err(|error| agent_failure("questions", &error))?;
    emit(
        &CommandEnvelope::ok("questions", json!({ "questions": questions }))
            .with_meta("platform", json!(args.platform))
            .with_meta("count", json!(questions.len())),
    )
}
