use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{CommandContext, agent_failure, emit, to_data};
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct CatalogArgs {
    #[arg(value_name = "PLATFORM")]
    pub platform: String,

    /// Rank tables by relevance to this question and apply the digest budget.
    #[arg(long, value_name = "TEXT")]
    pub question: Option<String>,

    /// Re-read the DDL and row counts before describing.
    #[arg(long, default_value_t = false)]
    pub reload: bool,
}

pub fn run(args: &CatalogArgs, context: &CommandContext) -> Result<()> {
    let agent = context.catalog_agent()?;
    if args.reload {
        agent
            .reload_catalog(&args.platform)
            .map_err(|error| agent_failure("catalog", &error))?;
    }
    let catalog = agent
        .catalog(&args.platform)
        .map_err(|error| agent_failure("catalog", &error))?;
    let description = agent
        .describe_catalog(&args.platform, args.question.as_deref())
        .map_err(|error| agent_failure("catalog", &error))?;

    emit(
        &CommandEnvelope::ok(
            "catalog",
            json!({
                "digest": to_data(&description)?,
                "tables": to_data(catalog.tables())?,
            }),
        )
        .with_meta("table_count", json!(catalog.tables().len()))
        .with_meta("ranked", json!(args.question.is_some())),
    )
}
