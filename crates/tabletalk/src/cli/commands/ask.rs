use anyhow::Result;
use clap::Args;

use super::{CommandContext, DEFAULT_SESSION_ID, agent_failure, emit, to_data};
use crate::agent::ChatRequest;
use crate::cli::envelope::CommandEnvelope;

#[derive(Debug, Clone, Args)]
pub struct AskArgs {
    #[arg(value_name = "QUESTION")]
    pub question: String,

    #[arg(long, default_value = DEFAULT_SESSION_ID)]
    pub session: String,

    /// Switch the session to this platform before asking.
    #[arg(long, value_name = "PLATFORM")]
    pub platform: Option<String>,
}

pub fn run(args: &AskArgs, context: &CommandContext) -> Result<()> {
    let agent = context.session_agent()?;
    let mut request = ChatRequest::new(&args.session, &args.question);
    if let Some(platform) = &args.platform {
        request = request.on_platform(platform);
    }
    let report = agent
        .chat(&request)
        .map_err(|error| agent_failure("ask", &error))?;

    emit(&CommandEnvelope::ok("ask", to_data(&report)?).with_turn(&report))
}
