use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::commands::{
    ask::AskArgs, catalog::CatalogArgs, clear::ClearArgs, forget::ForgetArgs,
    history::HistoryArgs, plan::PlanArgs, questions::QuestionsArgs, select::SelectArgs,
};

#[derive(Debug, Parser)]
#[command(
    name = "tabletalk",
    version,
    about = "Ask questions about relational data in plain language"
)]
pub struct Cli {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    #[arg(long, global = true, value_name = "PATH")]
    pub home_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    pub cwd: Option<PathBuf>,

    /// Directory holding `<platform>.sql` and `<platform>.db`.
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Directory for the session journal.
    #[arg(long, global = true, value_name = "PATH")]
    pub state_dir: Option<PathBuf>,

    /// JSON agent configuration; defaults are used when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "FILTER", default_value = "warn")]
    pub log_level: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List configured platforms.
    Platforms,
    /// Show a platform's schema digest, optionally ranked for a question.
    Catalog(CatalogArgs),
    /// Select the platform a session talks to.
    Select(SelectArgs),
    /// Ask a question within a session.
    Ask(AskArgs),
    /// Show a session's messages or full turns.
    History(HistoryArgs),
    /// Clear a session's transcript, keeping its platform.
    Clear(ClearArgs),
    /// Delete a session entirely.
    Forget(ForgetArgs),
    /// Plan and validate a question without running it.
    Plan(PlanArgs),
    /// Suggest questions a platform can answer.
    Questions(QuestionsArgs),
    /// Print the JSON Schema of query plans.
    PlanSchema,
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Platforms => "platforms",
            Self::Catalog(_) => "catalog",
            Self::Select(_) => "select",
            Self::Ask(_) => "ask",
            Self::History(_) => "history",
            Self::Clear(_) => "clear",
            Self::Forget(_) => "forget",
            Self::Plan(_) => "plan",
            Self::Questions(_) => "questions",
            Self::PlanSchema => "plan-schema",
        }
    }
}
