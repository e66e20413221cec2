#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use clap::error::ErrorKind;
use tabletalk::cli::app::{Cli, Command, RuntimeArgs};
use tabletalk::cli::commands::{self, CommandContext};
use tabletalk::config::RuntimePaths;
use tabletalk::cli::envelope::{CommandEnvelope, CommandFailure, ErrorClass};

const EXIT_SUCCESS: i32 = 0;
const EXIT_RUNTIME_FAILURE: i32 = 1;
const EXIT_INPUT_FAILURE: i32 = 2;
const EXIT_USAGE_ERROR: i32 = 64;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => return exit_code_for_parse_error(error),
    };
    if let Err(error) = tabletalk::cli::init_logging(&cli.runtime.log_level) {
        eprintln!("tabletalk: {error:#}");
        return EXIT_USAGE_ERROR;
    }
    let command_name = cli.command.name();
    tracing::debug!(command = command_name, "command_started");

    match execute(&cli) {
        Ok(()) => {
            tracing::debug!(command = command_name, exit_code = EXIT_SUCCESS, "command_completed");
            EXIT_SUCCESS
        }
        Err(error) => {
            let exit_code = classify_runtime_error(&error);
            match error.downcast_ref::<CommandFailure>() {
                Some(failure) => println!("{failure}"),
                None => {
                    let envelope = CommandEnvelope::runtime_error(command_name, &error);
                    println!("{}", CommandFailure::new(envelope));
                    eprintln!("tabletalk: failed `{command_name}` (exit_code={exit_code})");
                    eprintln!("{error:#}");
                }
            }
            tracing::debug!(command = command_name, exit_code, "command_failed");
            exit_code
        }
    }
}

fn execute(cli: &Cli) -> Result<()> {
    if let Command::PlanSchema = cli.command {
        return commands::plan_schema::run();
    }

    let runtime_paths = resolve_runtime_paths(&cli.runtime)?;
    let config_path = cli.runtime.config.as_ref().map(|path| {
        if path.is_relative() {
            runtime_paths.cwd.join(path)
        } else {
            path.clone()
        }
    });
    let context = CommandContext::new(runtime_paths, config_path.as_deref())?;

    match &cli.command {
        Command::Platforms => commands::platforms::run(&context),
        Command::Catalog(args) => commands::catalog::run(args, &context),
        Command::Select(args) => commands::select::run(args, &context),
        Command::Ask(args) => commands::ask::run(args, &context),
        Command::History(args) => commands::history::run(args, &context),
        Command::Clear(args) => commands::clear::run(args, &context),
        Command::Forget(args) => commands::forget::run(args, &context),
        Command::Plan(args) => commands::plan::run(args, &context),
        Command::Questions(args) => commands::questions::run(args, &context),
        Command::PlanSchema => commands::plan_schema::run(),
    }
}

fn classify_runtime_error(error: &anyhow::Error) -> i32 {
    let class = error
        .downcast_ref::<CommandFailure>()
        .and_then(|failure| failure.envelope().error_class());
    match class {
        Some(ErrorClass::Input) => EXIT_INPUT_FAILURE,
        _ => EXIT_RUNTIME_FAILURE,
    }
}

fn exit_code_for_parse_error(error: clap::Error) -> i32 {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = error.print();
            EXIT_SUCCESS
        }
        _ => {
            let _ = error.print();
            EXIT_USAGE_ERROR
        }
    }
}

fn resolve_runtime_paths(args: &RuntimeArgs) -> Result<RuntimePaths> {
    let home_dir = match &args.home_dir {
        Some(path) => path.clone(),
        None => std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("HOME is not set; pass --home-dir"))?,
    };

    let cwd = match &args.cwd {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };

    tabletalk::config::resolve_runtime_paths(
        &home_dir,
        &cwd,
        args.data_dir.as_deref(),
        args.state_dir.as_deref(),
    )
}
