use std::path::Path;

use clap::Parser;
use tabletalk::cli::app::{Cli, Command};

#[test]
fn parses_global_runtime_flags_for_ask() {
    let cli = Cli::parse_from([
        "tabletalk",
        "--home-dir",
        "/home/tester",
        "--data-dir",
        "/srv/tabletalk/data",
        "ask",
        "How many employees are in each department?",
        "--session",
        "s1",
        "--platform",
        "hr",
    ]);

    assert_eq!(
        cli.runtime.home_dir.as_deref(),
        Some(Path::new("/home/tester"))
    );
    assert_eq!(
        cli.runtime.data_dir.as_deref(),
        Some(Path::new("/srv/tabletalk/data"))
    );
    assert_eq!(cli.runtime.log_level, "warn");

    match cli.command {
        Command::Ask(args) => {
            assert_eq!(args.question, "How many employees are in each department?");
            assert_eq!(args.session, "s1");
            assert_eq!(args.platform.as_deref(), Some("hr"));
        }
        other => panic!("expected ask command, got {other:?}"),
    }
}

#[test]
fn session_defaults_to_the_shared_default() {
    let cli = Cli::parse_from(["tabletalk", "select", "hr"]);

    match cli.command {
        Command::Select(args) => {
            assert_eq!(args.platform, "hr");
            assert_eq!(args.session, "default");
        }
        other => panic!("expected select command, got {other:?}"),
    }
}

#[test]
fn parses_history_turns_flag() {
    let cli = Cli::parse_from(["tabletalk", "history", "--session", "s2", "--turns"]);

    match cli.command {
        Command::History(args) => {
            assert!(args.turns);
            assert_eq!(args.session, "s2");
        }
        other => panic!("expected history command, got {other:?}"),
    }
}

#[test]
fn parses_catalog_question_and_reload() {
    let cli = Cli::parse_from([
        "tabletalk",
        "catalog",
        "fic",
        "--question",
        "unpaid invoices",
        "--reload",
    ]);

    match cli.command {
        Command::Catalog(args) => {
            assert_eq!(args.platform, "fic");
            assert_eq!(args.question.as_deref(), Some("unpaid invoices"));
            assert!(args.reload);
        }
        other => panic!("expected catalog command, got {other:?}"),
    }
}

#[test]
fn forget_requires_an_explicit_session() {
    let error = Cli::try_parse_from(["tabletalk", "forget"])
        .expect_err("forget without --session should fail");
    assert_eq!(
        error.kind(),
        clap::error::ErrorKind::MissingRequiredArgument
    );
}

#[test]
fn command_names_match_subcommands() {
    let cli = Cli::parse_from(["tabletalk", "plan-schema"]);
    assert_eq!(cli.command.name(), "plan-schema");

    let cli = Cli::parse_from(["tabletalk", "questions", "hr", "--count", "3"]);
    match &cli.command {
        Command::Questions(args) => assert_eq!(args.count, 3),
        other => panic!("expected questions command, got {other:?}"),
    }
    assert_eq!(cli.command.name(), "questions");
}
