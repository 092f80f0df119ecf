mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod providers;
mod session;
mod template;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::Config;
use session::{Overrides, Session};
use std::io;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            ui::error(&format!("{err:#}"));
            let code = engine_error(&err).map_or(1, |e| {
                let category = e.category();
                ui::dim(&format!("{}: {}", category.description(), category.advice()));
                category.exit_code()
            });
            commands::exit_code(code)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "strata", &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load()?;
    let jobs = match &cli.command {
        Command::Apply(args) => args.jobs,
        Command::Destroy(args) => args.jobs,
        _ => None,
    };
    let overrides = Overrides {
        database: cli.db.clone(),
        jobs,
    };
    let mut session = Session::open(config, &overrides)?;

    match cli.command {
        Command::Plan(args) => commands::stack::plan(&ctx, &session, &args),
        Command::Apply(args) => commands::stack::apply(&ctx, &mut session, &args),
        Command::Destroy(args) => commands::stack::destroy(&ctx, &mut session, &args),
        Command::Recover(args) => commands::stack::recover(&ctx, &mut session, &args),
        Command::Discard { change_set } => commands::stack::discard(&session, &change_set),
        Command::Unlock { stack, yes } => commands::stack::unlock(&session, &stack, yes),
        Command::Status(args) => commands::inspect::status(&session, &args),
        Command::Journal(args) => commands::inspect::journal(&session, &args),
        Command::Drift(args) => commands::inspect::drift(&session, &args),
        Command::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn engine_error(err: &anyhow::Error) -> Option<&orchestrator::Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<orchestrator::Error>())
}
