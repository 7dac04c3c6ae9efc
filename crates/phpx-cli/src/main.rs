#![deny(clippy::all, warnings)]

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

mod cli;
mod dispatch;

use cli::PhpxCli;
use dispatch::dispatch_command;

fn main() -> ExitCode {
    if cfg!(windows) {
        eprintln!("phpx currently supports Linux and macOS only; please use WSL or a Unix host.");
        return ExitCode::FAILURE;
    }

    let cli = PhpxCli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(code) => match u8::try_from(code) {
            Ok(code) => ExitCode::from(code),
            Err(_) => ExitCode::FAILURE,
        },
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &PhpxCli) -> Result<i32> {
    dispatch_command(cli)
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };

    let filter = format!("phpx_cli={level},phpx_core={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
