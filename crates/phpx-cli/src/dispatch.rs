use anyhow::{bail, Result};

use phpx_core::commands::cache::{cache_clean_command, cache_dir_command};
use phpx_core::commands::{run_script_command, run_tool_command, RunRequest, ToolRequest};

use crate::cli::{CacheCommand, CommandCli, PhpxCli, RunArgs, SecurityArgs, ToolArgs};

/// Route a parsed invocation to its orchestrator, returning the exit code.
pub fn dispatch_command(cli: &PhpxCli) -> Result<i32> {
    match &cli.command {
        Some(CommandCli::Run(args)) => run_script(args, cli.verbose, cli.quiet),
        Some(CommandCli::Tool(args)) => run_tool(args, cli.verbose, cli.quiet),
        Some(CommandCli::Cache(command)) => {
            match command {
                CacheCommand::Dir => cache_dir_command()?,
                CacheCommand::Clean(args) => cache_clean_command(&args.target)?,
            }
            Ok(0)
        }
        None => run_script(&cli.run, cli.verbose, cli.quiet),
    }
}

fn run_script(args: &RunArgs, verbose: bool, quiet: bool) -> Result<i32> {
    let Some(script) = &args.script else {
        bail!("no script given; run `phpx --help` for usage");
    };
    let security = &args.security;
    let request = RunRequest {
        script: script.clone(),
        args: args.args.clone(),
        php: args.php.clone().unwrap_or_default(),
        packages: args.packages.clone().unwrap_or_default(),
        extensions: args.extensions.clone().unwrap_or_default(),
        sandbox: security.sandbox,
        offline: security.offline,
        allow_host: flag(&security.allow_host),
        allow_read: flag(&security.allow_read),
        allow_write: flag(&security.allow_write),
        allow_env: flag(&security.allow_env),
        memory_mb: security.memory,
        timeout_secs: security.timeout,
        cpu_seconds: security.cpu,
        verbose,
        quiet,
    };
    run_script_command(&request)
}

fn run_tool(args: &ToolArgs, verbose: bool, quiet: bool) -> Result<i32> {
    let security: &SecurityArgs = &args.security;
    let request = ToolRequest {
        tool: args.tool.clone(),
        args: args.args.clone(),
        php: args.php.clone().unwrap_or_default(),
        extensions: args.extensions.clone().unwrap_or_default(),
        from: args.from.clone().unwrap_or_default(),
        sandbox: security.sandbox,
        offline: security.offline,
        allow_host: flag(&security.allow_host),
        allow_read: flag(&security.allow_read),
        allow_write: flag(&security.allow_write),
        allow_env: flag(&security.allow_env),
        memory_mb: security.memory,
        timeout_secs: security.timeout,
        cpu_seconds: security.cpu,
        verbose,
        quiet,
    };
    run_tool_command(&request)
}

fn flag(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}
