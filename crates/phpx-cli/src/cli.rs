use clap::{Args, Parser, Subcommand};

pub const PHPX_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nOptions:\n{options}\n\nCommands:\n{subcommands}\n";

pub const PHPX_BEFORE_HELP: &str = concat!(
    "phpx ",
    env!("CARGO_PKG_VERSION"),
    " – Run PHP scripts with inline Composer dependencies\n\n",
    "A script can declare its requirements in a // phpx comment block:\n\n",
    "    <?php\n",
    "    // phpx\n",
    "    // php = \">=8.2\"\n",
    "    // packages = [\"guzzlehttp/guzzle:^7.0\"]\n",
    "    // extensions = [\"redis\"]\n\n",
    "Examples:\n",
    "  phpx script.php              Run a PHP script\n",
    "  phpx run script.php          Same as above\n",
    "  phpx tool phpstan            Run PHPStan\n",
    "  phpx tool phpstan@1.10.0     Run a specific version\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "phpx",
    version,
    disable_help_subcommand = true,
    args_conflicts_with_subcommands = true,
    before_help = PHPX_BEFORE_HELP,
    help_template = PHPX_HELP_TEMPLATE
)]
pub struct PhpxCli {
    #[arg(
        short,
        long,
        help = "Show detailed output",
        global = true,
        conflicts_with = "quiet"
    )]
    pub verbose: bool,
    #[arg(short, long, help = "Suppress phpx output", global = true)]
    pub quiet: bool,
    #[command(subcommand)]
    pub command: Option<CommandCli>,
    /// A bare `phpx script.php` behaves like `phpx run script.php`.
    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Run a PHP script with inline dependencies",
        override_usage = "phpx run [OPTIONS] <SCRIPT> [-- ARGS...]"
    )]
    Run(RunArgs),
    #[command(
        about = "Run a Composer package's binary",
        override_usage = "phpx tool [OPTIONS] <TOOL> [-- ARGS...]"
    )]
    Tool(ToolArgs),
    #[command(about = "Inspect or clean the phpx cache", subcommand)]
    Cache(CacheCommand),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[arg(value_name = "SCRIPT", help = "Script to run, or - for stdin")]
    pub script: Option<String>,
    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Arguments passed to the script"
    )]
    pub args: Vec<String>,

    #[arg(long, help = "PHP version constraint (overrides the script)")]
    pub php: Option<String>,
    #[arg(long, help = "Comma-separated packages to add")]
    pub packages: Option<String>,
    #[arg(long, help = "Comma-separated PHP extensions")]
    pub extensions: Option<String>,

    #[command(flatten)]
    pub security: SecurityArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ToolArgs {
    #[arg(
        value_name = "TOOL",
        help = "Tool to run: name, name@version, or name:constraint"
    )]
    pub tool: String,
    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Arguments passed to the tool"
    )]
    pub args: Vec<String>,

    #[arg(long, help = "PHP version constraint")]
    pub php: Option<String>,
    #[arg(long, help = "Comma-separated PHP extensions")]
    pub extensions: Option<String>,
    #[arg(long, help = "Explicit binary name when it differs from the package")]
    pub from: Option<String>,

    #[command(flatten)]
    pub security: SecurityArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SecurityArgs {
    #[arg(long, help = "Enable sandboxing (restricts filesystem access)")]
    pub sandbox: bool,
    #[arg(long, help = "Block all network access")]
    pub offline: bool,
    #[arg(
        long = "allow-host",
        value_name = "HOSTS",
        help = "Allowed hosts (comma-separated, *.wildcards supported)"
    )]
    pub allow_host: Option<String>,
    #[arg(
        long = "allow-read",
        value_name = "PATHS",
        help = "Additional readable paths (comma-separated)"
    )]
    pub allow_read: Option<String>,
    #[arg(
        long = "allow-write",
        value_name = "PATHS",
        help = "Additional writable paths (comma-separated)"
    )]
    pub allow_write: Option<String>,
    #[arg(
        long = "allow-env",
        value_name = "VARS",
        help = "Environment variables to pass through (comma-separated)"
    )]
    pub allow_env: Option<String>,
    #[arg(long, default_value_t = 128, help = "Memory limit in MB")]
    pub memory: u32,
    #[arg(long, default_value_t = 30, help = "Execution timeout in seconds")]
    pub timeout: u64,
    #[arg(long, default_value_t = 30, help = "CPU time limit in seconds")]
    pub cpu: u32,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    #[command(about = "Print the cache directory")]
    Dir,
    #[command(about = "Remove cached artifacts")]
    Clean(CacheCleanArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CacheCleanArgs {
    #[arg(
        value_name = "TARGET",
        default_value = "tools",
        help = "What to remove: php, deps, tools, index, composer, or all"
    )]
    pub target: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_script_parses_as_implicit_run() {
        let cli = PhpxCli::try_parse_from(["phpx", "script.php", "--flag", "value"])
            .expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.run.script.as_deref(), Some("script.php"));
        assert_eq!(cli.run.args, vec!["--flag", "value"]);
    }

    #[test]
    fn run_subcommand_collects_flags_and_args() {
        let cli = PhpxCli::try_parse_from([
            "phpx",
            "run",
            "--php",
            ">=8.2",
            "--offline",
            "script.php",
            "one",
            "two",
        ])
        .expect("parse");
        match cli.command {
            Some(CommandCli::Run(run)) => {
                assert_eq!(run.script.as_deref(), Some("script.php"));
                assert_eq!(run.php.as_deref(), Some(">=8.2"));
                assert!(run.security.offline);
                assert_eq!(run.args, vec!["one", "two"]);
            }
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn tool_subcommand_parses_spec_and_limits() {
        let cli = PhpxCli::try_parse_from([
            "phpx",
            "tool",
            "phpstan@1.10.0",
            "--",
            "analyze",
            "src/",
        ])
        .expect("parse");
        match cli.command {
            Some(CommandCli::Tool(tool)) => {
                assert_eq!(tool.tool, "phpstan@1.10.0");
                assert_eq!(tool.args, vec!["analyze", "src/"]);
                assert_eq!(tool.security.memory, 128);
                assert_eq!(tool.security.timeout, 30);
            }
            other => panic!("expected tool command, got {other:?}"),
        }
    }

    #[test]
    fn cache_clean_defaults_to_tools() {
        let cli = PhpxCli::try_parse_from(["phpx", "cache", "clean"]).expect("parse");
        match cli.command {
            Some(CommandCli::Cache(CacheCommand::Clean(args))) => {
                assert_eq!(args.target, "tools");
            }
            other => panic!("expected cache clean, got {other:?}"),
        }
    }
}
