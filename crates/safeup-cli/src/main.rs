use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;

use completion::CliCompletionShell;
use dispatch::run_cli;
use render::resolve_output_style;

#[derive(Parser, Debug)]
#[command(name = "safeup")]
#[command(about = "Staged upgrades, snapshots and rollbacks for a file-based site", long_about = None)]
struct Cli {
    /// Live site root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Config file (defaults to <root>/user/config/safeup.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Disable badges and progress bars.
    #[arg(long, global = true)]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report pending plugin/theme updates and dependency conflicts.
    Preflight {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        target: Option<String>,
    },
    /// Swap an extracted release in, keeping a backup of the live tree.
    Promote {
        extracted: PathBuf,
        target_version: String,
        #[arg(long = "ignore", value_name = "PATH")]
        ignore: Vec<String>,
    },
    /// Restore a recorded backup (latest when no id is given).
    Rollback {
        id: Option<String>,
        #[arg(long)]
        list: bool,
        #[arg(long)]
        yes: bool,
    },
    /// Record a manual snapshot of the live tree.
    Snapshot {
        #[arg(long)]
        label: Option<String>,
    },
    /// Finish or reverse an interrupted swap.
    Recover {
        /// Also remove an operation lock left by a crashed process.
        #[arg(long)]
        unlock: bool,
    },
    /// Inspect a Flex user directory.
    Flex {
        #[command(subcommand)]
        command: FlexCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum FlexCommands {
    Reindex {
        #[command(flatten)]
        target: FlexTarget,
    },
    Find {
        #[command(flatten)]
        target: FlexTarget,
        query: String,
        /// Lookup fields in priority order (default: username, email).
        #[arg(long = "field", value_name = "FIELD")]
        fields: Vec<String>,
    },
    Load {
        #[command(flatten)]
        target: FlexTarget,
        key: String,
    },
    Delete {
        #[command(flatten)]
        target: FlexTarget,
        key: String,
    },
}

#[derive(Args, Debug, Clone)]
struct FlexTarget {
    folder: PathBuf,
    /// Compiled index file (defaults to <folder>/.index.json).
    #[arg(long)]
    index: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = RowFormat::Yaml)]
    format: RowFormat,
    /// Rows live in <folder>/<key>/item.<ext> instead of <folder>/<key>.<ext>.
    #[arg(long)]
    nested: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum RowFormat {
    Yaml,
    Json,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let style = resolve_output_style(!cli.plain, std::io::stdout().is_terminal());

    match run_cli(cli, style) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
