// Gantry CLI
// Command-line front-end for the gantry pipeline scheduler

mod commands;

use commands::Context;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::io;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gantry", version, about = "Container pipeline scheduler")]
struct Cli {
    /// Definition file (default: gantry.def.yml, then docker-compose.yml)
    #[arg(short = 'f', long = "file", global = true, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Environment file (default: gantry.env.yml when present)
    #[arg(short = 'e', long = "env", global = true, value_name = "FILE")]
    env: Option<PathBuf>,

    /// Use wharfer even when docker is on the PATH
    #[arg(long, global = true)]
    force_wharfer: bool,

    /// Verbose diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Prepare containers, images and the network, then run the pipeline
    Up {
        /// Restrict the run to these steps and their dependencies
        steps: Vec<String>,

        /// Pull images even when they are present locally
        #[arg(long)]
        force_pull: bool,
    },

    /// Kill and remove every container and the network
    Down,

    /// Build the images that carry build instructions
    Build,

    /// Pull the images that are not built locally
    Pull,

    /// Run the pipeline without the preparation phases
    Start {
        /// Restrict the run to these steps and their dependencies
        steps: Vec<String>,
    },

    /// Kill running containers
    Kill,

    /// Remove stopped containers
    Rm,

    /// Stream container logs
    Logs {
        /// Print the current logs and return instead of following
        #[arg(long)]
        no_follow: bool,

        /// Restrict to these steps
        steps: Vec<String>,
    },

    /// List all services and steps
    List,

    /// Print the computed stage order
    Steps,

    /// Render the dependency graph in dot format
    Dot {
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Print the version
    Version,

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: CompletionShell,
    },

    /// Preprocessor utilities
    Preprocessor {
        #[command(subcommand)]
        command: PreprocessorCommand,
    },
}

#[derive(Debug, Subcommand)]
enum PreprocessorCommand {
    /// Expand directives and substitutions in a file and print the result
    Apply {
        file: PathBuf,
    },

    /// List the available directives
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporting: {}", e);
    }
    init_logging(cli.verbose);

    let ctx = Context {
        file: cli.file,
        env: cli.env,
        force_wharfer: cli.force_wharfer,
    };

    let exit_code = match cli.command {
        Command::Up { steps, force_pull } => commands::up(&ctx, steps, force_pull).await,
        Command::Down => commands::down(&ctx).await,
        Command::Build => commands::phase(&ctx, gantry_core::Phase::BuildImages).await,
        Command::Pull => commands::phase(&ctx, gantry_core::Phase::PullImages).await,
        Command::Start { steps } => commands::start(&ctx, steps).await,
        Command::Kill => commands::phase(&ctx, gantry_core::Phase::KillContainers).await,
        Command::Rm => commands::phase(&ctx, gantry_core::Phase::RemoveContainers).await,
        Command::Logs { no_follow, steps } => commands::logs(&ctx, steps, !no_follow).await,
        Command::List => commands::list(&ctx),
        Command::Steps => commands::steps(&ctx),
        Command::Dot { output } => commands::dot(&ctx, output.as_deref()),
        Command::Version => {
            println!("gantry {}", env!("CARGO_PKG_VERSION"));
            0
        }
        Command::Completion { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(Shell::from(shell), &mut command, "gantry", &mut io::stdout());
            0
        }
        Command::Preprocessor { command } => match command {
            PreprocessorCommand::Apply { file } => commands::preprocessor_apply(&ctx, &file),
            PreprocessorCommand::List => commands::preprocessor_list(),
        },
    };

    process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "gantry=debug" } else { "gantry=info" })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}
