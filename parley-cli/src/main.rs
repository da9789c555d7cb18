use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use parley_core::ConversationId;

mod commands;
mod error;
mod scenario;

use error::CliResult;

#[derive(Parser, Debug)]
#[command(name = "parley", version)]
#[command(about = "Parley CLI - run and inspect multi-agent conversations")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario file until its conversation is archived
    Run {
        /// Scenario file (TOML)
        #[arg(long)]
        scenario: PathBuf,
        /// Store directory for transcripts and memory
        #[arg(long, default_value = ".parley")]
        store: PathBuf,
        /// Configuration file (TOML); PARLEY_* variables override it
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a stored transcript
    Transcript {
        id: ConversationId,
        #[arg(long, default_value = ".parley")]
        store: PathBuf,
        /// One JSON message per line
        #[arg(long)]
        json: bool,
    },
    /// Archive a stored conversation that never finished
    Terminate {
        id: ConversationId,
        #[arg(long, default_value = ".parley")]
        store: PathBuf,
    },
    /// List stored conversations
    List {
        #[arg(long, default_value = ".parley")]
        store: PathBuf,
    },
}

fn init_logging(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

async fn execute(command: Commands) -> CliResult<()> {
    let mut out = std::io::stdout().lock();
    match command {
        Commands::Run {
            scenario,
            store,
            config,
        } => {
            let config = commands::load_config(config.as_ref())?;
            commands::run(&scenario, &store, config, &mut out).await?;
        }
        Commands::Transcript { id, store, json } => {
            commands::transcript(&id, &store, json, &mut out).await?
        }
        Commands::Terminate { id, store } => commands::terminate(&id, &store, &mut out).await?,
        Commands::List { store } => commands::list(&store, &mut out)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "Command failed");
            ExitCode::FAILURE
        }
    }
}
