//! rollgate: health-gated rolling deployments.
//!
//! # Usage
//!
//! ```text
//! rollgate init
//! rollgate plan   --env staging --type full --image chain-node=reg/chain:1.4 ...
//! rollgate deploy --env production --type backend --image backend=reg/api:2.0
//! rollgate backups --env production
//! ```
//!
//! Exit status: 0 success, 1 hard failure, 3 partial failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Selection;

#[derive(Parser)]
#[command(
    name = "rollgate",
    about = "Zero-downtime rolling deployments with health-gated promotion",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to rollgate.toml.
    #[arg(long, global = true, default_value = "rollgate.toml")]
    config: PathBuf,

    /// Log output format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up, roll out, and verify every target of a deployment type.
    Deploy {
        #[command(flatten)]
        selection: Selection,

        /// Report format written to stdout.
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Deploy even if the pre-deployment backup fails.
        #[arg(long, conflicts_with = "no_backup")]
        force_backup: bool,

        /// Skip the pre-deployment backup.
        #[arg(long)]
        no_backup: bool,

        /// Keep going after a target fails instead of aborting the run.
        #[arg(long)]
        best_effort: bool,

        /// Leave failed targets on the new image.
        #[arg(long)]
        no_rollback: bool,
    },
    /// Print the resolved plan without touching the cluster.
    Plan {
        #[command(flatten)]
        selection: Selection,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List recorded backups, newest first.
    Backups {
        /// Only backups of this environment's namespace.
        #[arg(long)]
        env: Option<String>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Write a starting rollgate.toml.
    Init {
        #[arg(short, long, default_value = "rollgate.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match cli.command {
        Commands::Deploy {
            selection,
            format,
            force_backup,
            no_backup,
            best_effort,
            no_rollback,
        } => {
            let options = commands::deploy::DeployOptions {
                format,
                force_backup,
                no_backup,
                overrides: commands::Overrides {
                    best_effort,
                    no_rollback,
                },
            };
            commands::deploy::deploy(&cli.config, &selection, options).await
        }
        Commands::Plan { selection, format } => {
            commands::plan::plan(&cli.config, &selection, format).map(|()| 0)
        }
        Commands::Backups { env, format } => {
            commands::backups::list(&cli.config, env.as_deref(), format).map(|()| 0)
        }
        Commands::Init { output, force } => commands::init::init(&output, force).map(|()| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
