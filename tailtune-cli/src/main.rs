//! tailtune CLI: split manifests, train probe heads and run hyperparameter
//! studies from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// tailtune: experiment control plane for long-tail classification
#[derive(Parser, Debug)]
#[command(name = "tailtune", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Assign every manifest sample to train/val/test without group leakage
    Split {
        /// Write the annotated manifest here instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the assignment summary without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the modulated class-weight vector over the training schedule
    Weights {
        /// Schedule length (defaults to training.epochs)
        #[arg(long)]
        epochs: Option<usize>,
        /// Exponent on inverse frequency
        #[arg(long)]
        tau: Option<f64>,
        /// Curve: linear, cosine or step
        #[arg(long)]
        curve: Option<String>,
        /// Number of epochs to print, evenly spaced
        #[arg(long, default_value = "6")]
        rows: usize,
    },
    /// Train one run with the configured settings
    Train {
        /// Run name; re-using a name resumes its checkpoint
        #[arg(short, long, default_value = "default")]
        name: String,
        /// Override a training parameter (key=value, repeatable)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
    /// Run or continue a hyperparameter study
    Optimize {
        /// Study name (defaults to study.name)
        #[arg(short, long)]
        name: Option<String>,
        /// Total number of finished trials to reach
        #[arg(long)]
        n_trials: Option<usize>,
        /// Wall-clock budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Inspect stored studies
    Study {
        #[command(subcommand)]
        action: StudyAction,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum StudyAction {
    /// List stored studies
    List,
    /// Show trial counts, the best trial and every trial of a study
    Show {
        /// Study name
        name: String,
        /// Also show the best trial per value of this parameter
        #[arg(long)]
        by: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export the best trial's parameters as TOML
    ExportBest {
        /// Study name
        name: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file locations that are consulted
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = tailtune_core::load_config(Some(&workspace), cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let paths = config.paths.resolve(&workspace);

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = paths.logs_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tailtune.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let ctx = commands::Context {
        workspace,
        explicit_config: cli.config,
        config,
        paths,
    };
    commands::handle_command(cli.command, &ctx).await
}
