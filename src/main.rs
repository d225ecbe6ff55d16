use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use code_agent::config::AppConfig;
use code_agent::logging::{self, LogFormat};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "code-agent")]
#[command(version, about = "Turn a prompt into a running app inside a sandbox")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file (defaults to .code-agent/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, listen on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database
    Init {
        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Run the code agent once and print the job output as JSON
    Run {
        /// What to build
        prompt: String,

        /// Add the prompt to an existing project instead of creating one
        #[arg(long)]
        project_id: Option<String>,

        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            AppConfig::default_path(&cwd)
        }
    };
    let config = AppConfig::load(&config_path)?;

    let directive = logging::filter_directive(config.logging.filter.as_deref(), cli.verbose);
    let _guard = logging::init(cli.log_format, &directive, config.logging.dir.as_deref())?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(config, port, db_path, dev).await?;
        }
        Commands::Init { db_path } => cmd::cmd_init(&config, db_path)?,
        Commands::Run {
            prompt,
            project_id,
            db_path,
        } => {
            cmd::cmd_run(config, &prompt, project_id.as_deref(), db_path).await?;
        }
    }

    Ok(())
}
