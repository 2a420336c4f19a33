mod buffer;
mod cmd_config;
mod config;
mod context;
mod debounce;
mod filter;
mod frontend;
mod protocol;
mod render;
mod transport;
mod view;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::context::StreamContext;
use crate::filter::{FilterPatch, FilterState};
use crate::frontend::Frontend;
use crate::protocol::{Direction, Role};
use crate::transport::WsConnector;

#[derive(Parser)]
#[command(name = "framescope", about = "Live IEC 60870-5-104 frame stream viewer", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Stream endpoint (overrides config and FRAMESCOPE_URL)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Frames kept in memory
    #[arg(long, global = true)]
    capacity: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive viewer (default)
    Watch,
    /// Print matching frames as they arrive
    Tail {
        #[arg(long)]
        role: Option<Role>,
        #[arg(long = "dir")]
        direction: Option<Direction>,
        /// Type identifier
        #[arg(long)]
        ti: Option<String>,
        /// Cause of transmission
        #[arg(long)]
        cot: Option<String>,
        /// Substring of the information object addresses
        #[arg(long)]
        ioa: Option<String>,
        /// Case-insensitive text anywhere in the frame
        #[arg(long)]
        search: Option<String>,
        /// Print each frame as JSON
        #[arg(long)]
        json: bool,
        /// Exit after this many frames
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create default settings.json
    Init,
    /// Show the effective configuration
    Show,
    /// Set a config value (dot notation: stream.url)
    Set {
        /// Config key path
        key: String,
        /// Value to set
        value: String,
    },
    /// Print config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    let frontend: Box<dyn Frontend> = match cli.command.unwrap_or(Commands::Watch) {
        Commands::Config { action } => return cmd_config::run(&action, &config_path),
        Commands::Watch => {
            // The screen belongs to the viewer, so logs go to a file
            init_file_logging()?;
            Box::new(frontend::tui::TuiFrontend)
        }
        Commands::Tail {
            role,
            direction,
            ti,
            cot,
            ioa,
            search,
            json,
            limit,
        } => {
            init_stderr_logging();
            let mut filter = FilterState::default();
            filter.apply(FilterPatch {
                role: Some(role),
                direction: Some(direction),
                type_id: ti,
                cause: cot,
                ioa,
                free_text: search,
                freeze: None,
            });
            Box::new(frontend::tail::TailFrontend {
                filter,
                json,
                limit,
            })
        }
    };

    let config = load_config(&config_path, cli.url, cli.capacity)?;
    info!("Config loaded");

    let ctx = Arc::new(StreamContext::new(config, Arc::new(WsConnector)));
    let result = frontend.run(ctx.clone()).await;
    ctx.shutdown();
    result
}

/// File, then environment, then command-line flags; validated last.
fn load_config(path: &Path, url: Option<String>, capacity: Option<usize>) -> Result<AppConfig> {
    let mut config = AppConfig::load_or_default(path)?.with_env_overrides()?;
    if let Some(url) = url {
        config.stream.url = url;
    }
    if let Some(capacity) = capacity {
        config.stream.capacity = capacity;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration ({}): {e}", path.display()))?;
    Ok(config)
}

fn init_file_logging() -> Result<()> {
    let log_dir = config::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("framescope.log"))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}
