mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::WardenConfig;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Multi-tenant admin API backend")]
#[command(version)]
struct Cli {
    /// Path to the Warden config directory (default: ~/.warden)
    #[arg(long, global = true, env = "WARDEN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the database
    Init,

    /// Apply schema migrations and seed the permission catalog
    Migrate,

    /// Create a platform administrator
    CreateAdmin {
        username: String,
        #[arg(long)]
        email: Option<String>,
        /// Password (or set WARDEN_ADMIN_PASSWORD). Prompted when absent.
        #[arg(long, env = "WARDEN_ADMIN_PASSWORD")]
        password: Option<String>,
    },

    /// Start the HTTP API
    Serve {
        /// Override `server.listen_addr`
        #[arg(long)]
        listen: Option<String>,
    },

    /// Show current configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warden=info".parse()?)
                .add_directive("audit=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let base_dir = match cli.config_dir {
        Some(ref dir) => dir.clone(),
        None => WardenConfig::default_base_dir()?,
    };

    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Init => rt.block_on(commands::init::run(&base_dir)),
        Commands::Migrate => rt.block_on(commands::migrate::run(&base_dir)),
        Commands::CreateAdmin {
            ref username,
            ref email,
            ref password,
        } => rt.block_on(commands::create_admin::run(
            &base_dir,
            username,
            email.clone(),
            password,
        )),
        Commands::Serve { listen } => rt.block_on(commands::serve::run(&base_dir, listen)),
        Commands::Config => commands::config::run(&base_dir),
    }
}
