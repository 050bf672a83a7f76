mod cli;

use anyhow::Result;
use campsite::config::Config;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "campsite", about = "Camping-spot marketplace client")]
pub struct Args {
    #[arg(long, env = "CAMPSITE_API_URL", help = "Backend API base URL")]
    pub api_url: Option<String>,

    #[arg(long, env = "CAMPSITE_AUTH_URL", help = "Auth provider base URL")]
    pub auth_url: Option<String>,

    #[arg(long, env = "CAMPSITE_ANON_KEY", hide_env_values = true, help = "Auth provider public key")]
    pub anon_key: Option<String>,

    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Directory for local storage and the session journal")]
    pub storage_dir: Option<PathBuf>,

    #[arg(short, long, help = "Debug logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<cli::Command>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose { "campsite=debug" } else { "campsite=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_overrides(
        args.api_url.as_deref(),
        args.auth_url.as_deref(),
        args.anon_key.as_deref(),
    );
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config error {}", e);
        }
        return Err(anyhow::anyhow!("Invalid configuration ({} errors)", errors.len()));
    }

    let storage_dir = args
        .storage_dir
        .clone()
        .unwrap_or_else(|| config.storage.resolve_dir());
    std::fs::create_dir_all(&storage_dir)?;

    let session_id = uuid::Uuid::new_v4().to_string();
    let ctx = cli::Context::build(config, storage_dir, &session_id)?;

    if let Err(e) = ctx.sessions.init_auth() {
        tracing::warn!(error = %e, "could not restore session");
    }

    match args.command {
        None | Some(cli::Command::Shell) => cli::run_repl(ctx),
        Some(command) => cli::dispatch(&ctx, command),
    }
}
