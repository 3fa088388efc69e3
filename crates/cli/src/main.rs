use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chatbridge")]
#[command(
    about = "Relay messages between a Telegram chat and a Discord channel",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a template config to fill in.
    Init {
        /// Config file path (default: CHATBRIDGE_CONFIG_PATH or ~/.chatbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Validate the config (tokens present, routes consistent) and print the route table.
    Check {
        /// Config file path (default: CHATBRIDGE_CONFIG_PATH or ~/.chatbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bridge until interrupted. Tokens may also come from TELEGRAM_BOT_TOKEN / DISCORD_BOT_TOKEN.
    Run {
        /// Config file path (default: CHATBRIDGE_CONFIG_PATH or ~/.chatbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP server port (health and Telegram webhook); enables the server.
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("chatbridge {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, port }) => {
            if let Err(e) = run_bridge(config, port).await {
                log::error!("bridge failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(bridge::config::default_config_path);
    bridge::init::init_config_dir(&path)?;
    println!("config at {} (fill in bot tokens and routes)", path.display());
    Ok(())
}

fn run_check(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = bridge::config::load_config(config_path)?;
    let settings = config.validate()?;
    println!("config ok: {}", path.display());
    for (src, dst) in settings.routes.entries() {
        println!(
            "  {} {} -> {} {}",
            src.platform, src.channel_id, dst.platform, dst.channel_id
        );
    }
    if let Some(ref url) = config.telegram.webhook_url {
        println!("  telegram webhook: {}", url);
    }
    Ok(())
}

async fn run_bridge(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = bridge::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
        config.server.enabled = true;
    }
    log::info!("starting bridge with config {}", path.display());
    bridge::runtime::run_bridge(config).await
}
