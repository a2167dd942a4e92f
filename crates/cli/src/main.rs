mod session_commands;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    recibo_config::ReciboConfig,
    recibo_whatsapp::{BranchId, SessionManager, WsBridgeTransport},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "recibo", about = "Recibo: branch messaging sessions for receipt delivery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of the discovered one.
    #[arg(long, global = true, env = "RECIBO_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bridge websocket URL from the config.
    #[arg(long, global = true, env = "RECIBO_BRIDGE_URL")]
    bridge_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconnect every persisted branch and keep the sessions running.
    Serve,
    /// Obtain a pairing code for a branch and wait for the scan.
    Pair {
        #[arg(long)]
        branch: BranchId,
    },
    /// Show a branch's connection status.
    Status {
        #[arg(long)]
        branch: BranchId,
    },
    /// Send a message (optionally with an attachment) through a branch.
    Send {
        #[arg(long)]
        branch: BranchId,
        #[arg(long)]
        to: String,
        #[arg(short, long)]
        message: String,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Session management.
    Sessions {
        #[command(subcommand)]
        action: session_commands::SessionAction,
    },
    /// Session counters.
    Stats,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // Logs go to stderr so command output on stdout stays parseable.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ReciboConfig> {
    let mut config = match &cli.config {
        Some(path) => recibo_config::load_config(path)?,
        None => recibo_config::discover_and_load(),
    };
    if let Some(url) = &cli.bridge_url {
        config.whatsapp.bridge_url = url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "recibo starting");

    let config = load_config(&cli)?;
    let transport = Arc::new(WsBridgeTransport::new(config.whatsapp.bridge_url.clone()));
    let manager = SessionManager::new(&config.whatsapp, transport);

    match cli.command {
        Commands::Serve => session_commands::serve(manager).await,
        Commands::Pair { branch } => session_commands::pair(&manager, &branch).await,
        Commands::Status { branch } => session_commands::status(&manager, &branch).await,
        Commands::Send {
            branch,
            to,
            message,
            file,
        } => session_commands::send(&manager, &branch, &to, &message, file.as_deref()).await,
        Commands::Sessions { action } => session_commands::handle_sessions(&manager, action).await,
        Commands::Stats => session_commands::print_json(&manager.get_stats()?),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_send_with_attachment() {
        let cli = Cli::try_parse_from([
            "recibo",
            "send",
            "--branch",
            "lima-01",
            "--to",
            "51888888888",
            "-m",
            "Su boleta",
            "--file",
            "B001-1.pdf",
        ])
        .unwrap();
        match cli.command {
            Commands::Send { branch, file, .. } => {
                assert_eq!(branch.as_str(), "lima-01");
                assert_eq!(file, Some(PathBuf::from("B001-1.pdf")));
            },
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn rejects_unsafe_branch_ids() {
        assert!(Cli::try_parse_from(["recibo", "status", "--branch", "../etc"]).is_err());
    }

    #[test]
    fn config_flag_and_bridge_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recibo.toml");
        std::fs::write(&path, "[whatsapp]\nmax_reconnect_attempts = 2\n").unwrap();

        let cli = Cli::try_parse_from([
            "recibo",
            "--config",
            path.to_str().unwrap(),
            "--bridge-url",
            "ws://10.0.0.5:3210",
            "stats",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.whatsapp.max_reconnect_attempts, 2);
        assert_eq!(config.whatsapp.bridge_url, "ws://10.0.0.5:3210");
    }
}
