use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claude_bridge::config::Config;
use claude_bridge::router::{app, AppState};
use claude_bridge::tokens;

#[derive(Parser)]
#[command(name = "claude-bridge")]
#[command(about = "Anthropic Messages facade for chat backends without native tool calling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Start {
        /// Listener host (overrides HOST)
        #[arg(long)]
        host: Option<String>,

        /// Listener port (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate the environment configuration and exit
    Validate,
    /// Show version and build info
    Version,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Start { host, port }) => run_server(host, port).await,
        None => run_server(None, None).await,
        Some(Commands::Validate) => validate(),
        Some(Commands::Version) => show_version(),
    }
}

fn init_tracing() {
    if std::env::var("LOGGING_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
    {
        return;
    }

    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) => tracing_subscriber::EnvFilter::try_new(level)
            .unwrap_or_else(|_| "claude_bridge=info".into()),
        Err(_) => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "claude_bridge=info,tower_http=warn".into()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(host_override: Option<String>, port_override: Option<u16>) {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let host = host_override.unwrap_or_else(|| config.host.clone());
    let port = if config.auto_port {
        0
    } else {
        port_override.unwrap_or(config.port)
    };

    let ip = match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip,
        Err(err) => {
            eprintln!("configuration error: invalid HOST {host}: {err}");
            std::process::exit(1);
        }
    };
    let addr = SocketAddr::from((ip, port));

    tracing::info!(
        channels = config.channels.len(),
        numbered = config.numbered.len(),
        legacy = config.legacy.is_some(),
        "configuration loaded"
    );

    let state = AppState::new(config);
    let router = app(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {addr}: {err}");
            std::process::exit(2);
        }
    };
    if let Ok(local) = listener.local_addr() {
        tracing::info!("claude-bridge listening on {local}");
    }

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }

    tokens::shutdown();
}

fn validate() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("✗ configuration error: {err}");
            std::process::exit(1);
        }
    };

    println!("✓ {} channel(s)", config.channels.len());
    for channel in &config.channels {
        println!(
            "  - {} [{}] {} key={}",
            channel.name,
            channel.protocol.name(),
            channel.base_url,
            if channel.api_key.is_some() { "set" } else { "none" },
        );
    }
    println!("✓ {} numbered upstream(s)", config.numbered.len());
    for entry in &config.numbered {
        println!("  - {} -> {} @ {}", entry.name_model, entry.request_model, entry.base_url);
    }
    match &config.legacy {
        Some(legacy) => println!("✓ legacy upstream {}", legacy.base_url),
        None => println!("  (no legacy upstream)"),
    }
    println!("\n✓ Configuration valid");
}

fn show_version() {
    println!("claude-bridge {}", env!("CARGO_PKG_VERSION"));
    #[cfg(debug_assertions)]
    println!("Build: debug");
    #[cfg(not(debug_assertions))]
    println!("Build: release");
}

async fn shutdown_signal() {
    let ctrl_c = async { ctrl_c().await.expect("failed to listen for ctrl+c") };
    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
    tracing::info!("Received shutdown signal, draining connections...");
}
