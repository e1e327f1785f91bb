//! TCP tunnel server
//!
//! Accepts control connections from tunnel clients, opens a public listener
//! for every proxy they register and relays public traffic over work
//! connections the clients dial back.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcpfrp_auth::{AllowAll, Authenticator, JwtClaims, JwtValidator, StaticTokenAuthenticator};
use tcpfrp_control::{HeartbeatMode, ServerConfig, SessionManager};
use tcpfrp_proto::{DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};

const JWT_ISSUER: &str = "tcpfrp-server";
const JWT_AUDIENCE: &str = "tcpfrp-client";

/// TCP reverse-proxy tunnel server
#[derive(Parser, Debug)]
#[command(name = "tcpfrp-server")]
#[command(about = "Expose TCP services running behind NAT through public ports", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a JWT for client authentication
    GenerateToken {
        /// JWT secret (must match the server's --jwt-secret)
        #[arg(long, env = "TCPFRP_JWT_SECRET")]
        secret: String,

        /// Client name stored as the token subject
        #[arg(long, default_value = "client")]
        client: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address tunnel clients connect to (control and work connections)
    #[arg(long, env = "TCPFRP_CONTROL_ADDR", default_value = "0.0.0.0:7000")]
    control_addr: SocketAddr,

    /// IP address public proxy listeners bind on
    #[arg(long, env = "TCPFRP_BIND_ADDR", default_value = "0.0.0.0")]
    bind_addr: IpAddr,

    /// Shared client token (repeatable)
    #[arg(long = "token", env = "TCPFRP_TOKENS", value_delimiter = ',')]
    tokens: Vec<String>,

    /// JWT secret for authenticating clients
    #[arg(long, env = "TCPFRP_JWT_SECRET", conflicts_with = "tokens")]
    jwt_secret: Option<String>,

    /// Seconds without a heartbeat before a session is torn down
    #[arg(long, env = "TCPFRP_HEARTBEAT_TIMEOUT", default_value = "90")]
    heartbeat_timeout: u64,

    /// Ping clients every N seconds instead of waiting for client pings
    #[arg(long, env = "TCPFRP_SERVER_PING_INTERVAL")]
    server_ping_interval: Option<u64>,

    /// Seconds to wait for a client to open a requested work connection
    #[arg(long, env = "TCPFRP_WORK_TIMEOUT", default_value = "10")]
    work_timeout: u64,

    /// Largest accepted frame in bytes
    #[arg(long, env = "TCPFRP_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// Ports clients may claim (format: "10000-20000")
    #[arg(long, env = "TCPFRP_PORT_RANGE")]
    port_range: Option<String>,

    /// Seconds a graceful shutdown waits for active relays
    #[arg(long, env = "TCPFRP_DRAIN_TIMEOUT", default_value = "30")]
    drain_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TCPFRP_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn generate_token(secret: &str, client: &str, hours: i64) -> Result<()> {
    let claims = JwtClaims::new(
        client.to_string(),
        JWT_ISSUER.to_string(),
        JWT_AUDIENCE.to_string(),
        chrono::Duration::hours(hours),
    );

    let token = JwtValidator::encode(secret.as_bytes(), &claims)
        .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))?;

    println!("\nJWT token generated\n");
    println!("Client:    {}", client);
    println!("Valid for: {} hours", hours);
    println!("Expires:   {}", claims.exp_formatted());
    println!("\n{}", "=".repeat(70));
    println!("{}", token);
    println!("{}\n", "=".repeat(70));

    Ok(())
}

fn build_authenticator(args: &ServerArgs) -> Arc<dyn Authenticator> {
    if let Some(ref secret) = args.jwt_secret {
        info!("Client authentication: JWT");
        return Arc::new(
            JwtValidator::new(secret.as_bytes())
                .with_issuer(JWT_ISSUER.to_string())
                .with_audience(JWT_AUDIENCE.to_string()),
        );
    }

    if !args.tokens.is_empty() {
        info!("Client authentication: {} static token(s)", args.tokens.len());
        return Arc::new(StaticTokenAuthenticator::new(args.tokens.iter().cloned()));
    }

    warn!("No --token or --jwt-secret given, accepting every client");
    Arc::new(AllowAll)
}

fn build_config(args: &ServerArgs) -> Result<ServerConfig> {
    let mut config = ServerConfig::new(build_authenticator(args))
        .with_bind_address(args.bind_addr)
        .with_heartbeat_timeout(Duration::from_secs(args.heartbeat_timeout))
        .with_work_connection_timeout(Duration::from_secs(args.work_timeout))
        .with_max_frame_size(args.max_frame_size)
        .with_shutdown_drain_timeout(Duration::from_secs(args.drain_timeout));

    if let Some(interval) = args.server_ping_interval {
        config = config.with_heartbeat_mode(HeartbeatMode::ServerPings {
            interval: Duration::from_secs(interval),
        });
    }

    if let Some(ref range) = args.port_range {
        let (start, end) = parse_port_range(range)?;
        info!("Proxy port range: {}-{} ({} ports)", start, end, end - start + 1);
        config = config.with_allowed_ports(start..=end);
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return match command {
            Commands::GenerateToken {
                secret,
                client,
                hours,
            } => generate_token(&secret, &client, hours),
        };
    }

    let args = cli.server_args;
    init_logging(&args.log_level)?;

    info!("Starting tunnel server (protocol v{})", PROTOCOL_VERSION);
    let config = build_config(&args)?;
    let manager = SessionManager::new(config).context("Invalid server configuration")?;

    let control_addr = manager
        .start(args.control_addr)
        .await
        .with_context(|| format!("Failed to bind control address {}", args.control_addr))?;
    info!("Control endpoint: {}", control_addr);
    info!("Public listeners bind on {}", args.bind_addr);
    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, draining relays (Ctrl+C again to force)"),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    let graceful = manager.shutdown(true);
    tokio::pin!(graceful);
    tokio::select! {
        _ = &mut graceful => {}
        _ = signal::ctrl_c() => {
            warn!("Second shutdown signal, closing everything now");
            manager.shutdown(false).await;
        }
    }

    info!("Tunnel server stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn parse_port_range(range_str: &str) -> Result<(u16, u16)> {
    let (start, end) = range_str
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("Invalid port range format. Expected: START-END (e.g., 10000-20000)"))?;

    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid start port: {}", start))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid end port: {}", end))?;

    if start == 0 || start > end {
        return Err(anyhow::anyhow!("Port range must satisfy 1 <= START <= END"));
    }

    Ok((start, end))
}
