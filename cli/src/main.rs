use clap::{Parser, Subcommand};
use std::io::Write;
use std::process::ExitCode;
use tracing::error;
use uniroute_shared::Protocol;

mod api;
mod config;
mod error;
mod tunnel;

use api::ApiClient;
use config::Auth;
use error::{CliError, CliResult};
use tunnel::TunnelOptions;

#[derive(Parser)]
#[command(name = "uniroute")]
#[command(version = "0.1.0")]
#[command(about = "Expose local services through the UniRoute edge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store credentials for an edge server
    Login {
        /// Edge base URL, e.g. https://example.com
        #[arg(long, env = "UNIROUTE_SERVER")]
        server: String,

        /// Bearer token (prompted when omitted)
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove stored credentials
    Logout,
    /// Show the edge connection and local tunnel state
    Status,
    /// Expose a local HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Desired subdomain
        name: Option<String>,

        /// Route a verified custom hostname to this tunnel
        #[arg(long)]
        host: Option<String>,
    },
    /// Expose a local TCP service
    Tcp {
        port: u16,
        name: Option<String>,

        /// Desired public port from the edge's pool
        #[arg(long)]
        remote_port: Option<u16>,
    },
    /// Expose a local TCP service behind edge-terminated TLS
    Tls {
        port: u16,
        name: Option<String>,

        #[arg(long)]
        remote_port: Option<u16>,
    },
    /// Expose a local UDP service
    Udp {
        port: u16,
        name: Option<String>,

        #[arg(long)]
        remote_port: Option<u16>,
    },
    /// List tunnels and resumable claims
    List,
    /// Reconnect a previously opened tunnel by id
    Resume {
        /// Tunnel id from `uniroute list`
        id: String,
    },
    /// Manage custom domains
    Domain {
        #[command(subcommand)]
        command: DomainCommands,
    },
}

#[derive(Subcommand)]
enum DomainCommands {
    /// Register a hostname you own
    Add { hostname: String },
    /// List your domains
    List,
    /// Show one domain
    Show { id: String },
    /// Check the domain's DNS against the edge
    Verify { id: String },
    /// Delete a domain
    Remove { id: String },
    /// Bind a domain to one of your http tunnels
    Assign { id: String, tunnel_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(command: Commands) -> CliResult<()> {
    match command {
        Commands::Login { server, token } => login(server, token),
        Commands::Logout => {
            config::clear_auth()?;
            println!("Logged out.");
            Ok(())
        }
        Commands::Status => status().await,
        Commands::Http { port, name, host } => {
            let auth = require_auth()?;
            tunnel::run_tunnel(
                &auth,
                TunnelOptions {
                    protocol: Protocol::Http,
                    local_target: format!("127.0.0.1:{port}"),
                    desired_subdomain: name,
                    desired_host: host,
                    desired_port: None,
                    resume: None,
                },
            )
            .await
        }
        Commands::Tcp {
            port,
            name,
            remote_port,
        } => stream_tunnel(Protocol::Tcp, port, name, remote_port).await,
        Commands::Tls {
            port,
            name,
            remote_port,
        } => stream_tunnel(Protocol::Tls, port, name, remote_port).await,
        Commands::Udp {
            port,
            name,
            remote_port,
        } => stream_tunnel(Protocol::Udp, port, name, remote_port).await,
        Commands::List => list().await,
        Commands::Resume { id } => resume(id).await,
        Commands::Domain { command } => domain(command).await,
    }
}

fn login(server: String, token: Option<String>) -> CliResult<()> {
    let token = match token {
        Some(token) => token,
        None => prompt_token()?,
    };
    config::save_auth(&Auth {
        server: server.clone(),
        token,
    })?;
    println!("Credentials saved for {server}.");
    Ok(())
}

fn prompt_token() -> CliResult<String> {
    print!("Token: ");
    std::io::stdout()
        .flush()
        .map_err(|e| CliError::Other(e.into()))?;
    let mut token = String::new();
    std::io::stdin()
        .read_line(&mut token)
        .map_err(|e| CliError::Other(e.into()))?;
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(CliError::Other(anyhow::anyhow!("no token entered")));
    }
    Ok(token)
}

fn require_auth() -> CliResult<Auth> {
    config::load_auth()?.ok_or(CliError::Auth)
}

async fn status() -> CliResult<()> {
    let auth = require_auth()?;
    let client = ApiClient::new(&auth)?;

    println!("Server: {}", auth.server);
    match client.health().await {
        Ok(health) => {
            let active = health
                .get("active_tunnels")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            println!("Edge:   reachable ({active} active tunnels)");
        }
        Err(e) => println!("Edge:   unreachable ({e})"),
    }

    let state = config::load_state()?;
    if state.tunnels.is_empty() {
        println!("No locally known tunnels.");
    } else {
        println!("Local tunnel state:");
        for t in &state.tunnels {
            println!(
                "  {}  {}  {}  -> {}",
                t.tunnel_id, t.protocol, t.subdomain, t.local_target
            );
        }
    }
    Ok(())
}

async fn stream_tunnel(
    protocol: Protocol,
    port: u16,
    name: Option<String>,
    remote_port: Option<u16>,
) -> CliResult<()> {
    let auth = require_auth()?;
    tunnel::run_tunnel(
        &auth,
        TunnelOptions {
            protocol,
            local_target: format!("127.0.0.1:{port}"),
            desired_subdomain: name,
            desired_host: None,
            desired_port: remote_port,
            resume: None,
        },
    )
    .await
}

async fn list() -> CliResult<()> {
    let auth = require_auth()?;
    let client = ApiClient::new(&auth)?;
    let listing = client.list_tunnels().await?;

    let tunnels = listing
        .get("tunnels")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if tunnels.is_empty() {
        println!("No live tunnels.");
    } else {
        println!("Tunnels:");
        for t in &tunnels {
            println!(
                "  {}  {}  {}  [{}]",
                t.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
                t.get("protocol").and_then(|v| v.as_str()).unwrap_or("?"),
                t.get("subdomain").and_then(|v| v.as_str()).unwrap_or("?"),
                t.get("state").and_then(|v| v.as_str()).unwrap_or("?"),
            );
        }
    }

    let claims = listing
        .get("claims")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if !claims.is_empty() {
        println!("Resumable claims:");
        for c in &claims {
            println!(
                "  {}  {}  {}",
                c.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
                c.get("protocol").and_then(|v| v.as_str()).unwrap_or("?"),
                c.get("subdomain").and_then(|v| v.as_str()).unwrap_or("?"),
            );
        }
    }
    Ok(())
}

async fn resume(id: String) -> CliResult<()> {
    let auth = require_auth()?;
    let state = config::load_state()?;
    let record = state
        .tunnels
        .iter()
        .find(|t| t.tunnel_id == id)
        .ok_or_else(|| {
            CliError::Other(anyhow::anyhow!(
                "tunnel {id} not found in local state; open it again instead"
            ))
        })?;

    tunnel::run_tunnel(
        &auth,
        TunnelOptions {
            protocol: record.protocol,
            local_target: record.local_target.clone(),
            desired_subdomain: None,
            desired_host: None,
            desired_port: None,
            resume: Some(id),
        },
    )
    .await
}

async fn domain(command: DomainCommands) -> CliResult<()> {
    let auth = require_auth()?;
    let client = ApiClient::new(&auth)?;
    match command {
        DomainCommands::Add { hostname } => {
            let domain = client.add_domain(&hostname).await?;
            println!(
                "Added {} ({}). Point a CNAME at the edge, then run `uniroute domain verify`.",
                hostname,
                domain.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
            );
        }
        DomainCommands::List => {
            let listing = client.list_domains().await?;
            let domains = listing
                .get("domains")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if domains.is_empty() {
                println!("No custom domains.");
            }
            for d in &domains {
                print_domain(d);
            }
        }
        DomainCommands::Show { id } => {
            let domain = client.get_domain(&id).await?;
            print_domain(&domain);
        }
        DomainCommands::Verify { id } => {
            let domain = client.verify_domain(&id).await?;
            let ok = domain
                .get("dns_configured")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if ok {
                println!("DNS is configured correctly.");
            } else {
                println!("DNS does not point at the edge yet.");
            }
        }
        DomainCommands::Remove { id } => {
            client.remove_domain(&id).await?;
            println!("Domain removed.");
        }
        DomainCommands::Assign { id, tunnel_id } => {
            let domain = client.assign_domain(&id, &tunnel_id).await?;
            println!(
                "{} now routes to tunnel {}.",
                domain.get("hostname").and_then(|v| v.as_str()).unwrap_or("?"),
                tunnel_id,
            );
        }
    }
    Ok(())
}

fn print_domain(domain: &serde_json::Value) {
    println!(
        "  {}  {}  dns_configured={}  tunnel={}",
        domain.get("id").and_then(|v| v.as_str()).unwrap_or("?"),
        domain.get("hostname").and_then(|v| v.as_str()).unwrap_or("?"),
        domain
            .get("dns_configured")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        domain
            .get("tunnel_id")
            .and_then(|v| v.as_str())
            .unwrap_or("-"),
    );
}
