//! Chimney CLI (chimneyctl)
//!
//! Talks to a running chimneyd over its control socket.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use libchimney::control::{ControlClient, DEFAULT_SOCKET_PATH};
use libchimney::{ConnectionProfile, ConnectionState, StatusSnapshot};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chimneyctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chimney CLI - control the proxy-backed VPN tunnel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Control socket of the daemon
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH, global = true)]
    socket: PathBuf,

    /// Print raw JSON snapshots
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tunnel
    Connect {
        #[command(flatten)]
        profile: ProfileArgs,

        /// Wait until the connection is up or has failed (seconds)
        #[arg(short, long)]
        wait: Option<u64>,
    },
    /// Stop the tunnel
    Disconnect,
    /// Show the current connection status
    Status,
    /// Print every status change until interrupted
    Watch,
    /// Manage the stored connection profile
    #[command(subcommand)]
    Profile(ProfileCommands),
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Validate and store a connection profile
    Save {
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Show the stored connection profile
    Show {
        /// Show the proxy password
        #[arg(long)]
        show_secrets: bool,
    },
}

/// Connection profile fields; a connect without them uses the stored profile
#[derive(Args, Default)]
struct ProfileArgs {
    /// TCP proxy endpoint, e.g. socks5://proxy.example.com:1080
    #[arg(long)]
    tcp_proxy: Option<String>,

    /// UDP proxy endpoint
    #[arg(long)]
    udp_proxy: Option<String>,

    /// DNS server address
    #[arg(long)]
    dns: Option<String>,

    /// Proxy user name
    #[arg(long)]
    user: Option<String>,

    /// Proxy password (prefer the CHIMNEY_PROXY_PASS environment variable)
    #[arg(long, env = "CHIMNEY_PROXY_PASS", hide_env_values = true)]
    pass: Option<String>,
}

impl ProfileArgs {
    fn is_empty(&self) -> bool {
        self.tcp_proxy.is_none() && self.udp_proxy.is_none() && self.dns.is_none()
    }

    fn to_profile(&self) -> ConnectionProfile {
        ConnectionProfile::new(
            self.tcp_proxy.clone().unwrap_or_default(),
            self.udp_proxy.clone().unwrap_or_default(),
            self.dns.clone().unwrap_or_default(),
        )
        .with_credentials(
            self.user.clone().unwrap_or_default(),
            self.pass.clone().unwrap_or_default(),
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let client = ControlClient::new(&cli.socket);

    match &cli.command {
        Commands::Connect { profile, wait } => {
            let profile = if profile.is_empty() { None } else { Some(profile.to_profile()) };
            match wait {
                Some(secs) => connect_and_wait(&client, profile, Duration::from_secs(*secs), cli.json).await,
                None => {
                    client.connect(profile).await.context("connect failed")?;
                    println!("Connect requested");
                    Ok(())
                }
            }
        }
        Commands::Disconnect => {
            client.disconnect().await.context("disconnect failed")?;
            println!("Disconnect requested");
            Ok(())
        }
        Commands::Status => {
            let snapshot = client.status().await.context("status query failed")?;
            print_snapshot(&snapshot, cli.json)
        }
        Commands::Watch => {
            let mut subscription = client.subscribe().await.context("subscribe failed")?;
            while let Some(snapshot) = subscription.next().await? {
                print_snapshot(&snapshot, cli.json)?;
            }
            Ok(())
        }
        Commands::Profile(ProfileCommands::Save { profile }) => {
            let id = client
                .save_profile(profile.to_profile())
                .await
                .context("saving profile failed")?;
            println!("Saved profile {}", id);
            Ok(())
        }
        Commands::Profile(ProfileCommands::Show { show_secrets }) => {
            match client.load_profile().await.context("loading profile failed")? {
                Some(profile) => print_profile(&profile, *show_secrets),
                None => println!("No profile stored"),
            }
            Ok(())
        }
    }
}

async fn connect_and_wait(
    client: &ControlClient,
    profile: Option<ConnectionProfile>,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    // Subscribe first so no transition is missed
    let mut subscription = client.subscribe().await.context("subscribe failed")?;
    let current = match subscription.next_within(timeout).await? {
        Some(snapshot) => snapshot,
        None => bail!("daemon closed the connection"),
    };
    if current.state == ConnectionState::Connected {
        // A connect now would be ignored
        return print_snapshot(&current, json);
    }
    let start = current.sequence;

    client.connect(profile).await.context("connect failed")?;

    loop {
        let Some(snapshot) = subscription.next_within(timeout).await? else {
            bail!("daemon closed the connection");
        };
        if snapshot.sequence <= start {
            continue;
        }
        print_snapshot(&snapshot, json)?;

        match snapshot.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Stopped => bail!("connection failed: {}", snapshot.message),
            _ => {}
        }
    }
}

fn print_snapshot(snapshot: &StatusSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        println!("{:<16} {}", snapshot.state.to_string(), snapshot.message);
    }
    Ok(())
}

fn print_profile(profile: &ConnectionProfile, show_secrets: bool) {
    println!("TCP proxy:  {}", profile.tcp_proxy_url);
    println!("UDP proxy:  {}", profile.udp_proxy_url);
    println!("DNS:        {}", profile.dns_address);
    if profile.has_credentials() {
        println!("User:       {}", profile.user);
        let pass = if show_secrets { profile.pass.as_str() } else { "********" };
        println!("Password:   {}", pass);
    }
}
