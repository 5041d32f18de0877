//! Rendezvous CLI
//!
//! Drives the punch engine over a simulated network and manages its
//! configuration file.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use rendezvous_core::sim::SimNetwork;
use rendezvous_core::{ClientData, Contact, NoClientData, PunchAdapter, Puncher};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use config::{Config, SimulationLayout};
use progress::{WaitSpinner, format_elapsed};

/// Rendezvous - DHT-assisted NAT traversal
#[derive(Parser)]
#[command(name = "rendezvous")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (overrides --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the three-node punch scenario on a simulated network
    Simulate {
        /// Also relay this text to the target as a message-only send
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        return init_config(&config_path, *force);
    }

    let config = Config::load_or_default(&config_path)?;

    let level = if cli.debug {
        "debug".to_string()
    } else if cli.verbose {
        "info".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Simulate { message } => {
            config.validate()?;
            simulate(&config, message).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => show_config(&config, &config_path)?,
            ConfigAction::Validate => {
                config.validate()?;
                println!("Configuration OK: {}", config_path.display());
            }
            ConfigAction::Init { .. } => {}
        },
    }

    Ok(())
}

/// Write a default configuration file
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Print the effective configuration as TOML
fn show_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        println!("# Loaded from {}", path.display());
    } else {
        println!("# Defaults ({} does not exist)", path.display());
    }
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Nodes of the simulated scenario
struct Scenario {
    // Transports only hold a weak reference to their network
    _network: Arc<SimNetwork>,
    rendezvous: Puncher,
    target: Puncher,
    originator: Puncher,
}

impl Scenario {
    fn build(config: &Config, layout: &SimulationLayout) -> anyhow::Result<Self> {
        let network = SimNetwork::new();
        let puncher_config = config.puncher.to_puncher_config();

        let rendezvous = Puncher::new(
            puncher_config.clone(),
            network.add_node(layout.rendezvous),
            network.dht(),
            Arc::new(NoClientData),
        )?;

        let target_adapter: Arc<dyn PunchAdapter> =
            Arc::new(|observed: SocketAddr, data: &ClientData| {
                tracing::info!("Target accepted punch from {} ({} keys)", observed, data.len());
                let mut reply = ClientData::new();
                reply.insert("greeting".to_string(), "hello from target".into());
                reply.insert("observed".to_string(), observed.to_string().into());
                Some(reply)
            });
        let target = Puncher::new(
            puncher_config.clone(),
            network.add_nat_node(layout.target, layout.target_mapped_port),
            network.dht(),
            target_adapter,
        )?;

        let originator = Puncher::new(
            puncher_config,
            network.add_nat_node(layout.originator, layout.originator_mapped_port),
            network.dht(),
            Arc::new(NoClientData),
        )?;

        Ok(Self {
            _network: network,
            rendezvous,
            target,
            originator,
        })
    }

    fn nodes(&self) -> [(&'static str, &Puncher); 3] {
        [
            ("rendezvous", &self.rendezvous),
            ("target", &self.target),
            ("originator", &self.originator),
        ]
    }
}

/// Run the three-node scenario
async fn simulate(config: &Config, message: Option<String>) -> anyhow::Result<()> {
    let layout = config.simulation.layout()?;
    tracing::info!(
        "Simulating target {} (NAT port {}), rendezvous {}, originator {} (NAT port {})",
        layout.target,
        layout.target_mapped_port,
        layout.rendezvous,
        layout.originator,
        layout.originator_mapped_port
    );

    let scenario = Scenario::build(config, &layout)?;
    scenario.rendezvous.start();
    scenario.target.start();
    scenario.originator.start();

    let started = Instant::now();
    let spinner = WaitSpinner::new("Waiting for the target to bind to a rendezvous...");
    let deadline = started + config.simulation.settle_timeout();
    while !scenario.target.operational() {
        if Instant::now() >= deadline {
            spinner.abandon_with_message("Target never became operational".to_string());
            print_stats(&scenario);
            shutdown(&scenario).await;
            anyhow::bail!(
                "Target had no operational rendezvous after {}",
                format_elapsed(config.simulation.settle_timeout())
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let rendezvous = scenario
        .target
        .rendezvous()
        .map_or_else(|| "<none>".to_string(), |c| c.to_string());
    spinner.finish_with_message(format!(
        "Target bound to {} after {}",
        rendezvous,
        format_elapsed(started.elapsed())
    ));

    let target_contact = Contact::from_address(layout.target);
    let mut via = None;
    let mut request = ClientData::new();
    request.insert("greeting".to_string(), "hello from originator".into());

    let punch_started = Instant::now();
    let reply = scenario
        .originator
        .punch("simulate", &target_contact, &mut via, Some(request))
        .await;

    println!();
    match &reply {
        Some(data) => {
            println!("Punch succeeded in {}", format_elapsed(punch_started.elapsed()));
            println!("  Via:       {}", describe(via.as_ref()));
            println!("  Target:    {} -> {}", target_contact.address(), target_contact.transport_addr());
            println!("  Reply:     {}", serde_json::to_string(data)?);
        }
        None => {
            println!("Punch failed after {}", format_elapsed(punch_started.elapsed()));
            println!("  Via:       {}", describe(via.as_ref()));
        }
    }

    if let Some(text) = message {
        let mut payload = ClientData::new();
        payload.insert("message".to_string(), text.into());
        let relayed = scenario
            .originator
            .send_message(layout.rendezvous, layout.target, payload)
            .await;
        match relayed {
            Some(data) => println!("Message relayed, reply: {}", serde_json::to_string(&data)?),
            None => println!("Message relay failed"),
        }
    }

    println!();
    print_stats(&scenario);
    shutdown(&scenario).await;

    if reply.is_none() {
        anyhow::bail!("Punch to {} failed", layout.target);
    }
    Ok(())
}

fn describe(contact: Option<&Contact>) -> String {
    contact.map_or_else(|| "<none>".to_string(), ToString::to_string)
}

fn print_stats(scenario: &Scenario) {
    println!("Stats:");
    for (name, node) in scenario.nodes() {
        println!("  {:<10} [{}] {}", name, node.phase(), node.stats());
    }
}

async fn shutdown(scenario: &Scenario) {
    for (_, node) in scenario.nodes() {
        node.destroy().await;
    }
}
