use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use spawnwatch_api::{parse_namespaces, Hub, HubConfig};
use spawnwatch_core::{EventView, PodView};
use spawnwatch_reflector::Health;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "spawnwatchctl", version, about = "Reflect user pods and their events")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespaces to watch, comma separated ("*" or empty for all)
    #[arg(long = "ns", env = "SPAWNWATCH_NAMESPACES", global = true)]
    namespaces: Option<String>,

    /// Label selector for user pods
    #[arg(long = "pod-selector", env = "SPAWNWATCH_POD_SELECTOR", global = true)]
    pod_selector: Option<String>,

    /// Do not reflect events
    #[arg(long = "no-events", action = ArgAction::SetTrue, global = true)]
    no_events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep reflectors running until Ctrl-C or a fatal failure
    Run {
        /// Seconds between status log lines
        #[arg(long = "status-every", default_value_t = 30)]
        status_every: u64,
    },
    /// Print reflected pods
    Pods {
        /// Only this namespace
        #[arg(long = "namespace", short = 'n')]
        namespace: Option<String>,
    },
    /// Print events for one pod, oldest first
    Events {
        #[arg(long = "pod")]
        pod: String,
        #[arg(long = "namespace", short = 'n')]
        namespace: String,
        /// Only events after the one with this uid
        #[arg(long = "since")]
        since: Option<String>,
    },
    /// Print per-reflector status once every cache is ready
    Health,
}

fn init_tracing() {
    let env = std::env::var("SPAWNWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SPAWNWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SPAWNWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn hub_config(cli: &Cli) -> HubConfig {
    let mut config = HubConfig::from_env();
    if let Some(ns) = &cli.namespaces {
        config.namespaces = parse_namespaces(ns);
    }
    if let Some(sel) = &cli.pod_selector {
        config.pod_selector = sel.clone();
    }
    if cli.no_events {
        config.events_enabled = false;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = hub_config(&cli);
    info!(namespaces = ?config.namespaces, events = config.events_enabled, "starting hub");
    let mut hub = Hub::start(config).await?;

    let outcome = match &cli.command {
        Commands::Run { status_every } => run(&mut hub, Duration::from_secs((*status_every).max(1))).await,
        Commands::Pods { namespace } => hub
            .pods(namespace.as_deref())
            .map_err(anyhow::Error::from)
            .and_then(|pods| print_pods(cli.output, &pods.iter().map(|p| p.as_ref()).collect::<Vec<_>>())),
        Commands::Events { pod, namespace, since } => hub
            .events_for_pod(namespace, pod, since.as_deref())
            .map_err(anyhow::Error::from)
            .and_then(|events| print_events(cli.output, &events.iter().map(|e| e.as_ref()).collect::<Vec<_>>())),
        Commands::Health => print_health(cli.output, &hub.health()),
    };

    let report = hub.stop().await;
    if !report.aborted.is_empty() {
        warn!(aborted = report.aborted.len(), "some reflectors had to be aborted");
    }
    outcome
}

async fn run(hub: &mut Hub, every: Duration) -> Result<()> {
    let registry = hub.registry();
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            failure = hub.next_failure() => {
                match failure {
                    Some(f) => {
                        error!(reflector = %f.key, error = %f.error, "reflector failed; shutting down");
                        return Err(anyhow!("reflector {} failed: {}", f.key, f.error));
                    }
                    None => return Ok(()),
                }
            }
            _ = ticker.tick() => {
                let health = registry.health();
                let ready = health.reflectors.iter().filter(|r| r.status.ready).count();
                let objects: usize = health.reflectors.iter().map(|r| r.objects).sum();
                info!(reflectors = health.reflectors.len(), ready, objects, "status");
                for r in &health.reflectors {
                    tracing::debug!(reflector = %r.key, state = ?r.status.state, checkpoint = ?r.status.checkpoint, relists = r.status.relists, restarts = r.status.watch_restarts, "reflector status");
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping reflectors");
                return Ok(());
            }
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_pods(output: Output, pods: &[&PodView]) -> Result<()> {
    match output {
        Output::Json => print_json(pods),
        Output::Human => {
            println!("{:<16} {:<32} {:<10} {:<6} {:<8} {}", "NAMESPACE", "NAME", "PHASE", "READY", "RESTARTS", "NODE");
            for p in pods {
                let ready = format!("{}/{}", p.containers.iter().filter(|c| c.ready).count(), p.containers.len());
                let phase = if p.deleting { "Terminating" } else { p.phase.as_str() };
                println!(
                    "{:<16} {:<32} {:<10} {:<6} {:<8} {}",
                    p.key.namespace.as_deref().unwrap_or("-"),
                    p.key.name,
                    phase,
                    ready,
                    p.restarts(),
                    p.node_name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

fn print_events(output: Output, events: &[&EventView]) -> Result<()> {
    match output {
        Output::Json => print_json(events),
        Output::Human => {
            for e in events {
                println!(
                    "{} {:<8} {:<20} {}",
                    e.sort_key().format("%Y-%m-%dT%H:%M:%SZ"),
                    e.type_.as_deref().unwrap_or("-"),
                    e.reason.as_deref().unwrap_or("-"),
                    e.message.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
    }
}

fn print_health(output: Output, health: &Health) -> Result<()> {
    match output {
        Output::Json => print_json(health),
        Output::Human => {
            println!("{:<24} {:<9} {:<6} {:<10} {:<8} {}", "REFLECTOR", "STATE", "READY", "CHECKPOINT", "OBJECTS", "LAST ERROR");
            for r in &health.reflectors {
                println!(
                    "{:<24} {:<9} {:<6} {:<10} {:<8} {}",
                    r.key.to_string(),
                    format!("{:?}", r.status.state),
                    r.status.ready,
                    r.status.checkpoint.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                    r.objects,
                    r.status.last_error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "-".into())
                );
            }
            Ok(())
        }
    }
}
