use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vswitch::capture::spawn_port;
use vswitch::config::{self, Config};
use vswitch::dataplane::{PacketFilter, Switch};
use vswitch::telemetry::init_logging;

/// Period of table aging, NAT reclaim and TCP timers
const TICK_INTERVAL: Duration = Duration::from_millis(20);
/// Period of the metrics summary in the log
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "vswitch")]
#[command(about = "A user-space L2/L3 software switch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the switch
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config {
            action: ConfigAction::Generate { config, output },
        } => {
            init_logging(None);
            cmd_config_generate(&config, &output)
        }
        Commands::Config {
            action: ConfigAction::Validate { config },
        } => {
            init_logging(None);
            cmd_config_validate(&config)
        }
        Commands::Run { config } => cmd_run(&config),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn load_validated(path: &Path) -> Result<Config, String> {
    let config = config::load(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let report = config::validate(&config);
    report.print_diagnostics();
    if report.has_errors() {
        return Err(format!(
            "{}: {} error(s) found",
            path.display(),
            report.errors.len()
        ));
    }
    Ok(config)
}

fn cmd_config_generate(config_path: &Path, output: &Path) -> Result<(), String> {
    let config = load_validated(config_path)?;
    let lock = config::generate_lock(&config);
    let text = toml::to_string_pretty(&lock).map_err(|e| format!("Failed to serialize lock: {}", e))?;
    std::fs::write(output, text).map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;
    println!("Generated {}", output.display());
    Ok(())
}

fn cmd_config_validate(config_path: &Path) -> Result<(), String> {
    load_validated(config_path)?;
    println!("{} is valid", config_path.display());
    Ok(())
}

fn cmd_run(config_path: &Path) -> Result<(), String> {
    let config = config::load(config_path).map_err(|e| format!("{}: {}", config_path.display(), e))?;
    init_logging(config.logging.as_ref());

    let report = config::validate(&config);
    for warning in &report.warnings {
        warn!("{}", warning);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to create runtime: {}", e))?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), String> {
    let switch = Arc::new(Switch::from_config(&config).map_err(|e| e.to_string())?);
    info!(networks = config.networks.len(), ports = config.ports.len(), "switch configured");

    let mut tasks = Vec::new();
    for port in &config.ports {
        let task = spawn_port(port, switch.clone())
            .await
            .map_err(|e| format!("port {}: {}", port.name, e))?;
        tasks.push(task);

        let (ingress, egress) = config::port_filters(&config, &port.name).map_err(|e| e.to_string())?;
        if ingress.rule_count() > 0 {
            let filter: Arc<dyn PacketFilter> = Arc::new(ingress);
            switch.add_ingress_filter(&port.name, filter).map_err(|e| e.to_string())?;
        }
        if egress.rule_count() > 0 {
            let filter: Arc<dyn PacketFilter> = Arc::new(egress);
            switch.add_egress_filter(&port.name, filter).map_err(|e| e.to_string())?;
        }
    }

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut stats = tokio::time::interval(STATS_INTERVAL);

    info!("vswitch running, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tick.tick() => switch.tick(Instant::now()),
            _ = stats.tick() => {
                let snapshot = switch.metrics().snapshot();
                info!(
                    received = snapshot.frames_received,
                    dropped = snapshot.frames_dropped,
                    floods = snapshot.floods,
                    routed = snapshot.packets_routed,
                    nat_sessions = switch.nat_sessions().len(),
                    "stats"
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                break;
            }
        }
    }

    info!("shutting down");
    for task in &tasks {
        task.abort();
    }
    for (name, _) in switch.ports() {
        let _ = switch.detach_port(&name);
    }
    Ok(())
}
