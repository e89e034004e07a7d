use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use flowscope::config::Config;
use flowscope::core::StreamSegment;
use flowscope::event::{EventListener, JsonListener, LogListener};
use flowscope::transcript::{Sender, Transcript};
use flowscope::{Engine, ProcessStatus};

#[derive(Parser)]
#[command(name = "flowscope")]
#[command(author, version, about = "Connection tracking and stream protocol analysis")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Feed a session transcript through a protocol analyzer
    Replay {
        /// Transcript file
        transcript: PathBuf,

        /// Server port, selects the analyzer
        #[arg(short, long, default_value = "143")]
        port: u16,

        /// Client port of the simulated flow
        #[arg(long, default_value = "50000")]
        client_port: u16,

        /// Analyzer to use instead of the port mapping
        #[arg(long)]
        protocol: Option<String>,

        /// Print events as JSON lines on stdout
        #[arg(short, long)]
        json: bool,

        /// Print table statistics at the end
        #[arg(short, long)]
        stats: bool,
    },

    /// List registered protocols and their events
    Protocols,

    /// Generate default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    ShowConfig,
}

/// Configuration from `--config` or the default locations
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    Ok(config)
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Replay {
            transcript,
            port,
            client_port,
            protocol,
            json,
            stats,
        } => cmd_replay(config, transcript, port, client_port, protocol, json, stats).await,
        Commands::Protocols => cmd_protocols(config),
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::ShowConfig => cmd_show_config(config),
    }
}

async fn cmd_replay(
    config: Config,
    path: PathBuf,
    port: u16,
    client_port: u16,
    protocol: Option<String>,
    json: bool,
    stats: bool,
) -> Result<()> {
    let transcript = Transcript::from_file(&path)
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    let engine = Engine::with_builtin_protocols(config)?;

    let proto = match protocol {
        Some(name) => name,
        None => match engine.protocol_for_port(port) {
            Some(name) => name.to_string(),
            None => bail!("No protocol registered for port {}", port),
        },
    };
    if engine.table(&proto).is_none() {
        bail!("Unknown protocol {}", proto);
    }

    let listener: Arc<dyn EventListener> = if json {
        Arc::new(JsonListener::new("replay", std::io::stdout()))
    } else {
        Arc::new(LogListener::new("replay"))
    };
    for kind in engine.events().kinds_of(&proto) {
        engine.events().add_listener(&kind, Arc::clone(&listener))?;
    }

    let driver = engine.spawn_timer_driver(std::time::Duration::from_millis(
        engine.config().timers.driver_interval_ms,
    ));

    let start = Instant::now();
    let mut stopped_at = None;
    for step in transcript.steps() {
        let flow = engine.track_transport(client_port, port)?;
        let segment = StreamSegment::new(Some(flow), step.sender.direction(), &step.data);
        let status = engine
            .process_stream(&proto, &segment)
            .with_context(|| format!("Transcript line {}", step.line))?;
        if status == ProcessStatus::Stop {
            stopped_at = Some(step.line);
            break;
        }
    }
    let elapsed = start.elapsed();
    driver.abort();

    if !json {
        println!("{}", "=== Replay ===".bold());
        println!("Protocol:      {}", proto.cyan());
        println!("Steps:         {}", transcript.len());
        println!(
            "Bytes:         {} client / {} server",
            transcript.bytes_sent(Sender::Client),
            transcript.bytes_sent(Sender::Server)
        );
        println!("Elapsed:       {:?}", elapsed);
        if let Some(line) = stopped_at {
            println!(
                "{}",
                format!("Inspection stopped at line {}", line).yellow()
            );
        }
    }

    if stats {
        let stats = engine.stats();
        if json {
            println!("{}", serde_json::to_string(&stats)?);
        } else {
            println!("\n{}", "Tables:".bold());
            println!(
                "  {}: {} lookups, {} inserts, {} live",
                "tcp", stats.transport.lookups, stats.transport.inserts, stats.transport.entries
            );
            for (name, table) in &stats.protocols {
                println!(
                    "  {}: {} lookups, {} inserts, {} live",
                    name, table.lookups, table.inserts, table.entries
                );
            }
            println!("Timers pending: {}", stats.timers_pending);
        }
    }

    // Ends whatever the transcript left open
    engine.shutdown()?;
    Ok(())
}

fn cmd_protocols(config: Config) -> Result<()> {
    let engine = Engine::with_builtin_protocols(config)?;

    for name in engine.protocol_names() {
        println!("{}", name.bold().green());
        for kind in engine.events().kinds_of(name) {
            let fields: Vec<String> = kind
                .data()
                .iter()
                .map(|d| format!("{}:{}", d.name, d.value_type))
                .collect();
            println!("  {} ({})", kind.name().cyan(), fields.join(", "));
            if !kind.description().is_empty() {
                println!("    {}", kind.description());
            }
        }
    }

    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let content = Config::default_with_comments();

    match output {
        Some(path) => {
            std::fs::write(&path, content)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", content);
        }
    }

    Ok(())
}

fn cmd_show_config(config: Config) -> Result<()> {
    println!("{}", config.to_string()?);
    Ok(())
}
