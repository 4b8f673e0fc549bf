//! Binary entrypoint for the meshllm CLI.
//!
//! Commands:
//! - `init` - create a starter `config.toml` and a sample `librarian` persona
//! - `status` - print data paths, persona summaries and per-node queue counts
//! - `agent [--once] [--daemon --pid-file <path>]` - run the reply pipeline
//! - `bridge [--once]` - record/flush with the console transport
//! - `inject --sender <id> [...] <text>` - record an inbound message by hand
//!
//! See the library crate docs for module-level details: `meshllm::`.
use std::path::Path;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshllm::agent::Agent;
use meshllm::bridge::{timestamp_from_epoch, Bridge, InboundOutcome};
use meshllm::config::Config;
use meshllm::inference::backend_from_config;
use meshllm::meshtastic::{ConsoleTransport, InboundText};
use meshllm::metrics;
use meshllm::persona::PersonaRegistry;
use meshllm::storage::RecordStore;
use meshllm::thread::{abandoned_count, Direction, NodeLayout, ThreadLog};

const SAMPLE_PERSONA: &str = r#"name = "librarian"
triggers = ["librarian", "lib"]
description = "Answers reference questions in a sentence or two."
temperature = 0.4
max_message_chars = 200
cooldown_seconds = 60
system_prompt = """
You are the librarian of a small off-grid mesh network. Answer briefly and
plainly; replies are sent over low-bandwidth radio.
"""
"#;

#[derive(Parser)]
#[command(name = "meshllm")]
#[command(about = "LLM personas for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and a sample persona
    Init,
    /// Show personas and mailbox statistics
    Status,
    /// Run the reply agent
    Agent {
        /// Run a single scan pass, wait for queued replies, then exit
        #[arg(long)]
        once: bool,

        /// Run as a background daemon (Unix only)
        #[arg(short, long)]
        daemon: bool,

        /// PID file location (for daemon mode)
        #[arg(long, default_value = "/tmp/meshllm-agent.pid")]
        pid_file: String,
    },
    /// Run the bridge with the console transport
    Bridge {
        /// Flush queued replies once, then exit
        #[arg(long)]
        once: bool,
    },
    /// Record an inbound message as if it came from the radio
    Inject {
        /// Sender node id (e.g. !a1b2c3d4)
        #[arg(long)]
        sender: String,
        /// Destination node id; omit for a channel broadcast
        #[arg(long)]
        to: Option<String>,
        /// Channel index
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Channel name (names the thread file)
        #[arg(long)]
        channel_name: Option<String>,
        /// Receive time in epoch seconds (defaults to now)
        #[arg(long)]
        rx_time: Option<f64>,
        /// Packet id this message replies to
        #[arg(long)]
        reply_to: Option<String>,
        /// Message text
        text: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if Path::new(&cli.config).exists() {
                warn!("{} already exists; leaving it untouched", cli.config);
            } else {
                Config::create_default(&cli.config).await?;
                info!("Configuration file created at {}", cli.config);
            }
            let config = Config::load_or_default(&cli.config).await?;
            let personas = config.personas_dir();
            tokio::fs::create_dir_all(&personas).await?;
            tokio::fs::create_dir_all(config.nodes_base()).await?;
            let sample = personas.join("librarian.toml");
            if sample.exists() {
                info!("Persona {} already exists", sample.display());
            } else {
                tokio::fs::write(&sample, SAMPLE_PERSONA).await?;
                info!("Sample persona written to {}", sample.display());
            }
        }
        Commands::Status => {
            let config = Config::load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            show_status(&config)?;
        }
        Commands::Agent { once, daemon, pid_file } => {
            let config = Config::load_or_default(&cli.config).await?;

            #[cfg(all(unix, feature = "daemon"))]
            if daemon {
                // parent exits here; the child re-runs without --daemon
                daemonize_process(&config, &pid_file)?;
            }

            #[cfg(not(all(unix, feature = "daemon")))]
            if daemon {
                let _ = pid_file;
                eprintln!("Error: Daemon mode requires Unix platform and 'daemon' feature.");
                std::process::exit(1);
            }

            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshllm agent v{}", env!("CARGO_PKG_VERSION"));
            let backend = backend_from_config(&config.ollama);
            Agent::new(config, backend).run(once).await?;
        }
        Commands::Bridge { once } => {
            let config = Config::load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!(
                "Starting meshllm bridge v{} for node {} (console transport)",
                env!("CARGO_PKG_VERSION"),
                config.bridge.node_uid
            );
            let bridge = Bridge::new(&config, ConsoleTransport::new());
            // no radio driver linked in, so nothing ever arrives on this channel
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            bridge.run(rx, once).await?;
        }
        Commands::Inject {
            sender,
            to,
            channel,
            channel_name,
            rx_time,
            reply_to,
            text,
        } => {
            let config = Config::load_or_default(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let text = text.join(" ");
            if text.trim().is_empty() {
                return Err(anyhow!("message text is empty"));
            }
            let bridge = Bridge::new(&config, ConsoleTransport::new());
            bridge.ensure_node_paths()?;
            let packet = InboundText {
                from: sender,
                to,
                channel_index: channel,
                channel_name,
                text,
                timestamp: rx_time.map(timestamp_from_epoch),
                reply_to_id: reply_to,
                ..InboundText::default()
            };
            match bridge.record_inbound(&packet)? {
                InboundOutcome::Recorded { path, message_id } => {
                    println!("Recorded {} in {}", message_id, path.display())
                }
                InboundOutcome::Duplicate { path, message_id } => {
                    println!("Duplicate of {} in {}; nothing written", message_id, path.display())
                }
            }
        }
    }

    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    println!("meshllm v{}", env!("CARGO_PKG_VERSION"));
    println!("Data root:   {}", config.data_root().display());
    println!("Nodes:       {}", config.nodes_base().display());
    println!("Personas:    {}", config.personas_dir().display());

    let mut registry = PersonaRegistry::new(config.personas_dir(), &config.ai.default_persona, config.lock.options())
        .with_default_timezone(&config.general.timezone);
    registry.reload();
    let default_state = if registry.get_default().is_some() { "present" } else { "missing" };
    println!("Default persona: {} ({})", config.ai.default_persona, default_state);
    let now = chrono::Utc::now();
    for persona in registry.all() {
        println!(
            "  {} [triggers: {}] queue={} | {}",
            persona.name,
            persona.triggers.join(", "),
            persona.runtime.queue_count,
            persona.status_summary(now)
        );
    }

    let store = RecordStore::new(config.lock.options());
    let log = ThreadLog::new(store.clone());
    let layout = NodeLayout::new(config.nodes_base());
    let max_attempts = config.bridge.max_send_attempts.max(1);
    for node_dir in layout.node_dirs() {
        let name = node_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (mut threads, mut inbound, mut queued, mut outbound, mut failed, mut abandoned) = (0, 0, 0, 0, 0, 0);
        for file in NodeLayout::thread_files(&node_dir) {
            let rows = match log.read_all(&file.path) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Cannot read {}: {}", file.path.display(), e);
                    continue;
                }
            };
            threads += 1;
            for row in &rows {
                match row.direction {
                    Direction::Inbound => inbound += 1,
                    Direction::Queued => queued += 1,
                    Direction::Outbound => outbound += 1,
                    Direction::Other(_) => {}
                }
                if row.send_status == "failed" {
                    failed += 1;
                }
            }
            abandoned += abandoned_count(&rows, max_attempts);
        }
        let sightings = match store.read(&node_dir.join("sightings.csv")) {
            Ok(rows) => rows.len(),
            Err(e) => {
                warn!("Cannot read sightings for {}: {}", name, e);
                0
            }
        };
        println!(
            "Node {}: {} threads, {} inbound, {} queued ({} failed, {} abandoned), {} sent, {} sightings",
            name, threads, inbound, queued, failed, abandoned, outbound, sightings
        );
    }

    println!("Process metrics: {}", metrics::snapshot());
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok());

    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // In daemon mode stdout is redirected, so this is false
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}

/// Daemonize the process (Unix only)
///
/// Re-spawns the current executable without `--daemon`, detached from the
/// terminal with output appended to the log file, writes the child's PID
/// and exits the parent.
#[cfg(all(unix, feature = "daemon"))]
fn daemonize_process(config: &Config, pid_file: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::process::{Command, Stdio};

    let log_path = config.logging.file.as_deref().unwrap_or("meshllm.log");

    let current_exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--daemon" && arg != "-d")
        .collect();

    let log_file = OpenOptions::new().create(true).append(true).open(log_path)?;

    let child = Command::new(&current_exe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    std::fs::write(pid_file, format!("{}", child.id()))?;
    std::process::exit(0);
}
