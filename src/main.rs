//! Remote Console - serial and TCP remote access through frp
//!
//! Exposes local serial devices and TCP services (SSH, RDP, Winbox...) on a
//! public frp server, one `frpc` process per mapping.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remote_console::{
    bridge::list_serial_ports, config::ConfigManager, ConnectionEvent, ConnectionManager,
    ConnectionStatus, MappingRequest, ServerSettings, ShutdownCoordinator,
};

/// CLI arguments for remote-console
#[derive(Parser, Debug)]
#[command(name = "remote-console")]
#[command(about = "Expose local serial ports and TCP services through an frp server")]
#[command(version)]
#[command(long_about = "
Remote Console - serial and TCP remote access through frp

Each mapping publishes one local target on a public port of the frp server.
Serial devices are first bridged to a local TCP port (20000 + public port
mod 1000) so frpc can carry them.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  REMOTE_CONSOLE_FRPC              - Path to the frpc executable
  REMOTE_CONSOLE_ARTIFACT_DIR      - Directory for generated frpc configs
  REMOTE_CONSOLE_SETTINGS_FILE     - frp server settings (config.ini)
  REMOTE_CONSOLE_TERMINATE_TIMEOUT - Grace period for frpc (e.g. 5s)
  REMOTE_CONSOLE_SHUTDOWN_TIMEOUT  - Budget for closing everything (e.g. 10s)
  REMOTE_CONSOLE_BAUD_RATE         - Default serial baud rate
  REMOTE_CONSOLE_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    #[arg(long, help = "Path to the frpc executable")]
    pub frpc: Option<PathBuf>,

    #[arg(long, help = "frp server settings file (INI, section [frp_server])")]
    pub settings_file: Option<PathBuf>,

    #[arg(long, help = "Directory for generated frpc configuration files")]
    pub artifact_dir: Option<PathBuf>,

    #[arg(long, help = "Seconds to wait for frpc to exit before killing it")]
    pub terminate_timeout: Option<u64>,

    #[arg(long, help = "frp server address (overrides settings file)")]
    pub server_addr: Option<String>,

    #[arg(long, help = "frp server port (overrides settings file)")]
    pub server_port: Option<u16>,

    #[arg(long, help = "frp server token (overrides settings file)")]
    pub token: Option<String>,

    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Print events as JSON lines")]
    pub json: bool,

    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[arg(long, help = "Print the frpc configuration instead of starting")]
    pub print_config: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List serial ports on this machine
    Ports,
    /// Publish one serial device
    Serial {
        device: String,
        #[arg(short, long)]
        remote_port: u32,
        #[arg(short, long, help = "Baud rate (default from config)")]
        baud: Option<u32>,
    },
    /// Publish one local TCP service
    Tcp {
        ip: String,
        port: u32,
        #[arg(short, long)]
        remote_port: u32,
    },
    /// Publish several mappings at once
    Run {
        #[arg(long = "serial", value_name = "DEVICE:BAUD:REMOTE", value_parser = MappingRequest::parse_serial)]
        serial: Vec<MappingRequest>,
        #[arg(long = "tcp", value_name = "IP:PORT:REMOTE", value_parser = MappingRequest::parse_tcp)]
        tcp: Vec<MappingRequest>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting remote-console v{}", env!("CARGO_PKG_VERSION"));

    // CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.frpc.as_deref(),
        args.settings_file.as_deref(),
        args.artifact_dir.as_deref(),
        args.terminate_timeout,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    let mut server = ServerSettings::load(&config.tunnel.settings_file);
    if let Some(addr) = &args.server_addr {
        server.addr = addr.clone();
    }
    if let Some(port) = args.server_port {
        server.port = port;
    }
    if let Some(token) = &args.token {
        server.token = token.clone();
    }
    if server.is_placeholder() {
        warn!(
            "frp server address is still the built-in placeholder; edit {}",
            config.tunnel.settings_file.display()
        );
    }

    if args.validate_config {
        info!("✅ Configuration is valid");
        info!("Configuration summary:");
        info!("  frpc: {}", config.tunnel.executable.display());
        info!("  frp server: {}:{}", server.addr, server.port);
        info!(
            "  Artifact directory: {}",
            config
                .tunnel
                .artifact_dir
                .as_ref()
                .map_or_else(|| "system temp".to_string(), |d| d.display().to_string())
        );
        info!("  Bridge ports: {}+", config.bridge.port_base);
        info!("  Shutdown timeout: {:?}", config.shutdown.timeout);
        return Ok(());
    }

    let default_baud = config.bridge.default_baud_rate;
    let requests = match args.command {
        None => {
            CliArgs::command().print_help()?;
            return Ok(());
        }
        Some(Command::Ports) => return print_ports(),
        Some(Command::Serial {
            device,
            remote_port,
            baud,
        }) => vec![MappingRequest::Serial {
            device,
            baud_rate: baud.unwrap_or(default_baud),
            remote_port,
        }],
        Some(Command::Tcp {
            ip,
            port,
            remote_port,
        }) => vec![MappingRequest::Tcp {
            ip,
            port,
            remote_port,
        }],
        Some(Command::Run { serial, tcp }) => serial.into_iter().chain(tcp).collect(),
    };

    if requests.is_empty() {
        bail!("No mappings given; use --serial or --tcp");
    }

    let manager = ConnectionManager::new(Arc::new(config), server);

    if args.print_config {
        for request in &requests {
            let text = manager.preview(request)?;
            println!("# public port {}\n{}", request.remote_port(), text);
        }
        return Ok(());
    }

    let printer = tokio::spawn(print_events(manager.clone(), args.json));

    if requests
        .iter()
        .any(|r| matches!(r, MappingRequest::Serial { .. }))
    {
        print_serial_tips();
    }

    let mut started = 0;
    for request in &requests {
        match manager.add_mapping(request).await {
            Ok(()) => started += 1,
            Err(e) => error!("Mapping for public port {} failed: {}", request.remote_port(), e),
        }
    }
    if manager.list().await.is_empty() {
        printer.abort();
        bail!("No mapping could be registered");
    }
    info!("{} of {} mappings running", started, requests.len());
    info!("🛑 Press Ctrl+C or send SIGTERM/SIGINT to close all connections");

    let shutdown_coordinator = ShutdownCoordinator::new();
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    let report = shutdown_coordinator
        .shutdown_connection_manager(&manager)
        .await;

    // Let the printer drain the last events
    tokio::task::yield_now().await;
    printer.abort();

    if !report.is_clean() {
        warn!("Forced exit with {:?} still running", report.abandoned);
    }
    info!("Shutdown complete");

    Ok(())
}

/// Render the event stream on stdout
async fn print_events(manager: ConnectionManager, json: bool) {
    let mut stream = BroadcastStream::new(manager.subscribe());

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Event printer fell behind, {} events dropped", skipped);
                continue;
            }
        };

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode event: {}", e),
            }
            continue;
        }

        println!("{}", event);
        if let ConnectionEvent::StatusChanged {
            remote_port,
            status: ConnectionStatus::Running,
        } = event
        {
            println!(
                "[{}] Public address: {}",
                remote_port,
                manager.public_address(remote_port)
            );
        }
    }
}

fn print_ports() -> Result<()> {
    let ports = list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.name, port.kind);
    }
    Ok(())
}

fn print_serial_tips() {
    println!("For remote serial usage:");
    println!("Set terminals like SecureCRT or PuTTY to RAW mode.");
    println!();
    println!("In PuTTY, also set 'Local echo' and 'Local line editing'");
    println!("to 'Force Off' under Terminal settings.");
    println!();
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();

    Ok(())
}
