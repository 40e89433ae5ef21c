//! MQTT bridge - command line entry point

use clap::{Parser, Subcommand, ValueEnum};
use mqtt_bridge::config::BridgeConfig;
use mqtt_bridge::dispatch::{builtin_strategies, DispatchRegistry};
use mqtt_bridge::observability::logging::LogFormat;
use mqtt_bridge::observability::{init_default_logging, init_logging, EventBus, HealthServer};
use mqtt_bridge::protocol::{
    substitute_device_identity, DeviceCommand, TOPIC_DATA_RESP, TOPIC_DATA_SUBSCRIBE,
};
use mqtt_bridge::transport::mqtt::qos_from_level;
use mqtt_bridge::BridgeContext;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};

/// MQTT bridge with regex topic dispatch
#[derive(Parser)]
#[command(name = "mqtt-bridge")]
#[command(about = "Producer/consumer MQTT bridge with topic-pattern dispatch")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect both sessions and dispatch inbound messages until interrupted
    Run,
    /// Publish one message through the producer session
    Publish {
        /// Topic (defaults to producer_default_topic); may contain ${deviceIdentity}
        #[arg(short, long)]
        topic: Option<String>,
        /// QoS level 0, 1 or 2 (defaults to the configured qos)
        #[arg(short, long)]
        qos: Option<u8>,
        /// Device identity substituted into the topic
        #[arg(short, long)]
        device_id: Option<String>,
        /// Message payload
        payload: String,
    },
    /// Send a device command to its data topic
    Command {
        #[arg(short, long)]
        device_id: String,
        #[arg(short, long, value_enum, default_value = "resp")]
        kind: CommandKind,
    },
    /// Validate configuration
    Config {
        /// Show the loaded configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CommandKind {
    /// Data response topic
    Resp,
    /// Data subscription topic
    Subscribe,
}

impl CommandKind {
    fn topic_template(self) -> &'static str {
        match self {
            CommandKind::Resp => TOPIC_DATA_RESP,
            CommandKind::Subscribe => TOPIC_DATA_SUBSCRIBE,
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 {
        let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
        init_logging(Level::DEBUG, format, cli.verbose > 1);
    } else {
        init_default_logging();
    }

    info!("Starting MQTT bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Publish {
            topic,
            qos,
            device_id,
            payload,
        } => publish_once(config, topic, qos, device_id, payload).await,
        Commands::Command { device_id, kind } => send_command(config, &device_id, kind).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for candidate in ["bridge.toml", "config/bridge.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create bridge.toml".into())
}

fn build_context(config: BridgeConfig) -> Result<BridgeContext, Box<dyn std::error::Error>> {
    let registry = DispatchRegistry::builder()
        .strategies(builtin_strategies())
        .build()?;
    Ok(BridgeContext::new(config, registry, EventBus::with_defaults())?)
}

async fn run_bridge(config: BridgeConfig) -> CliResult {
    let context = build_context(config)?;

    if HealthServer::enabled_from_env() {
        let manager = context.manager();
        let producer = manager.producer();
        let consumer = manager.consumer();
        let health_server = Arc::new(
            HealthServer::new(HealthServer::port_from_env())
                .with_session("producer", producer.client_id(), producer.state_receiver())
                .with_session("consumer", consumer.client_id(), consumer.state_receiver()),
        );
        tokio::spawn(health_server.start());
    } else {
        info!("Health server disabled");
    }

    context.connect().await?;

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    info!("Bridge is running; waiting for messages");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        state = context.wait_for_permanent_failure() => {
            error!(state = ?state, "MQTT session permanently lost, shutting down");
        }
    }

    context.shutdown().await?;
    Ok(())
}

async fn publish_once(
    config: BridgeConfig,
    topic: Option<String>,
    qos: Option<u8>,
    device_id: Option<String>,
    payload: String,
) -> CliResult {
    let qos = qos.map(qos_from_level).transpose()?;
    let context = build_context(config)?;
    let publisher = context.publisher()?;

    let topic = topic.unwrap_or_else(|| publisher.default_topic().to_string());
    let topic = match device_id {
        Some(device_id) => substitute_device_identity(&topic, &device_id),
        None => topic,
    };

    let producer = context.manager().producer();
    producer.connect().await?;
    let result = publisher.publish(Some(&topic), qos, payload).await;
    if let Err(e) = producer.disconnect().await {
        warn!(error = %e, "Producer did not close cleanly");
    }
    result?;

    info!(topic = %topic, "Message published");
    Ok(())
}

async fn send_command(config: BridgeConfig, device_id: &str, kind: CommandKind) -> CliResult {
    let payload = DeviceCommand::now(device_id).to_json()?;
    let topic = substitute_device_identity(kind.topic_template(), device_id);
    publish_once(config, Some(topic), None, None, payload).await
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> CliResult {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}
