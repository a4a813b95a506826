//! mqtt-session command line client
//!
//! Publishes or subscribes through a [`SessionClient`], so requests survive
//! broker restarts and network drops while the session lasts.

use clap::{Parser, Subcommand};
use mqtt_session::config::SessionConfig;
use mqtt_session::observability::init_default_logging;
use mqtt_session::session::SessionClient;
use mqtt_session::transport::{
    IncomingMessage, MqttTransport, PublishMessage, QoS, SubscribeOptions, UnsubscribeOptions,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Resilient MQTT v5 session client
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Resilient MQTT v5 session client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, used when no configuration file is found
    #[arg(short, long, value_name = "URL")]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single message
    Publish {
        topic: String,
        message: String,
        #[arg(long, default_value_t = 1)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Print messages until Ctrl-C or until the session is lost
    Subscribe {
        filter: String,
        #[arg(long, default_value_t = 1)]
        qos: u8,
        /// Print each message as a JSON object
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config, cli.broker.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => run_publish(config, topic, message, qos, retain).await,
        Commands::Subscribe { filter, qos, json } => {
            run_subscribe(config, filter, qos, json).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
    broker: Option<&str>,
) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SessionConfig::load_from_file(path)?);
    }

    // Try default locations
    for path_str in ["mqtt-session.toml", "config/mqtt-session.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SessionConfig::load_from_file(&path)?);
        }
    }

    match broker {
        Some(url) => {
            let config = SessionConfig::local(url);
            config.validate()?;
            Ok(config)
        }
        None => Err(
            "no configuration file found; pass -c/--config, -b/--broker or create mqtt-session.toml"
                .into(),
        ),
    }
}

fn parse_qos(level: u8) -> Result<QoS, Box<dyn std::error::Error>> {
    QoS::from_u8(level).ok_or_else(|| format!("invalid QoS level {level}").into())
}

fn build_client(config: &SessionConfig) -> Result<SessionClient, Box<dyn std::error::Error>> {
    let transport = Arc::new(MqttTransport::from_config(&config.broker)?);
    Ok(SessionClient::new(transport, config.session_options())?)
}

async fn run_publish(
    config: SessionConfig,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(&config)?;
    client.connect(config.connect_options()).await?;

    let ack = client
        .publish(
            PublishMessage::new(topic.clone(), message)
                .with_qos(parse_qos(qos)?)
                .with_retain(retain),
        )
        .await?;

    if ack.is_success() {
        info!("Published to {} (packet id {:?})", topic, ack.packet_id);
    } else {
        warn!(
            "Broker answered publish to {} with reason 0x{:02X}",
            topic, ack.reason_code
        );
    }

    client.disconnect(None).await?;
    client.dispose().await;
    Ok(())
}

async fn run_subscribe(
    config: SessionConfig,
    filter: String,
    qos: u8,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(&config)?;
    let mut message_rx = client.create_filtered_receiver(&filter)?;
    let mut session_lost = client.subscribe_session_lost();

    client.connect(config.connect_options()).await?;
    let suback = client
        .subscribe(SubscribeOptions::single(filter.clone(), parse_qos(qos)?))
        .await?;
    if !suback.is_success() {
        return Err(format!("subscription to {filter} refused: {:?}", suback.reason_codes).into());
    }
    info!("Subscribed to {}, waiting for messages", filter);

    let mut lost = None;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break;
            }
            event = session_lost.recv() => {
                lost = event;
                break;
            }
            Some(message) = message_rx.recv() => print_message(&message, json),
        }
    }

    if let Some(event) = lost {
        client.dispose().await;
        return Err(format!("session lost: {}", event.reason).into());
    }

    if let Err(e) = client.unsubscribe(UnsubscribeOptions::single(filter)).await {
        warn!("Unsubscribe failed: {}", e);
    }
    client.disconnect(None).await?;
    client.dispose().await;
    Ok(())
}

fn print_message(message: &IncomingMessage, json: bool) {
    let payload = String::from_utf8_lossy(&message.payload);
    if json {
        let line = serde_json::json!({
            "topic": message.topic,
            "qos": message.qos as u8,
            "retain": message.retain,
            "payload": payload,
        });
        println!("{line}");
    } else {
        println!("{} {}", message.topic, payload);
    }
}

fn handle_config_command(
    config: &SessionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
