//! RelayMQ - MQTT subscription relay
//!
//! Usage:
//!   relaymq [OPTIONS] [COMMAND]
//!
//! Commands:
//!   run                    Connect to the broker and relay until Ctrl+C (default)
//!   subscriptions <CMD>    List, add, update, toggle or delete subscriptions
//!   messages <CMD>         Browse stored messages
//!   publish <TOPIC> <PAYLOAD>
//!                          Publish one message and exit
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use relaymq::config::{Config, LogConfig};
use relaymq::persistence::{
    InboundMessage, MemoryBackend, MessageQuery, Storage, Subscription, DEFAULT_PAGE_SIZE,
};
use relaymq::protocol::QoS;
use relaymq::relay::Relay;
use relaymq::transport::MqttConnector;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// RelayMQ - keeps broker subscriptions in sync with a stored set and
/// records every inbound message
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(author = "RelayMQ Contributors")]
#[command(version)]
#[command(about = "MQTT subscription relay with a durable message log")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and relay until Ctrl+C
    Run,
    /// Manage the stored subscription set (applied on next connect)
    #[command(subcommand)]
    Subscriptions(SubscriptionCommand),
    /// Browse stored messages
    #[command(subcommand)]
    Messages(MessageCommand),
    /// Publish one message and exit
    Publish {
        topic: String,
        payload: String,
        /// QoS level (0, 1, or 2); defaults to broker.default_qos
        #[arg(long)]
        qos: Option<QoS>,
        /// Ask the broker to retain the message
        #[arg(long)]
        retain: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SubscriptionCommand {
    /// List all subscriptions
    List,
    /// Add an active subscription
    Add {
        topic_filter: String,
        #[arg(long)]
        qos: Option<QoS>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Change QoS and description
    Update {
        id: u64,
        #[arg(long)]
        qos: QoS,
        #[arg(long)]
        description: Option<String>,
    },
    /// Enable or disable a subscription
    Toggle {
        id: u64,
        #[arg(long, action = ArgAction::Set)]
        active: bool,
    },
    /// Delete a subscription permanently
    Delete { id: u64 },
}

#[derive(Subcommand, Debug)]
enum MessageCommand {
    /// List messages, newest first
    List {
        /// Case-insensitive topic substring
        #[arg(long)]
        topic: Option<String>,
        /// Only messages received within this window (e.g. "15m", "2h")
        #[arg(long)]
        since: Option<humantime::Duration>,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one message with its full payload
    Show { id: u64 },
    /// List topics that have stored messages
    Topics,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn init_logging(cli_level: Option<LogLevel>, config: &LogConfig) -> CliResult {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact();

    // CLI overrides config filter, config filter overrides config level
    match (cli_level, &config.filter) {
        (None, Some(directives)) => {
            let filter = EnvFilter::try_new(directives)?;
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?;
        }
        _ => {
            let level = cli_level.unwrap_or_else(|| LogLevel::from_config(&config.level));
            tracing::subscriber::set_global_default(
                builder.with_max_level(level.to_tracing_level()).finish(),
            )?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> CliResult {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(args.log_level, &config.log)?;
    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Subscriptions(cmd) => subscriptions(config, cmd).await,
        Command::Messages(cmd) => messages(config, cmd).await,
        Command::Publish {
            topic,
            payload,
            qos,
            retain,
        } => publish(config, topic, payload, qos, retain).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Config) -> CliResult {
    info!("Starting RelayMQ");
    info!("  Broker: {}", config.broker.url);
    info!("  Client ID: {}", config.broker.client_id);
    info!(
        "  Session: clean_session={}, keep_alive={}, auto_reconnect={}",
        config.broker.clean_session,
        humantime::format_duration(config.broker.keep_alive),
        config.broker.auto_reconnect
    );
    info!(
        "  Storage: {:?} ({})",
        config.persistence.backend,
        config.persistence.path.display()
    );

    let storage = Storage::open(&config.persistence)?;
    let relay = Relay::start(
        &config.broker,
        Arc::new(MqttConnector::new()),
        storage.subscriptions.clone(),
        storage.messages.clone(),
    )
    .await?;

    if !relay.get_status().connected {
        if config.broker.auto_reconnect {
            warn!("Broker not reachable yet, retrying in the background");
        } else {
            warn!("Broker not reachable and auto_reconnect is off; running without a session");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    relay.shutdown().await;
    storage.close().await?;
    Ok(())
}

/// Subscription commands work on the store only; a running relay picks the
/// changes up on its next connect.
async fn subscriptions(config: Config, cmd: SubscriptionCommand) -> CliResult {
    let storage = Storage::open(&config.persistence)?;
    let relay = Relay::new(
        &config.broker,
        Arc::new(MqttConnector::new()),
        storage.subscriptions.clone(),
        storage.messages.clone(),
    )?;

    match cmd {
        SubscriptionCommand::List => {
            let all = relay.list_subscriptions().await?;
            if all.is_empty() {
                println!("No subscriptions");
            }
            for sub in &all {
                print_subscription(sub);
            }
        }
        SubscriptionCommand::Add {
            topic_filter,
            qos,
            description,
        } => {
            let created = relay
                .create_subscription(topic_filter, qos, description)
                .await?;
            print_subscription(&created);
        }
        SubscriptionCommand::Update {
            id,
            qos,
            description,
        } => {
            let updated = relay.update_subscription(id, qos, description).await?;
            print_subscription(&updated);
        }
        SubscriptionCommand::Toggle { id, active } => {
            let toggled = relay.toggle_subscription(id, active).await?;
            print_subscription(&toggled);
        }
        SubscriptionCommand::Delete { id } => {
            relay.delete_subscription(id).await?;
            println!("Deleted subscription {}", id);
        }
    }

    storage.close().await?;
    Ok(())
}

async fn messages(config: Config, cmd: MessageCommand) -> CliResult {
    let storage = Storage::open(&config.persistence)?;
    let relay = Relay::new(
        &config.broker,
        Arc::new(MqttConnector::new()),
        storage.subscriptions.clone(),
        storage.messages.clone(),
    )?;

    match cmd {
        MessageCommand::List {
            topic,
            since,
            limit,
            offset,
        } => {
            let query = MessageQuery {
                topic,
                from: since.and_then(|window| SystemTime::now().checked_sub(window.into())),
                to: None,
                limit,
                offset,
            };
            let page = relay.search_messages(&query).await?;
            if page.is_empty() {
                println!("No messages");
            }
            for message in &page {
                print_message_line(message);
            }
        }
        MessageCommand::Show { id } => {
            let message = relay.get_message(id).await?;
            println!("id:          {}", message.id);
            println!("topic:       {}", message.topic);
            println!("qos:         {}", message.qos);
            println!("retained:    {}", message.retained);
            println!(
                "received_at: {}",
                humantime::format_rfc3339_millis(message.received_at)
            );
            println!("payload:     {}", message.payload_lossy());
        }
        MessageCommand::Topics => {
            for topic in relay.distinct_topics().await? {
                println!("{}", topic);
            }
        }
    }

    storage.close().await?;
    Ok(())
}

/// One-shot publish over a short-lived session. The session gets its own
/// client id and an empty subscription set so it neither replays the stored
/// subscriptions nor takes over a running relay's session.
async fn publish(
    mut config: Config,
    topic: String,
    payload: String,
    qos: Option<QoS>,
    retain: bool,
) -> CliResult {
    config.broker.client_id = format!("{}-publish", config.broker.client_id);
    config.broker.auto_reconnect = false;

    let scratch = Arc::new(MemoryBackend::new());
    let relay = Relay::start(
        &config.broker,
        Arc::new(MqttConnector::new()),
        scratch.clone(),
        scratch,
    )
    .await?;

    let result = relay.publish(&topic, payload, qos, retain).await;
    relay.shutdown().await;
    result?;

    println!("Published to {}", topic);
    Ok(())
}

fn print_subscription(sub: &Subscription) {
    println!(
        "{:>5}  {:<8}  qos {}  {:<40}  {}  {}",
        sub.id,
        if sub.active { "active" } else { "inactive" },
        sub.qos,
        sub.topic_filter,
        humantime::format_rfc3339_seconds(sub.created_at),
        sub.description.as_deref().unwrap_or("")
    );
}

fn print_message_line(message: &InboundMessage) {
    const PREVIEW_CHARS: usize = 60;

    let payload = message.payload_lossy();
    let preview: String = payload.chars().take(PREVIEW_CHARS).collect();
    let ellipsis = if payload.chars().count() > PREVIEW_CHARS {
        "..."
    } else {
        ""
    };
    println!(
        "{:>7}  {}  qos {}{}  {}  {}{}",
        message.id,
        humantime::format_rfc3339_millis(message.received_at),
        message.qos,
        if message.retained { " R" } else { "  " },
        message.topic,
        preview,
        ellipsis
    );
}
