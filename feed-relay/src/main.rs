use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feed_relay::dispatcher::pending_outbox;
use feed_relay::providers::build_providers;
use feed_relay::{Credentials, DestinationId, DiscordSender, FeedRelay, RelayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "feed-relay")]
#[command(about = "Poll feeds, translate new items and relay them to chat channels")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "FEED_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://feed-relay.db")]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted
    Run,

    /// Register a channel and subscribe it to the default feeds
    Register { destination: String },

    /// Subscribe a channel to a feed
    Subscribe { destination: String, feed_url: String },

    /// Remove a channel's subscription
    Unsubscribe { destination: String, feed_url: String },

    /// List a channel's subscriptions
    List { destination: String },

    /// Set the language a channel's items are translated into
    SetLanguage { destination: String, language: String },

    /// Set how often a subscription is polled, in minutes
    SetInterval {
        destination: String,
        feed_url: String,
        minutes: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,feed_relay=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let credentials = Credentials::from_env();
    let config = RelayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let token = credentials.discord_token.clone().unwrap_or_default();
    if matches!(cli.command, Commands::Run) && token.is_empty() {
        anyhow::bail!("DISCORD_TOKEN must be set to run the relay");
    }

    let relay = FeedRelay::builder(config.clone())
        .database_url(&cli.database_url)
        .sender(Arc::new(DiscordSender::new(token).context("Failed to build Discord client")?))
        .translators(build_providers(&config.provider_order, &credentials))
        .build()
        .await
        .context("Failed to initialise relay")?;

    match cli.command {
        Commands::Run => run(&relay).await?,
        Commands::Register { destination } => {
            let added = relay.register_destination(&DestinationId::from(destination.as_str())).await?;
            println!("Registered {} with {} default feeds", destination, added.len());
        }
        Commands::Subscribe { destination, feed_url } => {
            let subscription = relay
                .add_subscription(&DestinationId::from(destination.as_str()), &feed_url)
                .await?;
            println!(
                "Subscribed {} to {} (every {} min, language {})",
                destination, subscription.feed_url, subscription.poll_interval_minutes, subscription.target_language
            );
        }
        Commands::Unsubscribe { destination, feed_url } => {
            relay
                .remove_subscription(&DestinationId::from(destination.as_str()), &feed_url)
                .await?;
            println!("Unsubscribed {} from {}", destination, feed_url);
        }
        Commands::List { destination } => {
            let destination_id = DestinationId::from(destination.as_str());
            let subscriptions = relay.list_subscriptions(&destination_id).await?;
            if subscriptions.is_empty() {
                println!("{} has no subscriptions", destination);
            }
            for subscription in subscriptions {
                let status = if subscription.enabled { "enabled" } else { "disabled" };
                println!(
                    "{}  every {} min  {}  {}  failures={}{}",
                    subscription.feed_url,
                    subscription.poll_interval_minutes,
                    subscription.target_language,
                    status,
                    subscription.consecutive_failures,
                    subscription
                        .last_error
                        .map(|e| format!("  last error: {}", e))
                        .unwrap_or_default()
                );
            }
            let pending = pending_outbox(relay.database(), &destination_id).await?;
            if !pending.is_empty() {
                println!("{} deliveries pending", pending.len());
            }
        }
        Commands::SetLanguage { destination, language } => {
            let updated = relay
                .set_target_language(&DestinationId::from(destination.as_str()), &language)
                .await?;
            println!("{} now translates into {} ({} subscriptions updated)", destination, language, updated);
        }
        Commands::SetInterval {
            destination,
            feed_url,
            minutes,
        } => {
            relay
                .set_poll_interval(&DestinationId::from(destination.as_str()), &feed_url, minutes)
                .await?;
            println!("{} polls {} every {} minutes", destination, feed_url, minutes);
        }
    }

    if !relay.is_started() {
        relay.database().close().await;
    }
    Ok(())
}

async fn run(relay: &FeedRelay) -> Result<()> {
    relay.start().await.context("Failed to start relay")?;
    info!("Feed relay running, press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                break;
            }
            event = relay.next_event() => match event {
                // The command surface would notify the channel owner here.
                Some(event) => warn!("Relay event: {:?}", event),
                None => break,
            },
        }
    }

    relay.shutdown().await;
    Ok(())
}
