//! Subscribe to one or more channels and print every event.
//!
//! ```sh
//! PUBSUB_SUBSCRIBE_KEY=sub-c-... cargo run -p pubsub-client --example subscribe \
//!     -- --presence my-channel other-channel
//! ```
//!
//! Message payloads are printed to stdout as JSON (pipe to `jq` for
//! formatting); status and presence events go to the log.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pubsub_client::{Client, Config, Event, ReconnectionPolicy};

#[derive(Parser)]
struct Args {
    #[arg(long, env = "PUBSUB_SUBSCRIBE_KEY")]
    subscribe_key: String,

    #[arg(long, env = "PUBSUB_PUBLISH_KEY", default_value = "")]
    publish_key: String,

    #[arg(long, env = "PUBSUB_UUID")]
    uuid: Option<String>,

    #[arg(long, env = "PUBSUB_ORIGIN")]
    origin: Option<String>,

    #[arg(long, env = "PUBSUB_CIPHER_KEY")]
    cipher_key: Option<String>,

    /// Also receive join/leave/timeout events.
    #[arg(long)]
    presence: bool,

    #[arg(long)]
    group: Vec<String>,

    channels: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let uuid = args
        .uuid
        .unwrap_or_else(|| format!("example-{}", uuid::Uuid::new_v4()));

    let mut config = Config::new(args.publish_key, args.subscribe_key, uuid);
    if let Some(origin) = args.origin {
        config.origin = origin;
    }
    config.cipher_key = args.cipher_key;
    config.reconnection_policy = ReconnectionPolicy::Exponential;

    let client = Client::new(config)?;
    let mut listener = client.add_listener();
    client
        .subscribe()
        .channels(args.channels)
        .channel_groups(args.group)
        .with_presence(args.presence)
        .execute()?;

    loop {
        tokio::select! {
            event = listener.next() => match event {
                Some(Event::Message(msg)) => {
                    println!("{}", serde_json::to_string(&msg.payload)?);
                }
                Some(Event::Presence(p)) => {
                    tracing::info!(
                        channel = %p.channel,
                        action = %p.event,
                        uuid = ?p.uuid,
                        occupancy = p.occupancy,
                        "presence"
                    );
                }
                Some(Event::Status(status)) => {
                    tracing::info!(
                        category = ?status.category,
                        channels = ?status.affected_channels,
                        error = ?status.error,
                        "status"
                    );
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, leaving channels");
                break;
            }
        }
    }

    client.destroy().await;
    Ok(())
}
