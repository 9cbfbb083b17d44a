//! Publish a single JSON message and print its timetoken.
//!
//! ```sh
//! PUBSUB_PUBLISH_KEY=pub-c-... PUBSUB_SUBSCRIBE_KEY=sub-c-... \
//!     cargo run -p pubsub-client --example publish -- my-channel '{"text":"hi"}'
//! ```
//!
//! A message that is not valid JSON is sent as a string.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pubsub_client::{Client, Config};

#[derive(Parser)]
struct Args {
    #[arg(long, env = "PUBSUB_PUBLISH_KEY")]
    publish_key: String,

    #[arg(long, env = "PUBSUB_SUBSCRIBE_KEY")]
    subscribe_key: String,

    #[arg(long, env = "PUBSUB_UUID", default_value = "publish-example")]
    uuid: String,

    #[arg(long, env = "PUBSUB_ORIGIN")]
    origin: Option<String>,

    #[arg(long, env = "PUBSUB_CIPHER_KEY")]
    cipher_key: Option<String>,

    /// Send as a signal instead of a stored message.
    #[arg(long)]
    signal: bool,

    channel: String,

    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::new(args.publish_key, args.subscribe_key, args.uuid);
    if let Some(origin) = args.origin {
        config.origin = origin;
    }
    config.cipher_key = args.cipher_key;
    config.heartbeat_interval = Some(std::time::Duration::ZERO);

    let payload = serde_json::from_str(&args.message)
        .unwrap_or_else(|_| serde_json::Value::String(args.message.clone()));

    let client = Client::new(config)?;
    let builder = if args.signal {
        client.signal()
    } else {
        client.publish()
    };
    let response = builder.channel(args.channel).message(payload).execute().await?;
    println!("{}", response.timetoken);

    client.destroy().await;
    Ok(())
}
