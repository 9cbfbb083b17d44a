//! Client SDK core for a hosted publish/subscribe messaging service.
//!
//! Publishes messages to named channels, receives messages and presence
//! events over a single long-poll subscription, manages channel groups and
//! push registrations, and mints and inspects access tokens.
//!
//! # Features
//! - One multiplexed long poll per client with a causal timetoken cursor
//! - Connectivity state machine with linear or exponential reconnection
//! - Presence heartbeats, per-channel presence state and leave announcements
//! - Request signing with the secret key, optional AES-256-CBC payload
//!   encryption
//! - Access-token grant, revoke and local decoding
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubsub_client::Error> {
//! use pubsub_client::{Client, Config, Event};
//!
//! let client = Client::new(Config::new("pub-key", "sub-key", "my-uuid"))?;
//! let mut listener = client.add_listener();
//! client.subscribe().channels(["my-channel"]).with_presence(true).execute()?;
//!
//! client
//!     .publish()
//!     .channel("my-channel")
//!     .message(serde_json::json!({"text": "hello"}))
//!     .execute()
//!     .await?;
//!
//! while let Some(event) = listener.next().await {
//!     match event {
//!         Event::Message(msg) => println!("got: {}", msg.payload),
//!         Event::Status(status) => println!("status: {:?}", status.category),
//!         Event::Presence(p) => println!("{} {:?}", p.event, p.uuid),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod crypto;
pub mod endpoints;
mod error;
mod heartbeat;
mod listener;
mod request;
mod signature;
mod state;
mod status;
mod subscription;
pub mod token;
mod transport;
mod types;

pub use client::{Client, SubscribeBuilder};
pub use config::{Config, ReconnectionPolicy};
pub use crypto::{AesCbcCipher, EncryptionProvider};
pub use endpoints::access::{GrantTokenBuilder, GrantTokenResponse, RevokeTokenBuilder};
pub use endpoints::channel_groups::{
    ListChannelsInGroupBuilder, ListChannelsResponse, ModifyChannelGroupBuilder,
};
pub use endpoints::files::{FileInfo, ListFilesBuilder, ListFilesResponse};
pub use endpoints::history::{
    DeleteMessagesBuilder, HistoryBuilder, HistoryItem, HistoryResponse,
};
pub use endpoints::presence::{
    ChannelOccupancy, GetStateBuilder, GetStateResponse, HereNowBuilder, HereNowResponse,
    Occupant, SetStateBuilder, SetStateResponse, WhereNowBuilder, WhereNowResponse,
};
pub use endpoints::publish::{PublishBuilder, PublishResponse};
pub use endpoints::push::{
    ListPushProvisionsBuilder, ModifyPushBuilder, PushEnvironment, PushType,
};
pub use endpoints::time::{TimeBuilder, TimeResponse};
pub use error::{Error, Result, ServerErrorKind};
pub use listener::{Listener, ListenerId};
pub use request::{Endpoint, PreparedRequest, RequestBuilder, RequestContext};
pub use signature::Query;
pub use state::StateStore;
pub use status::{Operation, Status, StatusCategory};
pub use subscription::state::{ConnectionState, Cursor};
pub use token::{
    ChannelPermissions, GroupPermissions, PermissionsBody, Resource, Token, TokenResources,
    UuidPermissions, parse_token,
};
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};
pub use types::{Event, Message, MessageType, PresenceAction, PresenceEvent};
