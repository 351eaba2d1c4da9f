//! # ripple-client
//!
//! The Ripple realtime client: a resumable, multiplexed streaming connection
//! to the Ripple service.
//!
//! One [`Realtime`] client owns one logical connection, carried by whichever
//! transport the network allows (WebSocket preferred, HTTP long-poll
//! fallback). Any number of named channels multiplex over it; each channel
//! offers pub/sub messaging and a live presence set. The connection survives
//! transport loss by resuming server-side state, and survives process loss
//! via an exportable recovery key.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ripple_client::{ClientOptions, Data, Realtime, TokenAuth};
//!
//! # async fn run() -> Result<(), ripple_client::ErrorInfo> {
//! let client = Realtime::new(
//!     ClientOptions::for_host("realtime.ripple.dev"),
//!     Arc::new(TokenAuth::new("my-token")),
//! );
//!
//! let orders = client.channel("orders");
//! orders.attach().await?;
//! orders.publish("update", Data::json(serde_json::json!({"id": 7}))).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
mod backoff;
pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod msgqueue;
pub mod options;
pub mod presence;

pub use auth::{AuthProvider, TokenAuth};
pub use channel::{ChannelState, ChannelStateChange};
pub use client::{ChannelHandle, Realtime};
pub use connection::{ConnectionState, ConnectionStatus};
pub use options::ClientOptions;

pub use ripple_protocol::{
    ChannelMode, Data, ErrorInfo, Message, PresenceAction, PresenceMessage,
};
