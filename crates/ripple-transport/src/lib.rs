//! # ripple-transport
//!
//! Byte-transport carriers for the Ripple realtime client.
//!
//! This crate provides a unified client-side interface over two
//! interchangeable carriers:
//!
//! - **WebSocket** - persistent full-duplex socket, the preferred transport
//! - **Comet** - HTTP long-poll fallback for restricted networks
//!
//! plus the machinery the connection manager needs around them: single
//! connect attempts with timeout classification, host candidate lists with
//! fallback pinning, connectivity probes, and the persisted transport
//! preference.
//!
//! ## Transport contract
//!
//! A transport owns its I/O tasks and reports everything that happens on the
//! carrier as a stream of [`TransportEvent`]s.
//!
//! ```rust,ignore
//! use ripple_transport::{attempt, websocket::WebSocketFactory};
//!
//! let active = attempt::connect(&WebSocketFactory::new(), params, timeout).await?;
//! active.transport.send(envelope)?;
//! ```

pub mod attempt;
pub mod connectivity;
pub mod hosts;
mod inbound;
pub mod preference;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "comet")]
pub mod comet;

pub use attempt::{ActiveTransport, AttemptError};
pub use connectivity::{ConnectivityChecker, HttpConnectivity};
pub use hosts::Hosts;
pub use preference::{MemoryPreferenceStore, PreferenceStore, TransportPreference};
pub use traits::{
    ConnectMode, ConnectParams, Transport, TransportError, TransportEvent, TransportFactory,
    TransportKind,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketFactory;

#[cfg(feature = "comet")]
pub use comet::CometFactory;
