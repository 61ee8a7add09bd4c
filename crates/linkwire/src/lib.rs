//! Transport-agnostic client communication layer.
//!
//! A [`Client`] connects to one of several configured endpoints, retries
//! failed connects, optionally frames payloads with a marker and length
//! header, and reports everything that happens as [`ClientEvent`]s. The
//! byte stream itself comes from a pluggable [`Transport`]: TCP and file
//! transports are built in, and [`testing::MockTransport`] runs in memory.

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod errors;
pub mod events;
pub mod framing;
pub mod session;
pub mod testing;
pub mod traits;
pub mod transports;

pub use buffer::*;
pub use client::*;
pub use config::*;
pub use connection::*;
pub use endpoint::{AddressFamily, Endpoint, EndpointList, Settings};
pub use errors::*;
pub use events::{ClientEvent, ReceiveHandler, ReceivedPayload};
pub use framing::*;
pub use session::*;
pub use traits::*;
pub use transports::*;
