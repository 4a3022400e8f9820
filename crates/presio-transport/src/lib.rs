//! # presio-transport
//!
//! Transport layer for the Presio presence engine.
//!
//! The engine talks to the presence service through the [`Transport`]
//! trait; the concrete [`IpcTransport`] drives the Unix domain socket
//! pipe, handling socket discovery, the handshake, ping replies, and
//! dispatch event forwarding.
//!
//! ```rust,ignore
//! use presio_transport::{IpcTransport, Transport};
//! use tokio::sync::mpsc;
//!
//! let (events_tx, mut events_rx) = mpsc::unbounded_channel();
//! let transport = IpcTransport::new("my-client-id", events_tx);
//! transport.connect().await?;
//! ```

pub mod traits;

#[cfg(unix)]
pub mod ipc;

pub use traits::{EventKind, Transport, TransportError, TransportEvent};

#[cfg(unix)]
pub use ipc::IpcTransport;
