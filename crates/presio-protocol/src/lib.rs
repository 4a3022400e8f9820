//! # presio-protocol
//!
//! Wire payload definitions and IPC framing for the Presio presence engine.
//!
//! This crate defines what actually crosses the local IPC socket:
//!
//! - `Activity` - the rich-presence payload (text, images, timing, party,
//!   secrets, buttons)
//! - `limits` - per-field byte limits and the `sanitize` step that enforces
//!   them before transmission
//! - `codec` - opcode + length-prefixed JSON packet framing
//! - Shared entities (`User`, `PartyPrivacy`, `Button`)
//!
//! ## Example
//!
//! ```rust
//! use presio_protocol::{codec, Activity, Opcode, Packet};
//!
//! let activity = Activity::new()
//!     .with_details("Exploring")
//!     .with_state("Level 5");
//!
//! let packet = Packet::new(Opcode::Frame, serde_json::to_value(&activity).unwrap());
//! let encoded = codec::encode(&packet).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! ```

pub mod activity;
pub mod codec;
pub mod limits;

pub use activity::{Activity, ActivityAssets, ActivityButton, Party, PartyPrivacy, Secrets, User};
pub use codec::{decode, encode, Opcode, Packet, ProtocolError};
pub use limits::sanitize;
