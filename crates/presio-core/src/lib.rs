//! # presio-core
//!
//! The Presio presence engine.
//!
//! This crate provides the live-state machinery behind a rich-presence
//! session:
//!
//! - **Registry** - hierarchical store of named, lazily-evaluated values
//! - **Scripts** - the expression adapter; never fails, degrades to Null
//! - **Assets** - icon index plus the memoized fallback resolver
//! - **Templates** - user-authored raw expression strings per field
//! - **PresenceClient** - the engine: compiles templates into sanitized
//!   payloads, owns the connection state machine with bounded retry and
//!   duplicate suppression, and runs the join-request gate
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌─────────┐    ┌────────────────┐    ┌───────────┐
//! │ Registry │───▶│ Scripts │───▶│ PresenceClient │───▶│ Transport │
//! └──────────┘    └─────────┘    └────────────────┘    └───────────┘
//!                                        │
//!                                        ▼
//!                                 ┌────────────┐
//!                                 │ AssetIndex │
//!                                 └────────────┘
//! ```
//!
//! One [`PresenceClient`] is constructed per session and owns all mutable
//! state; nothing here is global.

pub mod assets;
pub mod client;
pub mod expr;
pub mod funcs;
pub mod join;
pub mod presence;
pub mod registry;
pub mod script;
pub mod template;
pub mod value;

pub use assets::{Asset, AssetIndex, AssetKind, IconResolver};
pub use client::{ClientConfig, PartySession, PresenceClient, Status};
pub use expr::{EvalContext, Expr, ParseError, Template};
pub use join::JoinGate;
pub use presence::CompiledPresence;
pub use registry::Registry;
pub use script::{format_words, Scripts};
pub use template::{Button, PresenceTemplate};
pub use value::{NativeFn, Producer, Value};
