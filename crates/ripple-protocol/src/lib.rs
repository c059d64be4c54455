//! # ripple-protocol
//!
//! Wire protocol definitions for the ripple realtime server.
//!
//! ripple speaks the Pusher Channels protocol (v7 subset) over WebSocket
//! text frames. This crate defines the protocol surface shared by the
//! engine and the server front end:
//!
//! - Event names, channel prefixes, close codes, and size limits
//! - Channel-name validation and channel-kind classification
//! - Inbound frame parsing and outbound frame builders
//! - `BroadcastMessage`, the unit of cross-node transport
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{frames, ChannelKind};
//!
//! assert_eq!(ChannelKind::of("presence-room"), ChannelKind::Presence);
//!
//! let frame = frames::pong();
//! assert_eq!(frame, r#"{"event":"pusher:pong"}"#);
//! ```

pub mod constants;
pub mod frames;
pub mod message;

pub use constants::{is_valid_channel_name, ChannelKind};
pub use frames::{ClientFrame, FrameError};
pub use message::BroadcastMessage;
