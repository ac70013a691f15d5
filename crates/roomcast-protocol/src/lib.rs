//! # roomcast-protocol
//!
//! Wire protocol definitions for the Roomcast chat engine.
//!
//! The protocol has two encodings of one frame set:
//!
//! - the push channel sends length-prefixed MessagePack frames
//! - the bridge subscription stream sends JSON frames
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake and authentication
//! - `Join` / `Leave` / `Post` - Requests, answered by `Joined` / `Ack` / `Error`
//! - `Ping` / `Pong` - Heartbeat
//! - `UserJoined` / `UserLeft` / `MessagePosted` / `RoomDeleted` - Room events
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, Frame};
//!
//! let frame = Frame::post(7, "lobby", "Hello, world!");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use frames::{codes, Frame, FrameType, MessageKind};
pub use version::{Version, PROTOCOL_VERSION};
