//! # roomcast-transport
//!
//! Transport adapters for the Roomcast chat engine.
//!
//! Two adapters plug into the core event bus:
//!
//! - **Push** - Persistent bidirectional connections, one bounded queue each
//! - **Bridge** - Request/response calls plus a non-replaying subscription
//!
//! Both translate events through the same [`wire`] mapping, so clients see
//! identical payloads whichever transport they use.
//!
//! ```rust,ignore
//! use roomcast_transport::{Connection, WebSocketConnection};
//!
//! async fn run(mut conn: WebSocketConnection) {
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod bridge;
pub mod local;
pub mod push;
pub mod traits;
pub mod wire;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use bridge::{BridgeAdapter, BridgeSubscription, PullBridge};
pub use local::LocalConnection;
pub use push::PushAdapter;
pub use traits::{Connection, TransportError};
pub use wire::{error_code, error_frame, event_frame, message_frame};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
