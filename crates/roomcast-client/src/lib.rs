//! # roomcast-client
//!
//! Client side of the Roomcast chat engine.
//!
//! - [`JoinProtocol`] - Pure join state machine that survives duplicate and
//!   stale join attempts
//! - [`JoinDriver`] - Owns the single join deadline timer
//! - [`ClientSession`] - Handshake, joins, posts and heartbeat replies over a
//!   push [`Connection`](roomcast_transport::Connection)
//!
//! ## Example
//!
//! ```rust,no_run
//! use roomcast_client::{ClientSession, DEFAULT_JOIN_TIMEOUT};
//! use roomcast_transport::WebSocketConnection;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = WebSocketConnection::connect("ws://127.0.0.1:8080/ws").await?;
//! let mut session = ClientSession::connect(conn, "alice-token", DEFAULT_JOIN_TIMEOUT).await?;
//!
//! session.join_and_wait("lobby").await?;
//! session.post("Hello, world!").await?;
//!
//! while let Some(event) = session.next_event().await? {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod error;
pub mod join;
pub mod session;

pub use driver::JoinDriver;
pub use error::ClientError;
pub use join::{Effect, JoinFailure, JoinProtocol, JoinState, LeaveCause, DEFAULT_JOIN_TIMEOUT};
pub use session::{ClientEvent, ClientSession, SessionInfo};
