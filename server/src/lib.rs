//! LMS Chat server
//!
//! Real-time private messaging for the LMS backend: bearer-token
//! authenticated WebSocket channels, a group broadcast fabric for
//! multi-device fan-out, and an append-only message store.

pub mod auth;
pub mod channel;
pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod fabric;
pub mod routing;
pub mod websocket;

pub use channel::{ChannelState, ChatChannel, ChatServices, FrameOutcome, Participants};
pub use config::ServerConfig;
pub use error::{AuthFailure, ChatError, HandshakeError};
pub use fabric::{GroupFabric, InProcessFabric, Subscription};
pub use websocket::ServerState;
