//! LMS Chat wire protocol
//!
//! Frame and event types exchanged between the chat server and its clients,
//! plus the group addressing scheme used by the broadcast fabric.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::ProtocolError;
pub use protocol::{
    inbox_address, parse_inbound, GroupEvent, InboundFrame, OutboundFrame, GROUP_PREFIX,
};

/// Version of the chat protocol
pub const PROTOCOL_VERSION: u8 = 1;
