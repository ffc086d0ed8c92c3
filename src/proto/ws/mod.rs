//! WebSocket client core (RFC 6455) with permessage-deflate (RFC 7692).

pub(crate) mod conn;
pub(crate) mod deflate;
pub(crate) mod extension;
pub(crate) mod frame;
pub(crate) mod handshake;

pub use self::conn::{CloseFrame, Message, ReadyState, WebSocket};
