//! HTTP/2 client protocol: framing, HPACK and the multiplexed connection.

pub(crate) mod complete;
pub(crate) mod conn;
pub(crate) mod frame;
pub(crate) mod hpack;
