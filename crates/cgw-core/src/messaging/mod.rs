//! Outbound messaging abstractions shared by every transport.

pub mod port;
pub mod throttled;
