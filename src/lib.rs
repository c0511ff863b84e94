//! Wisp relay server: terminates Wisp-over-WebSocket sessions and proxies
//! their streams to TCP and UDP destinations.

pub mod server;
pub mod wisp;
