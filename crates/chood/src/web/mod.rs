//! Web ingress/egress: socket listener, live state, SSE hub, HTTP server.

pub mod server;
pub mod socket;
pub mod sse;
pub mod state;
