//! HTTP layer of the gateway: routing, caller identity and TLS termination.

pub mod handler;
pub mod identity;
pub mod tls;
