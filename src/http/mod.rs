//! HTTP surface: client identification, the rate limit middleware and the
//! server that hosts them.

pub mod client_key;
mod middleware;
mod server;

pub use client_key::client_key;
pub use middleware::{rate_limit, GateState};
pub use server::{router, HttpServer};
