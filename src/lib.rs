//! Fingate - per-client request gate for the personal-finance API
//!
//! This crate implements the token-bucket rate limiter that guards every
//! inbound request: one bucket per client address, created on first sight,
//! evicted by a background reaper once the client goes idle.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
