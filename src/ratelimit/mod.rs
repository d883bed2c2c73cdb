//! Per-client rate limiting: token buckets, their registry, the idle
//! reaper and the request-time gate.

mod bucket;
mod gate;
mod policy;
mod reaper;
mod registry;

pub use bucket::TokenBucket;
pub use gate::{Decision, Gate};
pub use policy::RateLimitPolicy;
pub use reaper::{Reaper, ReaperHandle, ReaperSettings, Sweep, MAX_CONSECUTIVE_FAILURES};
pub use registry::{ClientRegistry, RegistryEntry};
