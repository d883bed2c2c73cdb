//! Request-time admission decisions.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use super::policy::RateLimitPolicy;
use super::reaper::{Reaper, ReaperHandle, ReaperSettings};
use super::registry::ClientRegistry;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// Outcome of checking one request against the gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Seconds the caller should wait before retrying; zero when allowed
    pub retry_after_secs: u64,
    /// Sustained requests per second per client
    pub limit: f64,
    /// Bucket capacity per client
    pub burst: u32,
}

impl Decision {
    fn allow(limit: f64, burst: u32) -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            limit,
            burst,
        }
    }
}

/// The per-client rate limiter as seen by the request-handling layer.
///
/// A gate built from a disabled configuration keeps no state and admits
/// every request.
#[derive(Debug)]
pub struct Gate {
    limit: f64,
    burst: u32,
    registry: Option<Arc<ClientRegistry>>,
}

impl Gate {
    /// Build a gate from configuration.
    ///
    /// Fails if limiting is enabled with a non-positive request rate or a
    /// zero sweep interval.
    pub fn new(config: &RateLimitingConfig) -> Result<Self> {
        if !config.enabled {
            debug!("Rate limiting disabled, gate admits every request");
            return Ok(Self::disabled(config.requests_per_second, config.burst));
        }

        config.validate()?;
        Ok(Self::with_policy(config.policy()?))
    }

    /// An enabled gate with its own empty registry.
    pub fn with_policy(policy: RateLimitPolicy) -> Self {
        Self {
            limit: policy.requests_per_second(),
            burst: policy.burst(),
            registry: Some(Arc::new(ClientRegistry::new(policy))),
        }
    }

    /// A pass-through gate. The values are only echoed back in decisions.
    pub fn disabled(limit: f64, burst: u32) -> Self {
        Self {
            limit,
            burst,
            registry: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.is_some()
    }

    /// Registry backing this gate, `None` when disabled.
    pub fn registry(&self) -> Option<&Arc<ClientRegistry>> {
        self.registry.as_ref()
    }

    /// Start the idle-client reaper for this gate's registry.
    ///
    /// Returns `None` for a disabled gate, which has nothing to sweep.
    pub fn spawn_reaper(&self, settings: ReaperSettings) -> Option<ReaperHandle> {
        self.registry
            .as_ref()
            .map(|registry| Reaper::new(Arc::clone(registry), settings).spawn())
    }

    /// Decide whether a request from `client_key` at `now` may proceed.
    pub fn check(&self, client_key: &str, now: Instant) -> Decision {
        let Some(registry) = self.registry.as_ref() else {
            return Decision::allow(self.limit, self.burst);
        };

        if registry.is_fail_open() {
            trace!(client = %client_key, "Registry is failing open, admitting request");
            return Decision::allow(self.limit, self.burst);
        }

        let entry = registry.get_or_create(client_key, now);
        if entry.allow(now) {
            return Decision::allow(self.limit, self.burst);
        }

        debug!(
            client = %client_key,
            wait_ms = entry.time_until_available().map(|d| d.as_millis() as u64),
            "Client bucket empty"
        );

        Decision {
            allowed: false,
            retry_after_secs: registry.policy().retry_after_secs(),
            limit: self.limit,
            burst: self.burst,
        }
    }
}
