//! Background eviction of idle clients.
//!
//! The reaper is a tokio task that sweeps a registry on a fixed interval.
//! A panicking sweep is contained: the registry is switched to fail-open
//! until a later sweep succeeds, and after [`MAX_CONSECUTIVE_FAILURES`]
//! panics in a row the task stops with [`FinGateError::ReaperFailed`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::registry::ClientRegistry;
use crate::config::RateLimitingConfig;
use crate::error::{FinGateError, Result};

/// Consecutive sweep panics tolerated before the reaper gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Something the reaper can sweep.
pub trait Sweep: Send + Sync + 'static {
    /// Evict entries idle for longer than `threshold`; returns the count.
    fn sweep(&self, now: Instant, threshold: Duration) -> usize;

    /// Switch request admission to fail-open (or back).
    fn set_fail_open(&self, fail_open: bool);

    /// Number of entries left, for logging.
    fn remaining(&self) -> usize;
}

impl Sweep for ClientRegistry {
    fn sweep(&self, now: Instant, threshold: Duration) -> usize {
        ClientRegistry::sweep(self, now, threshold)
    }

    fn set_fail_open(&self, fail_open: bool) {
        ClientRegistry::set_fail_open(self, fail_open)
    }

    fn remaining(&self) -> usize {
        ClientRegistry::len(self)
    }
}

/// Timing of the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    /// Time between two sweeps
    pub sweep_interval: Duration,
    /// Idle time after which an entry is evicted
    pub eviction_threshold: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            eviction_threshold: Duration::from_secs(600),
        }
    }
}

impl From<&RateLimitingConfig> for ReaperSettings {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            eviction_threshold: config.eviction_threshold(),
        }
    }
}

/// Periodic sweeper for a registry.
pub struct Reaper<S: Sweep = ClientRegistry> {
    target: Arc<S>,
    settings: ReaperSettings,
    consecutive_failures: u32,
}

/// Handle to a running reaper task.
///
/// Dropping the handle cancels the task.
pub struct ReaperHandle {
    token: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl<S: Sweep> Reaper<S> {
    pub fn new(target: Arc<S>, settings: ReaperSettings) -> Self {
        Self {
            target,
            settings,
            consecutive_failures: 0,
        }
    }

    /// Start sweeping on the current tokio runtime.
    ///
    /// The first sweep happens one full interval after spawning.
    pub fn spawn(self) -> ReaperHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(token.clone()));

        ReaperHandle {
            token,
            task: Some(task),
        }
    }

    async fn run(mut self, token: CancellationToken) -> Result<()> {
        let period = self.settings.sweep_interval;
        if period.is_zero() {
            error!("Reaper sweep interval is zero, not starting");
            return Err(FinGateError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            sweep_interval_secs = period.as_secs_f64(),
            eviction_threshold_secs = self.settings.eviction_threshold.as_secs_f64(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Reaper shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.sweep_once(Instant::now())?;
                }
            }
        }
    }

    /// Run a single sweep, containing any panic it raises.
    fn sweep_once(&mut self, now: Instant) -> Result<()> {
        let target = Arc::clone(&self.target);
        let threshold = self.settings.eviction_threshold;

        match panic::catch_unwind(AssertUnwindSafe(|| target.sweep(now, threshold))) {
            Ok(evicted) => {
                if self.consecutive_failures > 0 {
                    info!(
                        failures = self.consecutive_failures,
                        "Sweep recovered, rate limiting re-enabled"
                    );
                }
                self.consecutive_failures = 0;
                target.set_fail_open(false);

                debug!(evicted, remaining = target.remaining(), "Swept idle clients");
                Ok(())
            }
            Err(payload) => {
                self.consecutive_failures += 1;
                target.set_fail_open(true);

                error!(
                    failures = self.consecutive_failures,
                    reason = panic_message(payload.as_ref()),
                    "Sweep panicked, admitting all requests until the next successful sweep"
                );

                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(FinGateError::ReaperFailed {
                        consecutive_failures: self.consecutive_failures,
                    });
                }
                Ok(())
            }
        }
    }
}

impl ReaperHandle {
    /// Wait until the task stops on its own, which only happens when it
    /// failed.
    ///
    /// Resolves immediately with `Ok(())` if the task was already joined.
    pub async fn stopped(&mut self) -> Result<()> {
        match self.task.as_mut() {
            Some(task) => {
                let result = task.await;
                self.task = None;
                result?
            }
            None => Ok(()),
        }
    }

    /// Cancel the task and wait for it to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.token.cancel();
        self.stopped().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn panic_message<'a>(payload: &'a (dyn std::any::Any + Send + 'static)) -> &'a str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wraps a registry and panics on the first `panics` sweeps.
    struct FlakySweep {
        registry: ClientRegistry,
        panics: AtomicU32,
    }

    impl FlakySweep {
        fn new(panics: u32) -> Self {
            Self {
                registry: ClientRegistry::new(RateLimitPolicy::new(1.0, 5).unwrap()),
                panics: AtomicU32::new(panics),
            }
        }
    }

    impl Sweep for FlakySweep {
        fn sweep(&self, now: Instant, threshold: Duration) -> usize {
            if self.panics.load(Ordering::SeqCst) > 0 {
                self.panics.fetch_sub(1, Ordering::SeqCst);
                panic!("sweep exploded");
            }
            self.registry.sweep(now, threshold)
        }

        fn set_fail_open(&self, fail_open: bool) {
            self.registry.set_fail_open(fail_open)
        }

        fn remaining(&self) -> usize {
            self.registry.len()
        }
    }

    fn fast_settings() -> ReaperSettings {
        ReaperSettings {
            sweep_interval: Duration::from_millis(10),
            eviction_threshold: Duration::ZERO,
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = RateLimitingConfig::default();
        let settings = ReaperSettings::from(&config);
        assert_eq!(settings, ReaperSettings::default());
    }

    #[test]
    fn test_sweep_once_evicts() {
        let registry = Arc::new(ClientRegistry::new(RateLimitPolicy::new(1.0, 5).unwrap()));
        let t0 = Instant::now();
        registry.get_or_create("idle", t0);

        let mut reaper = Reaper::new(Arc::clone(&registry), ReaperSettings::default());
        reaper.sweep_once(t0 + Duration::from_secs(601)).unwrap();

        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicking_sweep_fails_open_then_recovers() {
        let target = Arc::new(FlakySweep::new(1));
        let t0 = Instant::now();
        target.registry.get_or_create("client", t0);

        let mut reaper = Reaper::new(Arc::clone(&target), ReaperSettings::default());

        reaper.sweep_once(t0).unwrap();
        assert!(target.registry.is_fail_open());
        assert_eq!(reaper.consecutive_failures, 1);

        reaper.sweep_once(t0).unwrap();
        assert!(!target.registry.is_fail_open());
        assert_eq!(reaper.consecutive_failures, 0);
        assert!(target.registry.contains("client"));
    }

    #[test]
    fn test_repeated_panics_are_fatal() {
        let target = Arc::new(FlakySweep::new(MAX_CONSECUTIVE_FAILURES));
        let mut reaper = Reaper::new(Arc::clone(&target), ReaperSettings::default());
        let now = Instant::now();

        for _ in 1..MAX_CONSECUTIVE_FAILURES {
            assert!(reaper.sweep_once(now).is_ok());
        }

        let result = reaper.sweep_once(now);
        assert!(matches!(
            result,
            Err(FinGateError::ReaperFailed { consecutive_failures }) if consecutive_failures == MAX_CONSECUTIVE_FAILURES
        ));
        assert!(target.registry.is_fail_open());
    }

    #[tokio::test]
    async fn test_spawned_reaper_evicts_and_shuts_down() {
        let registry = Arc::new(ClientRegistry::new(RateLimitPolicy::new(1.0, 5).unwrap()));
        registry.get_or_create("client", Instant::now());

        let handle = Reaper::new(Arc::clone(&registry), fast_settings()).spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty());
        assert!(!handle.is_finished());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_reaper_stops_after_repeated_panics() {
        let target = Arc::new(FlakySweep::new(u32::MAX));
        let mut handle = Reaper::new(Arc::clone(&target), fast_settings()).spawn();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .expect("reaper should stop on its own");

        assert!(matches!(result, Err(FinGateError::ReaperFailed { .. })));
        assert!(handle.is_finished());
        assert!(target.registry.is_fail_open());
    }

    #[tokio::test]
    async fn test_zero_interval_stops_with_config_error() {
        let registry = Arc::new(ClientRegistry::new(RateLimitPolicy::new(1.0, 5).unwrap()));
        let settings = ReaperSettings {
            sweep_interval: Duration::ZERO,
            ..ReaperSettings::default()
        };
        let mut handle = Reaper::new(registry, settings).spawn();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .expect("reaper should stop on its own");
        assert!(matches!(result, Err(FinGateError::Config(_))));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_task() {
        let registry = Arc::new(ClientRegistry::new(RateLimitPolicy::new(1.0, 5).unwrap()));
        let handle = Reaper::new(Arc::clone(&registry), fast_settings()).spawn();
        drop(handle);

        // The task releases its clone of the registry once cancelled
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&registry) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reaper task should exit after its handle is dropped");
    }
}
