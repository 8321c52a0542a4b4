//! Loopback HTTP health probing for process-backed models.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

/// Shared health state for one process model. Written by the probe loop and
/// the stderr OOM hook, read by status snapshots.
#[derive(Default)]
pub struct HealthFlags {
    pub consecutive_failures: AtomicU32,
    pub unhealthy: AtomicBool,
    pub cuda_oom: AtomicBool,
}

impl HealthFlags {
    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn has_cuda_oom(&self) -> bool {
        self.cuda_oom.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.unhealthy.store(false, Ordering::Relaxed);
        self.cuda_oom.store(false, Ordering::Relaxed);
    }
}

/// Probe `endpoint` on a fixed interval until cancelled. Crossing the
/// failure threshold flips the model unhealthy and fires `on_unhealthy`
/// once per crossing; the manager decides whether that means a restart.
pub async fn probe_loop<F>(
    model_id: String,
    endpoint: String,
    http: reqwest::Client,
    flags: std::sync::Arc<HealthFlags>,
    settings: HealthSettings,
    cancel: CancellationToken,
    on_unhealthy: F,
) where
    F: Fn() + Send + Sync + 'static,
{
    let mut interval = tokio::time::interval(settings.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {},
        }

        let healthy = match http
            .get(&endpoint)
            .timeout(settings.timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("health probe for {model_id} failed: {e}");
                false
            },
        };

        if healthy {
            flags.consecutive_failures.store(0, Ordering::Relaxed);
            if flags.unhealthy.swap(false, Ordering::Relaxed) {
                debug!("model {model_id} is healthy again");
            }
        } else {
            let failures = flags.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= settings.failure_threshold
                && !flags.unhealthy.swap(true, Ordering::Relaxed)
            {
                warn!("model {model_id} unhealthy after {failures} consecutive probe failures");
                on_unhealthy();
            }
        }
    }
}

/// Probe once, outside the loop; used by the explicit health-check op.
pub async fn probe_once(endpoint: &str, http: &reqwest::Client, timeout: Duration) -> bool {
    matches!(
        http.get(endpoint).timeout(timeout).send().await,
        Ok(response) if response.status().is_success()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn flags_reset_clears_everything() {
        let flags = HealthFlags::default();
        flags.consecutive_failures.store(5, Ordering::Relaxed);
        flags.unhealthy.store(true, Ordering::Relaxed);
        flags.cuda_oom.store(true, Ordering::Relaxed);

        flags.reset();
        assert!(flags.is_healthy());
        assert_eq!(flags.failures(), 0);
        assert!(!flags.has_cuda_oom());
    }

    #[tokio::test]
    async fn probe_loop_fires_on_threshold_crossing() {
        // Nothing listens on this port; every probe fails.
        let endpoint = "http://127.0.0.1:1/health".to_string();
        let flags = Arc::new(HealthFlags::default());
        let cancel = CancellationToken::new();
        let (fired_tx, mut fired_rx) = tokio::sync::mpsc::unbounded_channel();

        let settings = HealthSettings {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
            failure_threshold: 2,
        };
        tokio::spawn(probe_loop(
            "m".into(),
            endpoint,
            reqwest::Client::new(),
            flags.clone(),
            settings,
            cancel.clone(),
            move || {
                let _ = fired_tx.send(());
            },
        ));

        tokio::time::timeout(Duration::from_secs(5), fired_rx.recv())
            .await
            .expect("unhealthy callback fired")
            .unwrap();
        assert!(!flags.is_healthy());
        assert!(flags.failures() >= 2);
        cancel.cancel();
    }
}
