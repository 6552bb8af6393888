//! Readiness probing: a pluggable probe driven by a fixed interval/timeout
//! pair, with concrete probes for a free TCP port, an HTTP 200, and a
//! Kafka metadata refresh.

mod http;
mod kafka;
mod port;

pub use http::HttpHealthProbe;
pub use kafka::KafkaMetadataProbe;
pub use port::PortFreeProbe;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for readiness")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),
}

/// A readiness condition. Implementors report `Ok(true)` once healthy,
/// `Ok(false)` while still unhealthy, and `Err` on a probe-level failure
/// that should still be retried until the overall timeout elapses.
pub trait Probe {
    fn check(&mut self) -> impl std::future::Future<Output = Result<bool, ProbeError>> + Send;
}

/// Repeatedly invokes a [`Probe`] at a fixed `interval` until it reports
/// healthy or `timeout` elapses.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter {
    interval: Duration,
    timeout: Duration,
}

impl ReadinessWaiter {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Defaults used for Kafka and LocalStack readiness: 1s interval, 10s
    /// timeout, each overridable via `SUBSTRATE_DEPENDENCY_WAIT_*_SECS`.
    pub fn managed_dependency_defaults() -> Self {
        Self::new(
            crate::settings::managed_dependency_wait_interval(),
            crate::settings::managed_dependency_wait_timeout(),
        )
    }

    /// Defaults used for the port-free probe: 1s interval, 5s timeout,
    /// each overridable via `SUBSTRATE_PORT_WAIT_*_SECS`.
    pub fn port_defaults() -> Self {
        Self::new(crate::settings::port_wait_interval(), crate::settings::port_wait_timeout())
    }

    pub async fn wait<P: Probe>(&self, mut probe: P) -> Result<(), WaitError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut last_err: Option<ProbeError> = None;
        let mut ticker = tokio::time::interval(self.interval);
        // first tick fires immediately; reusing `interval` keeps cadence
        // uniform with later ticks.
        loop {
            ticker.tick().await;
            if tokio::time::Instant::now() >= deadline {
                break;
            }

            match tokio::time::timeout(self.interval, probe.check()).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => last_err = Some(e),
                Err(_elapsed) => {
                    // probe hung longer than one interval; treat this tick as
                    // abandoned and keep going until the overall timeout.
                }
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        match last_err {
            Some(e) => Err(WaitError::from(e)),
            None => Err(WaitError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProbe {
        healthy_after: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Probe for CountingProbe {
        async fn check(&mut self) -> Result<bool, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n >= self.healthy_after)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_healthy_probe() {
        let waiter = ReadinessWaiter::new(Duration::from_millis(10), Duration::from_millis(200));
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = CountingProbe {
            healthy_after: 3,
            calls: calls.clone(),
        };

        waiter.wait(probe).await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_if_never_healthy() {
        let waiter = ReadinessWaiter::new(Duration::from_millis(10), Duration::from_millis(50));
        let probe = CountingProbe {
            healthy_after: usize::MAX,
            calls: Arc::new(AtomicUsize::new(0)),
        };

        let err = waiter.wait(probe).await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_)));
    }
}
