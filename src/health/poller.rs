//! Parallel HEAD-request poller.

use futures_util::future::join_all;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{CheckResult, HealthConfig, HealthError, HealthStatus, ServiceCheck};

/// Polls a fixed set of services
pub struct HealthPoller {
    client: reqwest::Client,
    config: HealthConfig,
}

impl HealthPoller {
    pub fn new(config: HealthConfig) -> Result<Self, HealthError> {
        config.validate()?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// Probe one service
    pub async fn check(&self, service: &ServiceCheck) -> CheckResult {
        let started = Instant::now();
        let outcome = self.client.head(&service.url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status, error) = match outcome {
            Ok(response) => {
                debug!("{} answered {} in {}ms", service.name, response.status(), latency_ms);
                (HealthStatus::Online, None)
            }
            Err(e) if e.is_timeout() => (HealthStatus::Timeout, Some(e.to_string())),
            Err(e) => (HealthStatus::Offline, Some(e.to_string())),
        };

        CheckResult {
            name: service.name.clone(),
            status,
            latency_ms,
            error,
            checked_at: chrono::Utc::now(),
        }
    }

    /// Probe every configured service in parallel
    pub async fn check_all(&self) -> Vec<CheckResult> {
        let results = join_all(self.config.checks.iter().map(|s| self.check(s))).await;
        let online = results
            .iter()
            .filter(|r| r.status == HealthStatus::Online)
            .count();
        debug!("Health check: {}/{} online", online, results.len());
        results
    }

    /// Poll on the configured interval, publishing each round
    pub fn spawn(self) -> (watch::Receiver<Vec<CheckResult>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Vec::new());

        let handle = tokio::spawn(async move {
            info!(
                "Health polling {} services every {:?}",
                self.config.checks.len(),
                self.config.interval
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                ticker.tick().await;
                let results = self.check_all().await;
                if tx.send(results).is_err() {
                    debug!("Health results no longer observed, stopping");
                    break;
                }
            }
        });

        (rx, handle)
    }
}
