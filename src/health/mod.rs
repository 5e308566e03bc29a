//! Service health checks.
//!
//! This module provides reachability polling for the services around the
//! collaboration layer (room server, diagram renderer, and so on).

mod poller;

pub use poller::HealthPoller;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while setting up health checks
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// One service to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub name: String,
    pub url: String,
}

impl ServiceCheck {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The service answered, whatever the status code
    Online,
    Offline,
    Timeout,
}

/// Outcome of probing one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Polling configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub checks: Vec<ServiceCheck>,
    pub interval: Duration,
    /// Per-check request timeout
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            checks: Vec::new(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
        }
    }
}

impl HealthConfig {
    pub fn new(checks: Vec<ServiceCheck>) -> Self {
        Self {
            checks,
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), HealthError> {
        if self.interval.is_zero() {
            return Err(HealthError::InvalidConfig("interval is zero".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(HealthError::InvalidConfig("timeout is zero".to_string()));
        }
        if let Some(check) = self.checks.iter().find(|c| c.url.is_empty()) {
            return Err(HealthError::InvalidConfig(format!(
                "service {} has no URL",
                check.name
            )));
        }
        Ok(())
    }
}
