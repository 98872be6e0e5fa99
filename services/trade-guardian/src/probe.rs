//! Worker Health Probe
//!
//! HTTP client for the worker's health/status endpoint. A probe never fails:
//! transport and payload problems become an unreachable `HealthSample`.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::types::{HealthSample, Result};

/// Naive timestamp format the trading bot publishes (local time)
const LOCAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Above this a numeric timestamp is taken as milliseconds
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the worker once; `now` is used to age the last decision
    async fn probe(&self, now: DateTime<Utc>) -> HealthSample;
}

/// Probes `GET <health_url>` with a bounded timeout
pub struct HttpHealthProbe {
    health_url: String,
    timestamp_field: String,
    http_client: Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(worker: &WorkerConfig, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(1)
            .build()?;

        Ok(Self {
            health_url: worker.health_url.clone(),
            timestamp_field: worker.timestamp_field.clone(),
            http_client,
            timeout,
        })
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, now: DateTime<Utc>) -> HealthSample {
        let response = match self
            .http_client
            .get(&self.health_url)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let detail = if e.is_timeout() {
                    format!("health request timed out after {:?}", self.timeout)
                } else if e.is_connect() {
                    format!("failed to connect to {}: {}", self.health_url, e)
                } else {
                    format!("health request failed: {}", e)
                };
                warn!("Health probe failed: {}", detail);
                return HealthSample::unreachable(now, detail);
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Health probe returned HTTP {}", status.as_u16());
            let mut sample = HealthSample::unreachable(now, format!("HTTP {}", status.as_u16()));
            sample.http_status = Some(status.as_u16());
            return sample;
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Health payload unreadable: {}", e);
                let mut sample =
                    HealthSample::unreachable(now, format!("malformed health payload: {}", e));
                sample.http_status = Some(status.as_u16());
                return sample;
            }
        };

        let decision_age_secs = lookup(&body, &self.timestamp_field)
            .and_then(parse_timestamp)
            .map(|last| decision_age(last, now));

        if decision_age_secs.is_none() {
            debug!(
                "No usable `{}` in health payload, judging on reachability only",
                self.timestamp_field
            );
        }

        let mut sample = HealthSample::reachable(now, decision_age_secs);
        sample.http_status = Some(status.as_u16());
        sample
    }
}

/// Follow a dotted path such as `status.last_update`
fn lookup<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(body, |value, key| value.get(key))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` in local time, or Unix
/// seconds/milliseconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            let naive = NaiveDateTime::parse_from_str(s, LOCAL_TIMESTAMP_FORMAT).ok()?;
            Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|ts| ts.with_timezone(&Utc))
        }
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() >= MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

/// Whole seconds since `last`; a timestamp in the future counts as fresh
fn decision_age(last: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - last).num_seconds().max(0)
}
