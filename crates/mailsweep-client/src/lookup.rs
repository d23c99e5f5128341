//! Person-enrichment lookups for validated addresses.
//!
//! The upstream API budgets 10 requests per minute, so every call goes
//! through a [`MinIntervalGate`] that spaces requests at least 10 s apart
//! regardless of how fast the caller iterates.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use mailsweep_core::error::AppError;

/// Minimum spacing between lookup calls.
pub const LOOKUP_INTERVAL: Duration = Duration::from_secs(10);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Serialises callers so that consecutive permits are at least `interval`
/// apart. The lock is held across the sleep on purpose: a second caller
/// queues behind the first instead of racing it.
pub struct MinIntervalGate {
    interval: Duration,
    last: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl MinIntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }
}

/// What the enrichment API knows about an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    /// Full response body, for fields the typed view does not cover.
    pub raw: Value,
}

impl Person {
    /// Tolerant extraction: the API has shipped both `name` and `full_name`,
    /// and address under two different keys.
    pub fn from_value(raw: Value) -> Self {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| raw.get(k).and_then(Value::as_str))
                .map(str::to_string)
        };
        Self {
            name: get(&["name", "full_name"]),
            phone: get(&["phone", "phone_number"]),
            address: get(&["address", "location", "city"]),
            raw,
        }
    }
}

#[derive(Debug)]
pub enum LookupOutcome {
    Found(Person),
    NotFound,
    RateLimited,
}

/// Rate-limited client for the person-enrichment REST API.
pub struct PersonLookup {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    gate: MinIntervalGate,
}

impl PersonLookup {
    pub fn new(endpoint: &str, api_key: impl Into<String>) -> Result<Self, AppError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AppError::Generic(format!("invalid lookup endpoint: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AppError::Generic(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            gate: MinIntervalGate::new(LOOKUP_INTERVAL),
        })
    }

    pub async fn lookup(&self, email: &str) -> Result<LookupOutcome, AppError> {
        self.gate.acquire().await;

        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("email", email);

        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| AppError::transport(format!("lookup request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(LookupOutcome::NotFound),
            StatusCode::TOO_MANY_REQUESTS => {
                tracing::warn!(email, "lookup rate limited upstream");
                Ok(LookupOutcome::RateLimited)
            }
            status if status.is_success() => {
                let raw: Value = response
                    .json()
                    .await
                    .map_err(|e| AppError::transport(format!("lookup response malformed: {e}")))?;
                Ok(LookupOutcome::Found(Person::from_value(raw)))
            }
            status => Err(AppError::Generic(format!(
                "lookup returned unexpected status {status}"
            ))),
        }
    }
}
