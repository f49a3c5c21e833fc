//! Resolves a task identifier to an HTTP URL and delivers the job payload.
//!
//! URL resolution is two-step: a development override map first, then the gateway
//! base URL joined with the task identifier.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::job::Job;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no gateway configured and no dev-map entry for task {0}")]
    UnresolvedTask(String),
    #[error("could not construct a URL for task {task}: {source}")]
    InvalidUrl {
        task: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with non-2xx status {status}")]
    NonSuccessStatus { url: String, status: StatusCode },
}

/// Resolves task identifiers to URLs and performs the dispatch POST.
pub struct DispatchClient {
    client: reqwest::Client,
    gateway_base_url: Option<Url>,
    dev_task_url_map: HashMap<String, Url>,
    callback_url: Url,
}

impl DispatchClient {
    pub fn new(
        gateway_base_url: Option<Url>,
        dev_task_url_map: HashMap<String, Url>,
        callback_url: Url,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("taskrunner-worker")
            .build()
            .expect("failed to construct reqwest client for dispatch");

        Self {
            client,
            gateway_base_url,
            dev_task_url_map,
            callback_url,
        }
    }

    /// Resolve a task identifier to the URL it should be dispatched to.
    ///
    /// Resolution order: the development override map first, then
    /// `<gateway_base_url>/<task_identifier>`.
    fn resolve_url(&self, task_identifier: &str) -> Result<Url, DispatchError> {
        if let Some(url) = self.dev_task_url_map.get(task_identifier) {
            return Ok(url.clone());
        }

        let base = self
            .gateway_base_url
            .as_ref()
            .ok_or_else(|| DispatchError::UnresolvedTask(task_identifier.to_owned()))?;

        base.join(task_identifier).map_err(|source| DispatchError::InvalidUrl {
            task: task_identifier.to_owned(),
            source,
        })
    }

    /// POST the job's payload to its resolved URL with the conventional headers.
    /// Returns `Ok(())` on any 2xx response; any other outcome is an error the
    /// Worker records via `fail_job`.
    pub async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        let url = self.resolve_url(&job.task_identifier)?;

        let response = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/json")
            .header("X-Worker-Id", job.locked_by.as_deref().unwrap_or_default())
            .header("X-Job-Id", job.id.to_string())
            .header("X-Database-Id", &job.database_id)
            .header("X-Callback-Url", self.callback_url.as_str())
            .json(&job.payload)
            .send()
            .await
            .map_err(|source| DispatchError::Request {
                url: url.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DispatchError::NonSuccessStatus {
                url: url.to_string(),
                status: response.status(),
            })
        }
    }
}

/// `true` for statuses where retrying later could plausibly resolve the issue: 429 and
/// any 5XX. The store does not distinguish retryable from permanent failures when it
/// records one, so this only informs logging/metrics about likely transient vs
/// permanent causes.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_retryable_status_classifies_5xx_and_429() {
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn resolve_url_prefers_dev_map_over_gateway() {
        let mut dev_map = HashMap::new();
        dev_map.insert(
            "simple-email".to_owned(),
            Url::parse("http://localhost:9001/local-email").unwrap(),
        );
        let client = DispatchClient::new(
            Some(Url::parse("https://gateway.internal/").unwrap()),
            dev_map,
            Url::parse("https://callbacks.internal/").unwrap(),
            Duration::from_secs(5),
        );

        let resolved = client.resolve_url("simple-email").unwrap();
        assert_eq!(resolved.as_str(), "http://localhost:9001/local-email");
    }

    #[test]
    fn resolve_url_falls_back_to_gateway_base() {
        let client = DispatchClient::new(
            Some(Url::parse("https://gateway.internal/").unwrap()),
            HashMap::new(),
            Url::parse("https://callbacks.internal/").unwrap(),
            Duration::from_secs(5),
        );

        let resolved = client.resolve_url("simple-email").unwrap();
        assert_eq!(resolved.as_str(), "https://gateway.internal/simple-email");
    }

    #[test]
    fn resolve_url_errors_without_gateway_or_dev_map_entry() {
        let client = DispatchClient::new(
            None,
            HashMap::new(),
            Url::parse("https://callbacks.internal/").unwrap(),
            Duration::from_secs(5),
        );

        let err = client.resolve_url("simple-email").unwrap_err();
        assert!(matches!(err, DispatchError::UnresolvedTask(task) if task == "simple-email"));
    }
}
