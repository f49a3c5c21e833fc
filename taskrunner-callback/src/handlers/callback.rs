//! The callback endpoint task functions POST to once they've finished a job.
//!
//! Resolves the job the `X-Worker-Id`/`X-Job-Id` headers identify — the same headers
//! the Dispatch Client attached to the original outbound request, so the function only
//! has to echo them back.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use taskrunner_core::metrics::{record_job_completed, record_job_failed};
use taskrunner_core::store::JobStore;
use tracing::{debug, error};

use crate::error::CallbackError;

#[derive(Deserialize, Debug)]
pub struct CallbackRequestBody {
    /// `true` if the function finished the job successfully.
    pub complete: bool,
    /// The error to record, required when `complete` is `false`.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Serialize, Default)]
pub struct CallbackResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

fn bad_request(message: &str) -> (StatusCode, Json<CallbackResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(CallbackResponse {
            error: Some(message.to_owned()),
        }),
    )
}

/// A job not found under `worker_id`'s lock is stale: already resolved by an earlier
/// callback, or reassigned after this worker's claim was reclaimed.
fn stale_job(job_id: i64) -> (StatusCode, Json<CallbackResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(CallbackResponse {
            error: Some(format!("job {job_id} is not locked by the calling worker")),
        }),
    )
}

pub async fn post(
    State(store): State<Arc<dyn JobStore>>,
    headers: HeaderMap,
    Json(body): Json<CallbackRequestBody>,
) -> Result<Json<CallbackResponse>, (StatusCode, Json<CallbackResponse>)> {
    let worker_id = headers
        .get("X-Worker-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing X-Worker-Id header"))?;

    let job_id = headers
        .get("X-Job-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing X-Job-Id header"))?
        .parse::<i64>()
        .map_err(|_| bad_request("X-Job-Id header is not a valid job id"))?;

    debug!("callback for job {} from worker {}: complete={}", job_id, worker_id, body.complete);

    if body.complete {
        match store.complete_job(worker_id, job_id).await.map_err(CallbackError::from).map_err(internal_error)? {
            Some(job) => record_job_completed(&job.task_identifier),
            None => return Err(stale_job(job_id)),
        }
    } else {
        let message = body.error.unwrap_or_else(|| "task reported failure with no error message".to_owned());
        match store
            .fail_job(worker_id, job_id, &message)
            .await
            .map_err(CallbackError::from)
            .map_err(internal_error)?
        {
            Some(job) => record_job_failed(&job.task_identifier, job.attempts >= job.max_attempts),
            None => return Err(stale_job(job_id)),
        }
    }

    Ok(Json(CallbackResponse::default()))
}

fn internal_error(error: CallbackError) -> (StatusCode, Json<CallbackResponse>) {
    error!("failed to record callback outcome: {}", error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(CallbackResponse {
            error: Some(error.to_string()),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{self, Request};
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::json;
    use taskrunner_core::job::NewJobOptions;
    use taskrunner_core::store::MemoryJobStore;
    use tower::ServiceExt;

    fn app(store: Arc<dyn JobStore>) -> Router {
        crate::handlers::app::add_routes(Router::new(), store)
    }

    #[tokio::test]
    async fn completing_a_job_deletes_it() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());
        let id = store.add_job("db1", "t", json!({}), NewJobOptions::default()).await.unwrap();
        store.get_job("worker-1", None).await.unwrap();

        let response = app(store.clone())
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header("Content-Type", "application/json")
                    .header("X-Worker-Id", "worker-1")
                    .header("X-Job-Id", id.to_string())
                    .body(Body::from(serde_json::to_vec(&json!({"complete": true})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{}");
    }

    #[tokio::test]
    async fn failing_a_job_reschedules_it() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());
        let id = store
            .add_job("db1", "t", json!({}), NewJobOptions::default().max_attempts(5))
            .await
            .unwrap();
        store.get_job("worker-1", None).await.unwrap();

        let response = app(store)
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header("Content-Type", "application/json")
                    .header("X-Worker-Id", "worker-1")
                    .header("X-Job-Id", id.to_string())
                    .body(Body::from(serde_json::to_vec(&json!({"complete": false, "error": "boom"})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn callback_for_a_job_not_locked_by_the_caller_is_stale() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());
        let id = store.add_job("db1", "t", json!({}), NewJobOptions::default()).await.unwrap();
        store.get_job("worker-1", None).await.unwrap();

        let response = app(store)
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header("Content-Type", "application/json")
                    .header("X-Worker-Id", "worker-2")
                    .header("X-Job-Id", id.to_string())
                    .body(Body::from(serde_json::to_vec(&json!({"complete": true})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_headers_are_rejected() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());

        let response = app(store)
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_vec(&json!({"complete": true})).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
