//! HTTP plumbing shared by the source clients.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::{RateLimiter, SourceError};

/// Build the shared async client. Per-request timeouts are layered on top by
/// the retry policy; this one bounds a single connection.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(crate::config::user_agent())
        .timeout(timeout)
        .build()
}

/// Count one request against `limiter`, refusing locally when over budget.
pub fn acquire(limiter: &dyn RateLimiter, key: &str) -> Result<(), SourceError> {
    limiter.try_acquire(key).map_err(|wait| {
        tracing::debug!(source = key, wait_ms = wait.as_millis() as u64, "Local rate limit reached");
        SourceError::RateLimited {
            retry_after: Some(wait),
        }
    })
}

pub fn map_transport_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Unavailable("request timed out".into())
    } else if e.is_connect() {
        SourceError::Unavailable(format!("connection failed: {e}"))
    } else {
        SourceError::Unavailable(e.to_string())
    }
}

/// Map a non-success status to a [`SourceError`].
pub fn map_status(status: StatusCode, retry_after: Option<&str>) -> SourceError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        SourceError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        }
    } else if status.is_server_error() {
        SourceError::Unavailable(format!("server returned {}", status.as_u16()))
    } else {
        SourceError::Rejected {
            status: status.as_u16(),
        }
    }
}

/// Send a GET request and decode its JSON body.
pub async fn get_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, SourceError> {
    let response = request.send().await.map_err(map_transport_error)?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        return Err(map_status(status, retry_after.as_deref()));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| SourceError::Unavailable(format!("malformed response: {e}")))
}

/// Spawn an in-process HTTP server for client tests and return its base url.
#[cfg(test)]
pub(crate) async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
