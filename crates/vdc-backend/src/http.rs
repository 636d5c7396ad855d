//! Shared request plumbing for the REST clients.

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;

use crate::error::{BackendError, Result};

/// Longest response body kept in a [`BackendError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Send `request` and decode a JSON response.
pub(crate) async fn send_json<T: DeserializeOwned>(request: RequestBuilder, url: &str) -> Result<T> {
    let body = send(request, url).await?;
    serde_json::from_slice(&body).map_err(|e| BackendError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Send `request`, requiring a success status and discarding the body.
pub(crate) async fn send_empty(request: RequestBuilder, url: &str) -> Result<()> {
    send(request, url).await.map(|_| ())
}

async fn send(request: RequestBuilder, url: &str) -> Result<Vec<u8>> {
    let response = request.send().await.map_err(|e| transport_error(url, &e))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(url, &e))?;

    if !status.is_success() {
        tracing::debug!(url, status = status.as_u16(), "backend request rejected");
        return Err(BackendError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body: truncate_body(&String::from_utf8_lossy(&body)),
        });
    }
    Ok(body.to_vec())
}

fn transport_error(url: &str, error: &reqwest::Error) -> BackendError {
    BackendError::Http {
        url: url.to_string(),
        reason: error.to_string(),
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_body() {
        assert_eq!(truncate_body("  not found \n"), "not found");
    }

    #[test]
    fn test_truncate_long_body() {
        let long = "é".repeat(MAX_ERROR_BODY + 10);
        let out = truncate_body(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), MAX_ERROR_BODY + 3);
    }
}
