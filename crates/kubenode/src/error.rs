//! Classification of remote call failures.
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed call against the Kubernetes API (or the kubelet).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Worth retrying: network trouble, server errors, conflicts, throttling.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The request itself is wrong and won't succeed if repeated.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The object doesn't exist.
    #[error("not found")]
    NotFound,
    /// A create raced with an existing object.
    #[error("already exists")]
    AlreadyExists,
}

impl ApiError {
    /// Whether the call should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
                (404, _) => ApiError::NotFound,
                (409, "AlreadyExists") => ApiError::AlreadyExists,
                (409, _) | (429, _) => ApiError::Transient(response.message),
                (code, _) if code >= 500 => ApiError::Transient(response.message),
                (_, reason) => ApiError::Permanent(format!("{}: {}", reason, response.message)),
            },
            kube::Error::SerdeError(e) => ApiError::Permanent(e.to_string()),
            other => ApiError::Transient(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() => ApiError::Permanent(e.to_string()),
            _ => ApiError::Transient(e.to_string()),
        }
    }
}

/// Runs `fut` with a deadline. An elapsed deadline is a transient failure.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Transient(format!(
            "deadline of {:?} elapsed",
            deadline
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_by_status_and_reason() {
        assert_eq!(ApiError::from(api_error(404, "NotFound")), ApiError::NotFound);
        assert_eq!(
            ApiError::from(api_error(409, "AlreadyExists")),
            ApiError::AlreadyExists
        );
        assert!(ApiError::from(api_error(409, "Conflict")).is_transient());
        assert!(ApiError::from(api_error(429, "TooManyRequests")).is_transient());
        assert!(ApiError::from(api_error(503, "ServiceUnavailable")).is_transient());
        for (code, reason) in &[
            (400, "BadRequest"),
            (403, "Forbidden"),
            (405, "MethodNotAllowed"),
            (422, "Invalid"),
        ] {
            assert!(matches!(
                ApiError::from(api_error(*code, reason)),
                ApiError::Permanent(_)
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_is_transient() {
        let result: Result<(), ApiError> = with_deadline(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_transient());
    }
}
