use kube::error::ErrorResponse;
use thiserror::Error;

/// The kinds of failure the cluster API can surface to the reconciler.
///
/// Transport-level detail is flattened into a message; callers decide whether
/// to retry based on the variant alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// An object with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic concurrency was lost to another writer.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The caller is not allowed to perform the request.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// A failure expected to clear up on its own (network blip, throttling, timeout).
    #[error("transient API error: {0}")]
    Transient(String),
    /// A failure retrying will not fix.
    #[error("fatal API error: {0}")]
    Fatal(String),
}

impl ApiError {
    /// Returns true if the request may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transient(_) | ApiError::Conflict(_))
    }
}

impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => response.into(),
            // Anything that never produced a status from the API server is a
            // connectivity or transport problem.
            other => ApiError::Transient(other.to_string()),
        }
    }
}

impl From<ErrorResponse> for ApiError {
    fn from(response: ErrorResponse) -> Self {
        let message = if response.message.is_empty() {
            response.reason.clone()
        } else {
            response.message.clone()
        };
        match response.code {
            404 => ApiError::NotFound(message),
            409 if response.reason == "AlreadyExists" => ApiError::AlreadyExists(message),
            409 => ApiError::Conflict(message),
            401 | 403 => ApiError::Forbidden(message),
            408 | 429 => ApiError::Transient(message),
            code if code >= 500 => ApiError::Transient(message),
            _ => ApiError::Fatal(message),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn response(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} happened", reason),
            reason: reason.to_string(),
            code,
        }
    }

    #[test]
    fn status_codes_map_to_kinds() {
        assert!(matches!(ApiError::from(response(404, "NotFound")), ApiError::NotFound(_)));
        assert!(matches!(
            ApiError::from(response(409, "AlreadyExists")),
            ApiError::AlreadyExists(_)
        ));
        assert!(matches!(ApiError::from(response(409, "Conflict")), ApiError::Conflict(_)));
        assert!(matches!(ApiError::from(response(403, "Forbidden")), ApiError::Forbidden(_)));
        assert!(matches!(
            ApiError::from(response(429, "TooManyRequests")),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            ApiError::from(response(503, "ServiceUnavailable")),
            ApiError::Transient(_)
        ));
        assert!(matches!(ApiError::from(response(422, "Invalid")), ApiError::Fatal(_)));
    }

    #[test]
    fn api_errors_keep_the_server_message() {
        let error = ApiError::from(kube::Error::Api(response(404, "NotFound")));
        assert_eq!(error, ApiError::NotFound("NotFound happened".to_string()));
    }

    #[test]
    fn only_transient_and_conflict_are_retryable() {
        assert!(ApiError::Transient(String::new()).is_retryable());
        assert!(ApiError::Conflict(String::new()).is_retryable());
        assert!(!ApiError::NotFound(String::new()).is_retryable());
        assert!(!ApiError::Forbidden(String::new()).is_retryable());
        assert!(!ApiError::Fatal(String::new()).is_retryable());
    }
}
