//! Support utilities for [`keen_retry`]'s retry API.
//!
//! We never retry by default. These helpers only come into play when the user
//! asks for retries on the command line.

use keen_retry::RetryResult;
use reqwest::StatusCode;

use crate::{prelude::*, service::ServiceError};

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. `reqwest`
            // doesn't expose most of them in enough detail to be certain.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for ServiceError {
    fn is_known_transient(&self) -> bool {
        match self {
            ServiceError::Http(err) => err.is_known_transient(),
            ServiceError::Status { status, .. } => status.is_known_transient(),
            ServiceError::Timeout => true,
            ServiceError::InvalidResponse(_) | ServiceError::Other(_) => false,
        }
    }
}

/// Classify a service result for [`keen_retry`].
pub(crate) fn into_retry_result<T>(
    result: Result<T, ServiceError>,
) -> RetryResult<(), (), T, ServiceError> {
    match result {
        Ok(output) => RetryResult::Ok {
            reported_input: (),
            output,
        },
        Err(error) if error.is_known_transient() => {
            debug!("Potentially transient error: {:?}", error);
            RetryResult::Transient { input: (), error }
        }
        Err(error) => RetryResult::Fatal { input: (), error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
    }

    #[test]
    fn test_service_errors() {
        let rate_limited = ServiceError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        assert!(rate_limited.is_known_transient());
        assert!(ServiceError::Timeout.is_known_transient());
        assert!(!ServiceError::InvalidResponse("bad".to_owned()).is_known_transient());
        assert!(!ServiceError::Other(anyhow!("auth")).is_known_transient());
    }

    #[test]
    fn test_into_retry_result() {
        assert!(matches!(
            into_retry_result::<()>(Err(ServiceError::Timeout)),
            RetryResult::Transient { .. }
        ));
        assert!(matches!(
            into_retry_result::<()>(Err(ServiceError::Other(anyhow!("no")))),
            RetryResult::Fatal { .. }
        ));
        assert!(matches!(
            into_retry_result(Ok::<_, ServiceError>(1)),
            RetryResult::Ok { output: 1, .. }
        ));
    }
}
