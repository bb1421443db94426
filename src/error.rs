//! Error types shared by the API client, the settings store and the synchronizer

/// Failure modes of one round trip to the solar API.
///
/// The client never panics or retries: every failure is returned as one of
/// these variants and the synchronizer decides what happens next.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The API key was missing or rejected (HTTP 401/403)
    #[error("API key was rejected, reconfigure credentials")]
    Unauthorized,

    /// No network path to the API (offline, DNS, connection refused)
    #[error("Solar API is unreachable")]
    Unreachable,

    #[error("Request exceeded its deadline")]
    Timeout,

    /// The body did not match the documented JSON shape
    #[error("Malformed response from solar API")]
    MalformedResponse,

    #[error("Solar API returned HTTP {0}")]
    ServerError(u16),

    /// No API key is stored, so no request was attempted
    #[error("No API key configured")]
    NotConfigured,
}

impl FetchError {
    /// Whether the next poll cycle should simply try again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Unauthorized | FetchError::NotConfigured)
    }
}

/// Errors raised while persisting settings
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Settings file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_credential_errors_are_permanent() {
        assert!(!FetchError::Unauthorized.is_transient());
        assert!(!FetchError::NotConfigured.is_transient());
        assert!(FetchError::Unreachable.is_transient());
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::MalformedResponse.is_transient());
        assert!(FetchError::ServerError(503).is_transient());
    }

    #[test]
    fn server_error_message_includes_status() {
        assert_eq!(
            FetchError::ServerError(502).to_string(),
            "Solar API returned HTTP 502"
        );
    }
}
