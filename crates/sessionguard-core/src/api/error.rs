use reqwest::StatusCode;

use crate::error::RemoteError;

impl RemoteError {
    /// Classify a non-success HTTP status.
    ///
    /// Rate limiting and server faults say nothing about the session itself,
    /// so they count as transport trouble. Everything else is a refusal.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        match status.as_u16() {
            429 => RemoteError::Network("Rate limited".to_string()),
            500..=599 => RemoteError::Network(format!("Server error {}", status)),
            code => RemoteError::rejected(i64::from(code), body),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_network());
        assert!(RemoteError::from_status(StatusCode::BAD_GATEWAY, "").is_network());
        assert_eq!(
            RemoteError::from_status(StatusCode::FORBIDDEN, "nope"),
            RemoteError::rejected(403, "nope")
        );
    }
}
