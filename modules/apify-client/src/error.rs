use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApifyError>;

#[derive(Debug, Error)]
pub enum ApifyError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Run failed with status: {0}")]
    RunFailed(String),
}

impl ApifyError {
    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Client errors (4xx other than 408/429) mean the input itself was rejected.
    pub fn is_transient(&self) -> bool {
        match self {
            ApifyError::Network(_) | ApifyError::Parse(_) | ApifyError::RunFailed(_) => true,
            ApifyError::Api { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
        }
    }
}

impl From<reqwest::Error> for ApifyError {
    fn from(err: reqwest::Error) -> Self {
        ApifyError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ApifyError {
    fn from(err: serde_json::Error) -> Self {
        ApifyError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> ApifyError {
        ApifyError::Api {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn server_side_failures_are_transient() {
        assert!(api(500).is_transient());
        assert!(api(503).is_transient());
        assert!(api(429).is_transient());
        assert!(api(408).is_transient());
        assert!(ApifyError::RunFailed("TIMED-OUT".into()).is_transient());
        assert!(ApifyError::Network("reset".into()).is_transient());
    }

    #[test]
    fn rejected_input_is_permanent() {
        assert!(!api(400).is_transient());
        assert!(!api(401).is_transient());
        assert!(!api(404).is_transient());
    }
}
