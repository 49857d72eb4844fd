use thiserror::Error;

/// Application level error type used throughout the crate.
///
/// None of these are fatal to a session: the view controller catches them at
/// the call that produced them and folds them into feed state.
#[derive(Error, Debug)]
pub enum FeedError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed JSON payload from an upstream API or push frame
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client failure (connect, timeout, status)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure not covered by the HTTP client
    #[error("Transport error: {0}")]
    Transport(String),

    /// Upstream answered but reported `success: false`
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Authorization scope could not be resolved
    #[error("Authorization fetch failed: {0}")]
    AuthorizationFetch(String),

    /// Initial or polling pull failed
    #[error("Pull failed: {0}")]
    Pull(String),

    /// Historical search failed or was rejected
    #[error("Search failed: {0}")]
    Search(String),

    /// Push subscription could not be established or broke
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Export serialization failure
    #[error("Export error: {0}")]
    Export(#[from] csv::Error),
}

/// Convenient alias over [`Result`] using [`FeedError`]
pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FeedError::Search("upstream timeout".to_string());
        assert_eq!(err.to_string(), "Search failed: upstream timeout");

        let err = FeedError::Config("feed.capacity must be greater than zero".into());
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_json_conversion() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: FeedError = parse.unwrap_err().into();
        assert!(matches!(err, FeedError::Json(_)));
    }
}
