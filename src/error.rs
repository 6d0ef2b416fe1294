//! Error types for the automation library.

use thiserror::Error;

/// Result type alias for automation operations.
pub type Result<T> = std::result::Result<T, AutomationError>;

/// Errors that can occur while driving browsers, tabs, and the crawl frontier.
#[derive(Error, Debug)]
pub enum AutomationError {
    /// HTTP request failed (shepherd, behavior fetch, screenshot upload).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis command failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// CDP WebSocket transport failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to parse or construct JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Shepherd did not return a `reqid` when staging a new browser.
    #[error("browser staging failed: {0}")]
    BrowserStaging(String),

    /// `init_browser` polling never produced a usable response.
    #[error("browser init failed: {0}")]
    BrowserInit(String),

    /// The remote end returned a CDP-level protocol error for a command.
    #[error("CDP error (code {code}): {message}")]
    Cdp {
        /// CDP error code as reported by the remote browser.
        code: i64,
        /// Human readable message accompanying the error code.
        message: String,
    },

    /// A wall-clock budget was exceeded.
    #[error("operation timed out")]
    Timeout,

    /// Generic error with a message, for cases with no dedicated variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_browser_staging() {
        let err = AutomationError::BrowserStaging("no reqid in response".to_string());
        assert_eq!(
            err.to_string(),
            "browser staging failed: no reqid in response"
        );
    }

    #[test]
    fn test_error_display_browser_init() {
        let err = AutomationError::BrowserInit("malformed json".to_string());
        assert_eq!(err.to_string(), "browser init failed: malformed json");
    }

    #[test]
    fn test_error_display_cdp() {
        let err = AutomationError::Cdp {
            code: -32000,
            message: "Target closed".to_string(),
        };
        assert_eq!(err.to_string(), "CDP error (code -32000): Target closed");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = AutomationError::Timeout;
        assert_eq!(err.to_string(), "operation timed out");
    }

    #[test]
    fn test_error_display_other() {
        let err = AutomationError::Other("something went wrong".to_string());
        assert_eq!(err.to_string(), "something went wrong");
    }

    #[test]
    fn test_error_debug() {
        let err = AutomationError::Timeout;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Timeout"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: AutomationError = json_err.into();
        assert!(matches!(err, AutomationError::Json(_)));
    }
}
