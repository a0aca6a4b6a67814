use thiserror::Error;

/// An error that happens when fetching size info from the remote endpoint.
///
/// The error is shared verbatim with every caller that joined the failed request,
/// which is why it is [`Clone`] and only carries rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request could not be sent or the response could not be received,
    /// like connection loss, DNS resolution or a transport timeout.
    #[error("network error: {0}")]
    Network(String),
    /// The endpoint answered with a non-success status code.
    #[error("HTTP error! status: {0}")]
    Status(u16),
    /// The response body, or one of its embedded JSON documents, is not valid JSON.
    #[error("JSON parse failed: {0}")]
    Parse(String),
    /// The fetch task ended without producing a result.
    #[error("internal error")]
    Internal,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
