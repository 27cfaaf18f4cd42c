use reqwest::{StatusCode, Url};
use thiserror::Error;
use url::ParseError;

/// Result alias for service lookups.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The registry address could not be turned into a URL.
    #[error("invalid registry address '{url}': {source}")]
    InvalidAddress {
        url: String,
        #[source]
        source: ParseError,
    },

    /// The underlying HTTP client returned an error.
    #[error("registry request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The registry answered with a non-success status.
    #[error("registry returned {status} for {url}")]
    Http { status: StatusCode, url: Url },
}
