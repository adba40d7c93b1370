use thiserror::Error;

/// Failure taxonomy for calls to either external system.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Credentials were rejected, or a token refresh attempt failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure with no usable response.
    #[error("network failure: {0}")]
    Network(String),

    /// The server answered and marked the request as a business failure.
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
}
