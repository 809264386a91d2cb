use std::fmt;

/// Classified provider error: tells the caller why the LLM call failed
/// so it can pick the right recovery strategy.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403, bad API key or permissions.
    Auth,
    /// 429, rate limited.
    RateLimit,
    /// 400 with a context-length complaint. The conversation must shrink
    /// before the same request can succeed.
    ContextOverflow,
    /// 404 or "model not found".
    NotFound,
    /// 408, request timeout, or provider took too long.
    Timeout,
    /// Connection refused, DNS failure, reset.
    Network,
    /// 500/502/503/504, provider-side outage.
    ServerError,
    /// Anything else.
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            400 if body.contains("maximum context length") || body.contains("context") => {
                ProviderErrorKind::ContextOverflow
            }
            401 | 403 => ProviderErrorKind::Auth,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
        }
    }

    /// Whether shrinking the conversation and retrying can help.
    pub fn is_context_overflow(&self) -> bool {
        self.kind == ProviderErrorKind::ContextOverflow
    }

    /// Whether this error is worth retrying with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::ServerError
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "Provider error ({}, {:?}): {}", status, self.kind, self.message)
        } else {
            write!(f, "Provider error ({:?}): {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

fn truncate_body(body: &str) -> String {
    if body.len() > 300 {
        let mut end = 300;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_overflow_detected_on_400_with_context_text() {
        let err = ProviderError::from_status(
            400,
            r#"{"error": {"message": "This model's maximum context length is 65536 tokens"}}"#,
        );
        assert!(err.is_context_overflow());
        assert!(!err.is_retryable());

        let err = ProviderError::from_status(400, "context window exceeded");
        assert!(err.is_context_overflow());
    }

    #[test]
    fn plain_400_is_unknown() {
        let err = ProviderError::from_status(400, "invalid request: missing model");
        assert!(!err.is_context_overflow());
        assert_eq!(err.kind, ProviderErrorKind::Unknown);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ProviderError::from_status(401, "").kind, ProviderErrorKind::Auth);
        assert_eq!(ProviderError::from_status(429, "").kind, ProviderErrorKind::RateLimit);
        assert_eq!(ProviderError::from_status(503, "").kind, ProviderErrorKind::ServerError);
        assert!(ProviderError::from_status(503, "").is_retryable());
        assert!(!ProviderError::from_status(401, "").is_retryable());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let err = ProviderError::from_status(500, &body);
        assert!(err.message.len() < 400);
        assert!(err.message.ends_with("..."));
    }
}
