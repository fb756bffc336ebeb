use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    #[error("upstream produced no data for {0:?}")]
    UpstreamTimeout(Duration),

    #[error("malformed upstream line: {reason}")]
    MalformedLine { reason: String },

    #[error("continuation fragment references unknown tool-call index {index}")]
    MalformedDelta { index: u32 },

    #[error("tool call {call_id} has invalid JSON arguments: {reason}")]
    ToolArgumentParse { call_id: String, reason: String },

    #[error("tool-calling exceeded {max_followup_rounds} follow-up rounds")]
    RoundBudgetExceeded { max_followup_rounds: u32 },

    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
}

impl GatewayError {
    /// Status carried by the caller-facing error chunk.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::UpstreamTransport(_) => 502,
            GatewayError::UpstreamRateLimited(_) => 429,
            GatewayError::UpstreamTimeout(_) => 504,
            GatewayError::RoundBudgetExceeded { .. } => 508,
            GatewayError::MalformedLine { .. }
            | GatewayError::MalformedDelta { .. }
            | GatewayError::ToolArgumentParse { .. }
            | GatewayError::RequestBuild(_) => 500,
        }
    }
}

impl From<async_openai::error::OpenAIError> for GatewayError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        GatewayError::RequestBuild(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::UpstreamTransport(err.to_string())
    }
}
