//! Client for the external service that renders edited text as HTML
//!
//! The service takes the raw text as the POST body. On success the response
//! body is the HTML; on failure it may answer with a JSON document describing
//! the problem, which is handed back to the caller untouched.

use std::time::Duration;
use thiserror::Error;

/// Default endpoint of the render service
pub const DEFAULT_RENDER_URL: &str = "http://localhost:8001/render-body";

#[derive(Debug, Error)]
pub enum RenderError {
    /// The service rejected the text and explained why
    #[error("render service rejected the text: {0}")]
    Service(serde_json::Value),
    #[error("render service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("could not reach render service: {0}")]
    Transport(String),
}

/// Blocking HTTP client for the render service
pub struct RenderClient {
    agent: ureq::Agent,
    url: String,
}

impl RenderClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Render `text`, returning the service's HTML
    pub fn render(&self, text: &str) -> Result<String, RenderError> {
        tracing::debug!(url = %self.url, bytes = text.len(), "rendering body");

        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "text/plain; charset=utf-8")
            .send_string(text);

        match response {
            Ok(response) => response
                .into_string()
                .map_err(|e| RenderError::Transport(e.to_string())),
            Err(ureq::Error::Status(status, response)) => {
                let is_json = response.content_type() == "application/json";
                let body = response
                    .into_string()
                    .map_err(|e| RenderError::Transport(e.to_string()))?;
                if is_json {
                    if let Ok(value) = serde_json::from_str(&body) {
                        tracing::warn!(status, "render service reported an error");
                        return Err(RenderError::Service(value));
                    }
                }
                Err(RenderError::Http { status, body })
            }
            Err(ureq::Error::Transport(e)) => Err(RenderError::Transport(e.to_string())),
        }
    }
}
