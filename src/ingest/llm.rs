/// Anthropic Messages API client
///
/// Implements `TextGenerator` for the summary composer. One blocking request
/// per call; the composer owns the timeout and the fallback.
///
/// API Documentation: https://docs.anthropic.com/en/api/messages

use crate::summary::{Generated, TextGenError, TextGenerator};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

// ============================================================================
// Wire Structures
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Token cap for a word budget; roughly two tokens per word plus headroom.
pub fn max_tokens_for(max_words: usize) -> u32 {
    u32::try_from(max_words.saturating_mul(2).saturating_add(50)).unwrap_or(u32::MAX)
}

/// Joins the text blocks of a Messages API response.
fn parse_messages_response(body: &str) -> Result<Generated, TextGenError> {
    let response: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| TextGenError::Transport(format!("unparseable response: {}", e)))?;

    let text = response
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .map(|block| block.text.as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(TextGenError::EmptyResponse);
    }

    Ok(Generated {
        text,
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
    })
}

// ============================================================================
// Client
// ============================================================================

pub struct AnthropicGenerator {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
}

impl AnthropicGenerator {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self, TextGenError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TextGenError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

impl TextGenerator for AnthropicGenerator {
    fn generate(&self, prompt: &str, max_words: usize) -> Result<Generated, TextGenError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: max_tokens_for(max_words),
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    TextGenError::Timeout
                } else {
                    TextGenError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(TextGenError::Http(response.status().as_u16()));
        }

        let body = response
            .text()
            .map_err(|e| TextGenError::Transport(e.to_string()))?;
        parse_messages_response(&body)
    }
}

// ============================================================================
// Tests
// ============================================================================
