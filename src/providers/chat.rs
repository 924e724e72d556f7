use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::generation::{GenerationError, Stage};
use crate::providers::{describe_shape, read_json};
use crate::utils::http::{send_with_retry, OutboundRequest, RetryPolicy};
use crate::utils::timing::log_provider_timing;

const PROVIDER: &str = "chat completions API";

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl ChatClient {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn build_request(&self, prompt: &str) -> OutboundRequest {
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        OutboundRequest::post_json(
            format!("{}/chat/completions", self.base_url.trim_end_matches('/')),
            payload,
            self.timeout,
        )
        .bearer_auth(&self.api_key)
    }

    pub async fn generate(
        &self,
        http: &Client,
        policy: &RetryPolicy,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        if !self.is_configured() {
            return Err(GenerationError::NotConfigured {
                stage: Stage::Text,
                variable: "CHAT_API_KEY",
            });
        }

        let request = self.build_request(prompt);
        log_provider_timing("chat", &self.model, "text", || async {
            let response = send_with_retry(http, &request, policy).await?;
            let body = read_json(response, PROVIDER).await?;
            extract_completion_text(&body)
        })
        .await
    }
}

fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(|part| {
                    part.as_str()
                        .or_else(|| part.get("text").and_then(Value::as_str))
                })
                .collect::<Vec<_>>()
                .join("");
            Some(joined)
        }
        _ => None,
    }
}

/// Pulls the reply out of a completion response. Accepts the chat shape
/// (`choices[0].message.content`, string or parts), the legacy completion
/// shape (`choices[0].text`) and a bare `output_text`.
pub fn extract_completion_text(body: &Value) -> Result<String, GenerationError> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(content_text)
        .or_else(|| {
            body.pointer("/choices/0/text")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            body.get("output_text")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    match text.map(|text| text.trim().to_string()) {
        Some(text) if !text.is_empty() => Ok(text),
        Some(_) => Err(GenerationError::malformed(PROVIDER, "reply text was empty")),
        None => Err(GenerationError::malformed(PROVIDER, describe_shape(body))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::utils::http::get_http_client;
    use crate::utils::http::test_support::spawn_scripted;

    fn client(base_url: &str, api_key: &str) -> ChatClient {
        ChatClient {
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 300,
            temperature: 0.7,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn reads_chat_message_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "  Promo copy \n"}}]});
        assert_eq!(extract_completion_text(&body).unwrap(), "Promo copy");
    }

    #[test]
    fn reads_content_parts_and_legacy_shapes() {
        let parts = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "Warm "},
            {"type": "text", "text": "facades"}
        ]}}]});
        assert_eq!(extract_completion_text(&parts).unwrap(), "Warm facades");

        let legacy = json!({"choices": [{"text": "old style"}]});
        assert_eq!(extract_completion_text(&legacy).unwrap(), "old style");

        let bare = json!({"output_text": "bare"});
        assert_eq!(extract_completion_text(&bare).unwrap(), "bare");
    }

    #[test]
    fn unexpected_shapes_are_malformed() {
        let err = extract_completion_text(&json!({"result": "?"})).unwrap_err();
        assert!(matches!(err, GenerationError::MalformedResponse { .. }));
        assert!(err.to_string().contains("result"));

        let empty = extract_completion_text(&json!({"choices": [{"message": {"content": "  "}}]}));
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let err = client("http://127.0.0.1:9", "")
            .generate(get_http_client(), &RetryPolicy::default(), "test")
            .await
            .unwrap_err();
        assert!(err.is_not_configured());
        assert!(err.to_string().contains("CHAT_API_KEY"));
    }

    #[tokio::test]
    async fn rate_limited_completion_is_retried() {
        let server = spawn_scripted(vec![
            (429, r#"{"error":{"message":"slow down"}}"#),
            (200, r#"{"choices":[{"message":{"content":"Done"}}]}"#),
        ])
        .await;
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let text = client(&format!("{}/v1/", server.base_url), "sk-test")
            .generate(get_http_client(), &policy, "test")
            .await
            .unwrap();

        assert_eq!(text, "Done");
        assert_eq!(server.hits(), 2);
        let request = &server.requests()[1];
        assert_eq!(request.path, "/v1/chat/completions");
        assert_eq!(request.headers["authorization"], "Bearer sk-test");
        let payload: Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(payload["messages"][0]["content"], "test");
        assert_eq!(payload["max_tokens"], 300);
    }
}
