use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::generation::{GenerationError, Stage, VideoResult};
use crate::providers::{describe_shape, non_empty_str, read_json};
use crate::utils::http::{send_with_retry, OutboundRequest, RetryPolicy};
use crate::utils::timing::log_provider_timing;

const PROVIDER: &str = "video generation API";

/// DeepAI-style text-to-video client: form-encoded `text` field, `api-key`
/// header.
#[derive(Debug, Clone)]
pub struct VideoClient {
    pub api_key: String,
    pub url: String,
    pub timeout: Duration,
}

impl VideoClient {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn build_request(&self, prompt: &str) -> OutboundRequest {
        OutboundRequest::post_form(
            self.url.clone(),
            vec![("text".to_string(), prompt.to_string())],
            self.timeout,
        )
        .header("api-key", self.api_key.clone())
    }

    pub async fn generate(
        &self,
        http: &Client,
        policy: &RetryPolicy,
        prompt: &str,
    ) -> Result<VideoResult, GenerationError> {
        if !self.is_configured() {
            return Err(GenerationError::NotConfigured {
                stage: Stage::Video,
                variable: "VIDEO_API_KEY",
            });
        }

        let request = self.build_request(prompt);
        log_provider_timing("video", "text2video", "video", || async {
            let response = send_with_retry(http, &request, policy).await?;
            let body = read_json(response, PROVIDER).await?;
            extract_video_result(&body)
        })
        .await
    }
}

/// Reads `output_url`, then `output_urls[0]`. A bare `id` means the provider
/// queued the job and is reported as such.
pub fn extract_video_result(body: &Value) -> Result<VideoResult, GenerationError> {
    let url = non_empty_str(body.get("output_url"))
        .or_else(|| non_empty_str(body.pointer("/output_urls/0")));
    if let Some(url) = url {
        return Ok(VideoResult::Url(url));
    }

    match body.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(VideoResult::JobId(id.trim().to_string())),
        Some(Value::Number(id)) => Ok(VideoResult::JobId(id.to_string())),
        _ => Err(GenerationError::malformed(PROVIDER, describe_shape(body))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::utils::http::get_http_client;
    use crate::utils::http::test_support::spawn_scripted;

    #[test]
    fn prefers_direct_urls_over_job_ids() {
        assert_eq!(
            extract_video_result(&json!({"id": "job-1", "output_url": "https://v/1.mp4"})).unwrap(),
            VideoResult::Url("https://v/1.mp4".to_string())
        );
        assert_eq!(
            extract_video_result(&json!({"output_urls": ["https://v/2.mp4", "https://v/3.mp4"]})).unwrap(),
            VideoResult::Url("https://v/2.mp4".to_string())
        );
        assert_eq!(
            extract_video_result(&json!({"output_url": "", "output_urls": ["https://v/2.mp4"]})).unwrap(),
            VideoResult::Url("https://v/2.mp4".to_string())
        );
        assert_eq!(
            extract_video_result(&json!({"output_url": "  ", "output_urls": [""], "id": "job-7"})).unwrap(),
            VideoResult::JobId("job-7".to_string())
        );
        assert_eq!(
            extract_video_result(&json!({"id": 9001})).unwrap(),
            VideoResult::JobId("9001".to_string())
        );
    }

    #[test]
    fn responses_without_result_fields_are_malformed() {
        let err = extract_video_result(&json!({"status": "queued", "output_urls": []})).unwrap_err();
        assert!(matches!(err, GenerationError::MalformedResponse { .. }));
        assert!(err.to_string().contains("status"));
    }

    #[tokio::test]
    async fn posts_the_prompt_as_a_form() {
        let server = spawn_scripted(vec![
            (503, "upstream busy"),
            (200, r#"{"id": "abc", "output_url": "https://v/reel.mp4"}"#),
        ])
        .await;
        let client = VideoClient {
            api_key: "deepai-key".to_string(),
            url: format!("{}/api/text2video", server.base_url),
            timeout: Duration::from_secs(5),
        };

        let result = client
            .generate(get_http_client(), &RetryPolicy::new(2, Duration::from_millis(1)), "roof insulation")
            .await
            .unwrap();

        assert_eq!(result, VideoResult::Url("https://v/reel.mp4".to_string()));
        assert_eq!(server.hits(), 2);
        let request = &server.requests()[1];
        assert_eq!(request.body, "text=roof+insulation");
        assert_eq!(request.headers["api-key"], "deepai-key");
    }
}
