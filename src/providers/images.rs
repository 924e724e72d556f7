use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::generation::{GeneratedImage, GenerationError, Stage};
use crate::providers::media::prepare_for_upload;
use crate::providers::{describe_shape, non_empty_str, read_json};
use crate::utils::http::{send_with_retry, OutboundRequest, RetryPolicy};
use crate::utils::timing::log_provider_timing;

const PROVIDER: &str = "image generation API";

/// OpenAI-compatible `/images/generations` client.
#[derive(Debug, Clone)]
pub struct ImageClient {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub size: String,
    pub max_side: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    Url(String),
    Base64(String),
}

impl ImageClient {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn build_request(&self, prompt: &str) -> OutboundRequest {
        let mut payload = json!({
            "prompt": prompt,
            "size": self.size,
            "n": 1,
        });
        if !self.model.trim().is_empty() {
            payload["model"] = Value::String(self.model.clone());
        }
        OutboundRequest::post_json(
            format!("{}/images/generations", self.base_url.trim_end_matches('/')),
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
    ) -> Result<GeneratedImage, GenerationError> {
        if !self.is_configured() {
            return Err(GenerationError::NotConfigured {
                stage: Stage::Image,
                variable: "IMAGE_API_KEY",
            });
        }

        let request = self.build_request(prompt);
        let model = if self.model.is_empty() { "default" } else { self.model.as_str() };
        let payload = log_provider_timing("images", model, "image", || async {
            let response = send_with_retry(http, &request, policy).await?;
            let body = read_json(response, PROVIDER).await?;
            extract_image_payload(&body)
        })
        .await?;

        match payload {
            ImagePayload::Url(url) => Ok(GeneratedImage::Url(url)),
            ImagePayload::Base64(encoded) => {
                let bytes = decode_base64_image(&encoded)?;
                let prepared = prepare_for_upload(&bytes, self.max_side)?;
                debug!(
                    "Prepared generated image {}x{} ({} bytes)",
                    prepared.width,
                    prepared.height,
                    prepared.bytes.len()
                );
                Ok(GeneratedImage::Inline(prepared))
            }
        }
    }
}

/// Finds the generated image in a provider response. Tries `data[0].url`,
/// `data[0].b64_json`, then the top-level `url` and `output_url` fields.
pub fn extract_image_payload(body: &Value) -> Result<ImagePayload, GenerationError> {
    if let Some(url) = non_empty_str(body.pointer("/data/0/url")) {
        return Ok(ImagePayload::Url(url));
    }
    if let Some(encoded) = non_empty_str(body.pointer("/data/0/b64_json")) {
        return Ok(ImagePayload::Base64(encoded));
    }
    if let Some(url) = non_empty_str(body.get("url")).or_else(|| non_empty_str(body.get("output_url"))) {
        return Ok(ImagePayload::Url(url));
    }
    Err(GenerationError::malformed(PROVIDER, describe_shape(body)))
}

fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, GenerationError> {
    let data = match encoded.split_once("base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|err| GenerationError::malformed(PROVIDER, format!("invalid base64 image: {err}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::providers::media::decode_image;
    use crate::providers::media::test_images::solid_png;
    use crate::utils::http::get_http_client;
    use crate::utils::http::test_support::spawn_scripted;

    fn client(base_url: &str) -> ImageClient {
        ImageClient {
            api_key: "img-key".to_string(),
            base_url: base_url.to_string(),
            model: String::new(),
            size: "1024x1024".to_string(),
            max_side: 64,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn finds_every_supported_field() {
        assert_eq!(
            extract_image_payload(&json!({"data": [{"url": "https://cdn/a.png"}]})).unwrap(),
            ImagePayload::Url("https://cdn/a.png".to_string())
        );
        assert_eq!(
            extract_image_payload(&json!({"data": [{"b64_json": "aGk="}]})).unwrap(),
            ImagePayload::Base64("aGk=".to_string())
        );
        assert_eq!(
            extract_image_payload(&json!({"output_url": "https://cdn/b.png"})).unwrap(),
            ImagePayload::Url("https://cdn/b.png".to_string())
        );
        assert_eq!(
            extract_image_payload(&json!({"data": [{"url": ""}], "url": "https://cdn/c.png"})).unwrap(),
            ImagePayload::Url("https://cdn/c.png".to_string())
        );
    }

    #[test]
    fn empty_data_is_malformed() {
        let err = extract_image_payload(&json!({"data": []})).unwrap_err();
        assert!(matches!(err, GenerationError::MalformedResponse { .. }));
    }

    #[test]
    fn accepts_data_urls_and_rejects_garbage() {
        let raw = general_purpose::STANDARD.encode(b"png-bytes");
        assert_eq!(decode_base64_image(&raw).unwrap(), b"png-bytes");
        assert_eq!(
            decode_base64_image(&format!("data:image/png;base64,{raw}")).unwrap(),
            b"png-bytes"
        );
        assert!(decode_base64_image("***").is_err());
    }

    #[tokio::test]
    async fn inline_images_are_resized_in_memory() {
        let encoded = general_purpose::STANDARD.encode(solid_png(256, 128, [200, 100, 50, 255]));
        let body = format!(r#"{{"created": 1, "data": [{{"b64_json": "{encoded}"}}]}}"#);
        let server = spawn_scripted(vec![(200, body.as_str())]).await;

        let image = client(&server.base_url)
            .generate(get_http_client(), &RetryPolicy::default(), "banner")
            .await
            .unwrap();

        let GeneratedImage::Inline(prepared) = image else {
            panic!("expected inline image");
        };
        assert_eq!((prepared.width, prepared.height), (64, 32));
        let decoded = decode_image(&prepared.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));

        let request = &server.requests()[0];
        assert_eq!(request.path, "/images/generations");
        let payload: Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(payload["size"], "1024x1024");
        assert!(payload.get("model").is_none());
    }

    #[tokio::test]
    async fn client_errors_fail_the_stage_without_retry() {
        let server = spawn_scripted(vec![(400, r#"{"error":{"message":"content policy"}}"#)]).await;
        let err = client(&server.base_url)
            .generate(get_http_client(), &RetryPolicy::new(4, Duration::from_millis(1)), "banner")
            .await
            .unwrap_err();

        assert_eq!(server.hits(), 1);
        assert!(err.to_string().contains("content policy"));
    }
}
