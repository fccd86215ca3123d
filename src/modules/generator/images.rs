use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{config::ImageSettings, llm::endpoint_url, models::GeneratedImage};

const IMAGE_SIZE: &str = "1024x1024";

/// One image-generation round trip.
#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn generate(&self, settings: &ImageSettings, prompt: &str) -> Result<GeneratedImage>;
}

/// HTTP client for OpenAI-compatible `/images/generations` endpoints.
#[derive(Clone, Default)]
pub struct ImageClient {
    http: Client,
}

impl ImageClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageModel for ImageClient {
    async fn generate(&self, settings: &ImageSettings, prompt: &str) -> Result<GeneratedImage> {
        let url = endpoint_url(&settings.base_url, "images/generations");
        debug!(%url, model = %settings.model, "requesting image generation");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&settings.api_key)
            .json(&serde_json::json!({
                "model": settings.model,
                "prompt": prompt,
                "n": 1,
                "size": IMAGE_SIZE,
            }))
            .send()
            .await
            .context("failed to call image generation endpoint")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read image generation response")?;
        if !status.is_success() {
            bail!("image endpoint returned {status}: {body}");
        }

        let payload: ImageResponse =
            serde_json::from_str(&body).context("image response is not valid JSON")?;
        image_from_response(payload, prompt)
    }
}

/// Generates the picture for one placement. Errors are returned, not swallowed.
pub struct ImageSynthesizer<'a> {
    model: &'a dyn ImageModel,
    settings: &'a ImageSettings,
}

impl<'a> ImageSynthesizer<'a> {
    pub fn new(model: &'a dyn ImageModel, settings: &'a ImageSettings) -> Self {
        Self { model, settings }
    }

    pub async fn synthesize(&self, prompt: &str) -> Result<GeneratedImage> {
        self.model.generate(self.settings, prompt).await
    }
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    url: Option<String>,
    b64_json: Option<String>,
}

fn image_from_response(payload: ImageResponse, prompt: &str) -> Result<GeneratedImage> {
    let datum = payload
        .data
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("image response contained no data"))?;

    let url = match (datum.url, datum.b64_json) {
        (Some(url), _) if !url.trim().is_empty() => url,
        (_, Some(encoded)) if !encoded.trim().is_empty() => {
            // Only embed payloads that actually decode.
            STANDARD
                .decode(encoded.trim())
                .context("image response carried invalid base64")?;
            format!("data:image/png;base64,{}", encoded.trim())
        }
        _ => bail!("image response had neither url nor b64_json"),
    };

    Ok(GeneratedImage {
        url,
        prompt: prompt.to_string(),
    })
}
