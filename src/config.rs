use std::env;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::PipelineError;

pub const KEY_AI_API_ENDPOINT: &str = "ai_api_endpoint";
pub const KEY_AI_API_KEY: &str = "ai_api_key";
pub const KEY_AI_MODEL: &str = "ai_model";
pub const KEY_IMAGE_API_BASE_URL: &str = "image_api_base_url";
pub const KEY_IMAGE_API_KEY: &str = "image_api_key";
pub const KEY_IMAGE_MODEL: &str = "image_model";
pub const KEY_SUMMARY_CONCURRENCY: &str = "summary_concurrency";
pub const KEY_ARTICLE_IMAGE_COUNT: &str = "article_image_count";

pub const DEFAULT_SUMMARY_CONCURRENCY: usize = 5;
pub const MAX_SUMMARY_CONCURRENCY: usize = 10;
pub const DEFAULT_ARTICLE_IMAGE_COUNT: usize = 3;
pub const MAX_ARTICLE_IMAGE_COUNT: usize = 6;

/// Key-value lookup for runtime settings.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
}

/// Settings persisted in the `settings` table.
#[derive(Clone)]
pub struct PgSettings {
    pool: PgPool,
}

impl PgSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigProvider for PgSettings {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read setting {key}"))
    }
}

/// Environment variables (upper-cased key) take precedence over `inner`.
pub struct EnvOverride<P> {
    inner: P,
    lookup: fn(&str) -> Option<String>,
}

impl<P> EnvOverride<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            lookup: |name| env::var(name).ok(),
        }
    }

    #[cfg(test)]
    fn with_lookup(inner: P, lookup: fn(&str) -> Option<String>) -> Self {
        Self { inner, lookup }
    }
}

#[async_trait]
impl<P: ConfigProvider> ConfigProvider for EnvOverride<P> {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = non_blank((self.lookup)(&key.to_ascii_uppercase())) {
            return Ok(Some(value));
        }
        Ok(non_blank(self.inner.get_setting(key).await?))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn lookup(provider: &dyn ConfigProvider, key: &str) -> Result<Option<String>, PipelineError> {
    provider
        .get_setting(key)
        .await
        .map(non_blank)
        .map_err(PipelineError::Settings)
}

/// Credentials for the chat-completion endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct AiSettings {
    pub api_endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl AiSettings {
    /// Resolve all three fields or report every one that is missing.
    pub async fn resolve(provider: &dyn ConfigProvider) -> Result<Self, PipelineError> {
        let api_endpoint = lookup(provider, KEY_AI_API_ENDPOINT).await?;
        let api_key = lookup(provider, KEY_AI_API_KEY).await?;
        let model = lookup(provider, KEY_AI_MODEL).await?;

        match (api_endpoint, api_key, model) {
            (Some(api_endpoint), Some(api_key), Some(model)) => Ok(Self {
                api_endpoint,
                api_key,
                model,
            }),
            (api_endpoint, api_key, model) => {
                let missing = [
                    (KEY_AI_API_ENDPOINT, api_endpoint.is_none()),
                    (KEY_AI_API_KEY, api_key.is_none()),
                    (KEY_AI_MODEL, model.is_none()),
                ]
                .into_iter()
                .filter_map(|(key, absent)| absent.then_some(key))
                .collect::<Vec<_>>();
                Err(PipelineError::Config(format!(
                    "AI 配置不完整，缺少: {}",
                    missing.join(", ")
                )))
            }
        }
    }
}

/// Credentials for the image-generation endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl ImageSettings {
    /// `None` unless every image field is configured.
    pub async fn resolve(provider: &dyn ConfigProvider) -> Result<Option<Self>, PipelineError> {
        let base_url = lookup(provider, KEY_IMAGE_API_BASE_URL).await?;
        let api_key = lookup(provider, KEY_IMAGE_API_KEY).await?;
        let model = lookup(provider, KEY_IMAGE_MODEL).await?;

        Ok(match (base_url, api_key, model) {
            (Some(base_url), Some(api_key), Some(model)) => Some(Self {
                base_url,
                api_key,
                model,
            }),
            _ => None,
        })
    }
}

/// Numeric setting with a default and an inclusive `1..=max` clamp.
pub async fn bounded_setting(
    provider: &dyn ConfigProvider,
    key: &str,
    default: usize,
    max: usize,
) -> usize {
    let configured = match provider.get_setting(key).await {
        Ok(value) => non_blank(value).and_then(|v| v.parse::<usize>().ok()),
        Err(err) => {
            tracing::warn!(?err, key, "failed to read numeric setting, using default");
            None
        }
    };
    configured.unwrap_or(default).clamp(1, max)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    /// In-memory settings used by tests across the crate.
    #[derive(Default, Clone)]
    pub struct StaticSettings(pub HashMap<String, String>);

    impl StaticSettings {
        pub fn with(mut self, key: &str, value: &str) -> Self {
            self.0.insert(key.to_string(), value.to_string());
            self
        }

        pub fn ai_ready() -> Self {
            Self::default()
                .with(KEY_AI_API_ENDPOINT, "https://llm.example.com/v1")
                .with(KEY_AI_API_KEY, "sk-test")
                .with(KEY_AI_MODEL, "gpt-test")
        }

        pub fn with_images(self) -> Self {
            self.with(KEY_IMAGE_API_BASE_URL, "https://img.example.com/v1")
                .with(KEY_IMAGE_API_KEY, "img-key")
                .with(KEY_IMAGE_MODEL, "img-model")
        }
    }

    #[async_trait]
    impl ConfigProvider for StaticSettings {
        async fn get_setting(&self, key: &str) -> Result<Option<String>> {
            Ok(self.0.get(key).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticSettings;
    use super::*;

    fn fake_env(name: &str) -> Option<String> {
        match name {
            "AI_MODEL" => Some("env-model".to_string()),
            "AI_API_KEY" => Some("   ".to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn env_overrides_persisted_value() {
        let provider = EnvOverride::with_lookup(StaticSettings::ai_ready(), fake_env);
        let settings = AiSettings::resolve(&provider).await.expect("settings");
        assert_eq!(settings.model, "env-model");
        // Blank env values fall through to the persisted setting.
        assert_eq!(settings.api_key, "sk-test");
    }

    #[tokio::test]
    async fn missing_ai_fields_are_listed() {
        let provider = StaticSettings::default().with(KEY_AI_MODEL, "m");
        let err = AiSettings::resolve(&provider).await.expect_err("incomplete");
        let message = err.to_string();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(message.contains(KEY_AI_API_ENDPOINT));
        assert!(message.contains(KEY_AI_API_KEY));
        assert!(!message.contains(KEY_AI_MODEL));
    }

    #[tokio::test]
    async fn image_settings_require_all_fields() {
        let partial = StaticSettings::ai_ready().with(KEY_IMAGE_API_KEY, "k");
        assert_eq!(ImageSettings::resolve(&partial).await.expect("ok"), None);

        let full = StaticSettings::ai_ready().with_images();
        let settings = ImageSettings::resolve(&full).await.expect("ok").expect("some");
        assert_eq!(settings.model, "img-model");
    }

    #[tokio::test]
    async fn bounded_setting_clamps_and_defaults() {
        let provider = StaticSettings::default()
            .with(KEY_SUMMARY_CONCURRENCY, "50")
            .with(KEY_ARTICLE_IMAGE_COUNT, "abc");
        assert_eq!(
            bounded_setting(&provider, KEY_SUMMARY_CONCURRENCY, 5, 10).await,
            10
        );
        assert_eq!(
            bounded_setting(&provider, KEY_ARTICLE_IMAGE_COUNT, 3, 6).await,
            3
        );
    }
}
