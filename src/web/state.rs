use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use reqwest::Client;
use sqlx::postgres::PgPoolOptions;

use crate::{
    config::{ConfigProvider, EnvOverride, PgSettings},
    llm::{ChatModel, LlmClient},
    modules::generator::{GenerationPipeline, ImageClient, ImageModel},
    store::{ContentStore, PgStore},
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Clone)]
pub struct AppState {
    config: Arc<dyn ConfigProvider>,
    chat: Arc<dyn ChatModel>,
    images: Arc<dyn ImageModel>,
    store: Arc<dyn ContentStore>,
}

impl AppState {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL env var is missing")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .context("failed to connect to Postgres")?;

        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            config: Arc::new(EnvOverride::new(PgSettings::new(pool.clone()))),
            chat: Arc::new(LlmClient::new(http.clone())),
            images: Arc::new(ImageClient::new(http)),
            store: Arc::new(PgStore::new(pool)),
        })
    }

    pub fn config(&self) -> &dyn ConfigProvider {
        self.config.as_ref()
    }

    pub fn chat_model(&self) -> &dyn ChatModel {
        self.chat.as_ref()
    }

    pub fn generation_pipeline(&self) -> GenerationPipeline {
        GenerationPipeline::new(
            self.config.clone(),
            self.chat.clone(),
            self.images.clone(),
            self.store.clone(),
        )
    }
}
