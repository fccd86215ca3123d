use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::NewArticle;

/// Minimal view of a saved search the generated article came from.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SearchRecord {
    pub id: String,
    pub keyword: String,
}

/// Row access the pipeline needs from the surrounding application.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn search_by_id(&self, id: &str) -> Result<Option<SearchRecord>>;

    /// Persist an article and return its id.
    async fn create_article(&self, article: NewArticle) -> Result<String>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentStore for PgStore {
    async fn search_by_id(&self, id: &str) -> Result<Option<SearchRecord>> {
        sqlx::query_as::<_, SearchRecord>(
            "SELECT id::text AS id, keyword FROM searches WHERE id::text = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load search {id}"))
    }

    async fn create_article(&self, article: NewArticle) -> Result<String> {
        let id = Uuid::new_v4();
        let images = serde_json::to_value(&article.images).context("failed to encode image list")?;

        sqlx::query(
            "INSERT INTO articles (id, title, content, summary, cover_image, images, source, source_insight_id, source_search_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)",
        )
        .bind(id)
        .bind(&article.title)
        .bind(&article.content)
        .bind(&article.summary)
        .bind(&article.cover_image)
        .bind(images)
        .bind(&article.source)
        .bind(article.source_insight_id.as_deref())
        .bind(article.source_search_id.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to insert article")?;

        Ok(id.to_string())
    }
}
