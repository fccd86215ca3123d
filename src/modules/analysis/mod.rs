use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

mod insights;
mod summarize;

pub use insights::InsightSynthesizer;
pub use summarize::BatchSummarizer;

use crate::{
    config::{
        AiSettings, DEFAULT_SUMMARY_CONCURRENCY, KEY_SUMMARY_CONCURRENCY, MAX_SUMMARY_CONCURRENCY,
        bounded_setting,
    },
    error::PipelineError,
    models::{ArticleSummary, SourceArticle, TopicInsight},
    web::{ApiMessage, AppState, json_error},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/analysis/summaries", post(summarize_articles))
        .route("/api/analysis/insights", post(analyze_insights))
}

#[derive(Debug, Deserialize)]
struct SummariesRequest {
    articles: Vec<SourceArticle>,
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct InsightsRequest {
    #[serde(default)]
    keyword: String,
    articles: Vec<SourceArticle>,
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Debug, Serialize)]
struct InsightsResponse {
    summaries: Vec<ArticleSummary>,
    insights: Vec<TopicInsight>,
}

async fn summarize_articles(
    State(state): State<AppState>,
    Json(request): Json<SummariesRequest>,
) -> Result<Json<Vec<ArticleSummary>>, (StatusCode, Json<ApiMessage>)> {
    ensure_articles(&request.articles)?;
    let settings = AiSettings::resolve(state.config()).await.map_err(pipeline_error)?;
    let concurrency = resolve_concurrency(&state, request.concurrency).await;

    let summaries = summarize_with_logging(&state, &settings, &request.articles, concurrency).await;
    Ok(Json(summaries))
}

async fn analyze_insights(
    State(state): State<AppState>,
    Json(request): Json<InsightsRequest>,
) -> Result<Json<InsightsResponse>, (StatusCode, Json<ApiMessage>)> {
    let keyword = request.keyword.trim();
    if keyword.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "请提供分析关键词。"));
    }
    ensure_articles(&request.articles)?;

    let settings = AiSettings::resolve(state.config()).await.map_err(pipeline_error)?;
    let concurrency = resolve_concurrency(&state, request.concurrency).await;

    let summaries = summarize_with_logging(&state, &settings, &request.articles, concurrency).await;
    let insights = InsightSynthesizer::new(state.chat_model(), &settings)
        .synthesize_or_fallback(keyword, &summaries)
        .await;

    Ok(Json(InsightsResponse {
        summaries,
        insights,
    }))
}

async fn summarize_with_logging(
    state: &AppState,
    settings: &AiSettings,
    articles: &[SourceArticle],
    concurrency: usize,
) -> Vec<ArticleSummary> {
    info!(total = articles.len(), concurrency, "starting batch summarization");
    BatchSummarizer::new(state.chat_model(), settings)
        .summarize(articles, concurrency, |done, total| {
            info!(done, total, "summarization progress");
        })
        .await
}

async fn resolve_concurrency(state: &AppState, requested: Option<usize>) -> usize {
    match requested {
        Some(value) => value.clamp(1, MAX_SUMMARY_CONCURRENCY),
        None => {
            bounded_setting(
                state.config(),
                KEY_SUMMARY_CONCURRENCY,
                DEFAULT_SUMMARY_CONCURRENCY,
                MAX_SUMMARY_CONCURRENCY,
            )
            .await
        }
    }
}

fn ensure_articles(articles: &[SourceArticle]) -> Result<(), (StatusCode, Json<ApiMessage>)> {
    if articles.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "请至少提供一篇文章。"));
    }
    Ok(())
}

fn pipeline_error(err: PipelineError) -> (StatusCode, Json<ApiMessage>) {
    let status = match &err {
        PipelineError::Config(_) | PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::ModelCall(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Settings(_) | PipelineError::Persistence(_) => {
            error!(?err, "internal error in analysis module");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "服务器内部错误。");
        }
    };
    json_error(status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelCallError;

    #[test]
    fn config_errors_are_client_errors() {
        let (status, Json(body)) = pipeline_error(PipelineError::Config("缺少 ai_api_key".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.message, "缺少 ai_api_key");
    }

    #[test]
    fn model_failures_map_to_bad_gateway() {
        let (status, Json(body)) = pipeline_error(PipelineError::ModelCall(
            ModelCallError::MalformedResponse("empty".into()),
        ));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.message.contains("empty"));
    }

    #[test]
    fn settings_failures_hide_details() {
        let (status, Json(body)) =
            pipeline_error(PipelineError::Settings(anyhow::anyhow!("pool timed out")));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.message.contains("pool"));
    }

    #[test]
    fn empty_article_list_is_rejected() {
        let (status, _) = ensure_articles(&[]).expect_err("empty");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
