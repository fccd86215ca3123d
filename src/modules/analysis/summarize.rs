use futures::future::join_all;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    config::AiSettings,
    llm::{ChatMessage, ChatModel, parse_model_json_or},
    models::{ArticleSummary, SourceArticle, UNCLASSIFIED_CONTENT_TYPE},
};

/// Article bodies longer than this are cut before being sent to the model.
pub const MAX_CONTENT_CHARS: usize = 4000;

const SUMMARY_SYSTEM_PROMPT: &str = "你是一名资深的内容运营分析师，擅长快速提炼文章的核心信息。请只输出 JSON，不要输出任何额外说明。";

/// Summarises articles with at most `concurrency` model calls in flight.
pub struct BatchSummarizer<'a> {
    model: &'a dyn ChatModel,
    settings: &'a AiSettings,
}

impl<'a> BatchSummarizer<'a> {
    pub fn new(model: &'a dyn ChatModel, settings: &'a AiSettings) -> Self {
        Self { model, settings }
    }

    /// Returns exactly one summary per input article, in input order.
    ///
    /// Articles are processed in consecutive chunks of `concurrency`; every
    /// article of a chunk runs concurrently and `on_progress(done, total)` fires
    /// once after each chunk.
    pub async fn summarize<F>(
        &self,
        articles: &[SourceArticle],
        concurrency: usize,
        mut on_progress: F,
    ) -> Vec<ArticleSummary>
    where
        F: FnMut(usize, usize),
    {
        let total = articles.len();
        let chunk_size = concurrency.max(1);
        let mut summaries = Vec::with_capacity(total);

        for (chunk_idx, chunk) in articles.chunks(chunk_size).enumerate() {
            let results = join_all(chunk.iter().map(|article| self.summarize_one(article))).await;
            summaries.extend(results);

            info!(
                chunk = chunk_idx + 1,
                completed = summaries.len(),
                total,
                "summary chunk finished"
            );
            on_progress(summaries.len(), total);
        }

        summaries
    }

    async fn summarize_one(&self, article: &SourceArticle) -> ArticleSummary {
        let messages = [
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(build_summary_prompt(article)),
        ];

        let raw = match self.model.complete(self.settings, &messages).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(?err, article_id = %article.id, "summarization call failed, using empty summary");
                return ArticleSummary::empty_for(article);
            }
        };

        let payload: SummaryPayload =
            parse_model_json_or(&raw, "article summary", SummaryPayload::default);
        payload.into_summary(article)
    }
}

fn build_summary_prompt(article: &SourceArticle) -> String {
    format!(
        r#"请分析下面这篇文章，并按以下 JSON 格式返回：
{{
  "summary": "100-200 字的文章摘要",
  "keyPoints": ["核心观点1", "核心观点2", "核心观点3"],
  "keywords": ["关键词1", "关键词2", "关键词3"],
  "highlights": ["值得借鉴的亮点1", "亮点2"],
  "contentType": "内容类型，例如：干货教程、行业观察、案例分析、观点评论、新闻资讯"
}}

文章标题：{title}

文章内容：
{content}"#,
        title = article.title,
        content = truncate_chars(&article.content, MAX_CONTENT_CHARS),
    )
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SummaryPayload {
    summary: String,
    key_points: Vec<String>,
    keywords: Vec<String>,
    highlights: Vec<String>,
    content_type: Option<String>,
}

impl SummaryPayload {
    fn into_summary(self, article: &SourceArticle) -> ArticleSummary {
        let content_type = self
            .content_type
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| UNCLASSIFIED_CONTENT_TYPE.to_string());

        ArticleSummary {
            article_id: article.id.clone(),
            title: article.title.clone(),
            summary: self.summary,
            key_points: self.key_points,
            keywords: self.keywords,
            highlights: self.highlights,
            content_type,
        }
    }
}
