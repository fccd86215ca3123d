use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    config::AiSettings,
    llm::{ChatMessage, ChatModel, ModelCallError, parse_model_json},
    models::{ArticleSummary, TopicInsight},
};

/// Minimum number of insights requested from the model.
pub const MIN_INSIGHTS: usize = 5;

const RELATED_ARTICLES_IN_FALLBACK: usize = 5;

const INSIGHT_SYSTEM_PROMPT: &str = "你是一名资深的内容策略顾问，擅长从大量文章中发现选题机会和内容趋势。请只输出 JSON 数组，不要输出任何额外说明。";

/// Reduces a full summary set to a ranked list of topic insights in one call.
pub struct InsightSynthesizer<'a> {
    model: &'a dyn ChatModel,
    settings: &'a AiSettings,
}

impl<'a> InsightSynthesizer<'a> {
    pub fn new(model: &'a dyn ChatModel, settings: &'a AiSettings) -> Self {
        Self { model, settings }
    }

    /// Unparseable or empty model output yields [`fallback_insights`]; a
    /// failed call is returned to the caller unchanged.
    pub async fn synthesize(
        &self,
        keyword: &str,
        summaries: &[ArticleSummary],
    ) -> Result<Vec<TopicInsight>, ModelCallError> {
        let messages = [
            ChatMessage::system(INSIGHT_SYSTEM_PROMPT),
            ChatMessage::user(build_insight_prompt(keyword, summaries)),
        ];

        let raw = self.model.complete(self.settings, &messages).await?;
        let timestamp = Utc::now().timestamp_millis();

        let insights = match parse_model_json::<InsightReply>(&raw) {
            Ok(reply) => assign_ids(reply.into_items(), timestamp),
            Err(err) => {
                warn!(?err, keyword, "insight output is not valid JSON, using fallback");
                Vec::new()
            }
        };

        if insights.is_empty() {
            return Ok(fallback_insights(keyword, summaries, timestamp));
        }

        info!(keyword, count = insights.len(), "topic insights generated");
        Ok(insights)
    }

    /// Like [`Self::synthesize`], but a failed call also yields the fallback
    /// insight so callers always get a non-empty list.
    pub async fn synthesize_or_fallback(
        &self,
        keyword: &str,
        summaries: &[ArticleSummary],
    ) -> Vec<TopicInsight> {
        match self.synthesize(keyword, summaries).await {
            Ok(insights) => insights,
            Err(err) => {
                warn!(?err, keyword, "insight call failed, using fallback");
                fallback_insights(keyword, summaries, Utc::now().timestamp_millis())
            }
        }
    }
}

/// Single deterministic insight shown when the model gives nothing usable.
pub fn fallback_insights(
    keyword: &str,
    summaries: &[ArticleSummary],
    timestamp: i64,
) -> Vec<TopicInsight> {
    vec![TopicInsight {
        id: insight_id(timestamp, 0),
        title: format!("「{keyword}」相关内容综合分析"),
        description: format!(
            "基于 {} 篇文章的分析，「{keyword}」话题持续受到关注，建议围绕读者最关心的问题展开创作。",
            summaries.len()
        ),
        evidence: "AI 洞察结果解析失败，以上为默认分析建议。".to_string(),
        suggested_topics: vec![
            format!("{keyword}入门指南"),
            format!("{keyword}最新趋势解读"),
            format!("{keyword}实战案例拆解"),
        ],
        related_articles: summaries
            .iter()
            .take(RELATED_ARTICLES_IN_FALLBACK)
            .map(|s| s.title.clone())
            .collect(),
    }]
}

pub fn insight_id(timestamp: i64, index: usize) -> String {
    format!("insight-{timestamp}-{index}")
}

fn assign_ids(items: Vec<InsightPayload>, timestamp: i64) -> Vec<TopicInsight> {
    items
        .into_iter()
        .filter(|item| !item.title.trim().is_empty())
        .enumerate()
        .map(|(index, item)| TopicInsight {
            id: insight_id(timestamp, index),
            title: item.title,
            description: item.description,
            evidence: item.evidence,
            suggested_topics: item.suggested_topics,
            related_articles: item.related_articles,
        })
        .collect()
}

fn build_insight_prompt(keyword: &str, summaries: &[ArticleSummary]) -> String {
    let digest = summaries
        .iter()
        .enumerate()
        .map(|(idx, s)| {
            format!(
                "【文章 {n}】{title}\n摘要：{summary}\n关键词：{keywords}\n亮点：{highlights}\n类型：{content_type}",
                n = idx + 1,
                title = s.title,
                summary = s.summary,
                keywords = s.keywords.join("、"),
                highlights = s.highlights.join("；"),
                content_type = s.content_type,
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"以下是围绕关键词「{keyword}」搜索到的 {count} 篇文章的摘要：

{digest}

请综合分析这些文章，提炼至少 {min} 条有价值的选题洞察，按价值从高到低排序，并严格按以下 JSON 数组格式返回：
[
  {{
    "title": "洞察标题",
    "description": "洞察的详细说明",
    "evidence": "支撑该洞察的依据（引用文章中的现象或数据）",
    "suggestedTopics": ["建议选题1", "建议选题2", "建议选题3"],
    "relatedArticles": ["相关文章标题1", "相关文章标题2"]
  }}
]"#,
        count = summaries.len(),
        min = MIN_INSIGHTS,
    )
}

/// Models sometimes wrap the array in an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InsightReply {
    List(Vec<InsightPayload>),
    Wrapped { insights: Vec<InsightPayload> },
}

impl InsightReply {
    fn into_items(self) -> Vec<InsightPayload> {
        match self {
            InsightReply::List(items) | InsightReply::Wrapped { insights: items } => items,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InsightPayload {
    title: String,
    description: String,
    evidence: String,
    suggested_topics: Vec<String>,
    related_articles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct CannedModel {
        reply: Result<String, u16>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedModel {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for CannedModel {
        async fn complete(
            &self,
            _settings: &AiSettings,
            messages: &[ChatMessage],
        ) -> Result<String, ModelCallError> {
            self.prompts
                .lock()
                .expect("lock")
                .push(messages[1].text.clone());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(status) => Err(ModelCallError::Status {
                    status: *status,
                    body: "error".to_string(),
                }),
            }
        }
    }

    fn settings() -> AiSettings {
        AiSettings {
            api_endpoint: "https://llm.example.com/v1".to_string(),
            api_key: "sk-test".to_string(),
            model: "gpt-test".to_string(),
        }
    }

    fn summaries() -> Vec<ArticleSummary> {
        vec![
            ArticleSummary {
                article_id: "a1".to_string(),
                title: "私域运营指南".to_string(),
                summary: "讲私域".to_string(),
                key_points: vec![],
                keywords: vec!["私域".to_string(), "社群".to_string()],
                highlights: vec!["案例详实".to_string()],
                content_type: "干货教程".to_string(),
            },
            ArticleSummary {
                article_id: "a2".to_string(),
                title: "社群裂变复盘".to_string(),
                summary: "讲裂变".to_string(),
                key_points: vec![],
                keywords: vec!["裂变".to_string()],
                highlights: vec![],
                content_type: "案例分析".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn parses_insights_and_synthesizes_ids() {
        let model = CannedModel::ok(
            r#"```json
[{"title":"私域精细化","description":"d","evidence":"e","suggestedTopics":["t1"],"relatedArticles":["私域运营指南"]},
 {"title":"裂变降温","description":"d2"}]
```"#,
        );
        let settings = settings();
        let insights = InsightSynthesizer::new(&model, &settings)
            .synthesize("私域", &summaries())
            .await
            .expect("insights");

        assert_eq!(insights.len(), 2);
        assert!(insights[0].id.starts_with("insight-"));
        assert!(insights[0].id.ends_with("-0"));
        assert!(insights[1].id.ends_with("-1"));
        assert_eq!(insights[0].suggested_topics, vec!["t1".to_string()]);
        assert!(insights[1].related_articles.is_empty());
    }

    #[tokio::test]
    async fn prompt_embeds_every_summary() {
        let model = CannedModel::ok("[]");
        let settings = settings();
        InsightSynthesizer::new(&model, &settings)
            .synthesize("私域", &summaries())
            .await
            .expect("insights");

        let prompts = model.prompts.lock().expect("lock");
        let prompt = &prompts[0];
        assert!(prompt.contains("私域运营指南"));
        assert!(prompt.contains("社群裂变复盘"));
        assert!(prompt.contains("私域、社群"));
        assert!(prompt.contains("案例分析"));
        assert!(prompt.contains("至少 5 条"));
    }

    #[tokio::test]
    async fn unparseable_output_yields_single_fallback() {
        let model = CannedModel::ok("今天的分析暂时无法完成");
        let settings = settings();
        let insights = InsightSynthesizer::new(&model, &settings)
            .synthesize("私域", &summaries())
            .await
            .expect("insights");

        assert_eq!(insights.len(), 1);
        assert!(insights[0].title.contains("私域"));
        assert_eq!(
            insights[0].related_articles,
            vec!["私域运营指南".to_string(), "社群裂变复盘".to_string()]
        );
    }

    #[tokio::test]
    async fn accepts_wrapped_insight_object() {
        let model = CannedModel::ok(r#"{"insights":[{"title":"短视频带货"}]}"#);
        let settings = settings();
        let insights = InsightSynthesizer::new(&model, &settings)
            .synthesize("私域", &summaries())
            .await
            .expect("insights");
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].title, "短视频带货");
    }

    #[tokio::test]
    async fn empty_array_yields_fallback() {
        let model = CannedModel::ok("[]");
        let settings = settings();
        let insights = InsightSynthesizer::new(&model, &settings)
            .synthesize("私域", &summaries())
            .await
            .expect("insights");
        assert_eq!(insights.len(), 1);
    }

    #[tokio::test]
    async fn call_failure_propagates() {
        let model = CannedModel {
            reply: Err(503),
            prompts: Mutex::new(Vec::new()),
        };
        let settings = settings();
        let err = InsightSynthesizer::new(&model, &settings)
            .synthesize("私域", &summaries())
            .await
            .expect_err("call failure");
        assert!(matches!(err, ModelCallError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn failed_call_still_yields_single_fallback_insight() {
        let model = CannedModel {
            reply: Err(502),
            prompts: Mutex::new(Vec::new()),
        };
        let settings = settings();
        let insights = InsightSynthesizer::new(&model, &settings)
            .synthesize_or_fallback("私域", &summaries())
            .await;

        assert_eq!(insights.len(), 1);
        assert!(insights[0].id.starts_with("insight-"));
        assert_eq!(insights[0].related_articles.len(), 2);
    }

    #[test]
    fn fallback_is_deterministic() {
        let first = fallback_insights("AI", &summaries(), 42);
        let second = fallback_insights("AI", &summaries(), 42);
        assert_eq!(first, second);
        assert_eq!(first[0].id, "insight-42-0");
    }
}
