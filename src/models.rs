use serde::{Deserialize, Serialize};

/// Default `contentType` when the model gives no usable classification.
pub const UNCLASSIFIED_CONTENT_TYPE: &str = "未分类";

/// Source article handed in by the caller for analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceArticle {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
}

/// Structured summary of one source article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSummary {
    pub article_id: String,
    pub title: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub keywords: Vec<String>,
    pub highlights: Vec<String>,
    pub content_type: String,
}

impl ArticleSummary {
    /// Neutral summary used when the model output cannot be used.
    pub fn empty_for(article: &SourceArticle) -> Self {
        Self {
            article_id: article.id.clone(),
            title: article.title.clone(),
            summary: String::new(),
            key_points: Vec::new(),
            keywords: Vec::new(),
            highlights: Vec::new(),
            content_type: UNCLASSIFIED_CONTENT_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInsight {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub suggested_topics: Vec<String>,
    #[serde(default)]
    pub related_articles: Vec<String>,
}

/// Planned position and prompt for one generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePlacement {
    pub prompt: String,
    /// 1-based paragraph index the image follows.
    pub insert_after_paragraph: usize,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    pub prompt: String,
}

/// Draft produced by the generation step before any imagery is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftArticle {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub image_keywords: Vec<String>,
}

/// Fields handed to the store when an article is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    pub title: String,
    pub content: String,
    pub summary: String,
    pub cover_image: String,
    pub images: Vec<String>,
    pub source: String,
    pub source_insight_id: Option<String>,
    pub source_search_id: Option<String>,
}

/// Payload of the final `completed` progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedArticle {
    pub id: String,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub images: Vec<String>,
    pub cover_image: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_uses_camel_case_wire_names() {
        let summary = ArticleSummary::empty_for(&SourceArticle {
            id: "a1".to_string(),
            title: "标题".to_string(),
            content: String::new(),
        });
        let value = serde_json::to_value(&summary).expect("serialize");
        assert_eq!(value["articleId"], "a1");
        assert_eq!(value["contentType"], UNCLASSIFIED_CONTENT_TYPE);
        assert!(value["keyPoints"].as_array().expect("array").is_empty());
    }

    #[test]
    fn insight_accepts_partial_payload() {
        let insight: TopicInsight =
            serde_json::from_str(r#"{"id":"insight-1-0","title":"AI 写作"}"#).expect("parse");
        assert_eq!(insight.title, "AI 写作");
        assert!(insight.suggested_topics.is_empty());
    }
}
