use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::splice::paragraph_spans;
use crate::{
    config::AiSettings,
    llm::{ChatMessage, ChatModel, ModelCallError, parse_model_json},
    models::ImagePlacement,
};

const PARAGRAPH_PREVIEW_CHARS: usize = 60;

const PLANNER_SYSTEM_PROMPT: &str = "你是一名专业的新媒体排版编辑，负责为文章规划配图位置并撰写英文绘图提示词。请只输出 JSON，不要输出任何额外说明。";

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"));

/// Decides where images go in an article and what each one shows.
pub struct ImagePlanner<'a> {
    model: &'a dyn ChatModel,
    settings: &'a AiSettings,
}

impl<'a> ImagePlanner<'a> {
    pub fn new(model: &'a dyn ChatModel, settings: &'a AiSettings) -> Self {
        Self { model, settings }
    }

    /// At most `count` placements, positions clamped into the article's
    /// paragraph range and sorted ascending. Unusable output plans nothing.
    pub async fn plan(
        &self,
        title: &str,
        html: &str,
        count: usize,
    ) -> Result<Vec<ImagePlacement>, ModelCallError> {
        let paragraphs = paragraph_previews(html);
        let messages = [
            ChatMessage::system(PLANNER_SYSTEM_PROMPT),
            ChatMessage::user(build_planner_prompt(title, &paragraphs, count)),
        ];

        let raw = self.model.complete(self.settings, &messages).await?;
        let payloads = match parse_model_json::<PlanReply>(&raw) {
            Ok(reply) => reply.into_items(),
            Err(err) => {
                warn!(?err, "image plan is not valid JSON, continuing without images");
                return Ok(Vec::new());
            }
        };

        let placements = normalize_placements(payloads, paragraphs.len(), count);
        info!(
            requested = count,
            planned = placements.len(),
            paragraphs = paragraphs.len(),
            "image placements planned"
        );
        Ok(placements)
    }
}

fn normalize_placements(
    payloads: Vec<PlacementPayload>,
    total_paragraphs: usize,
    count: usize,
) -> Vec<ImagePlacement> {
    let upper = total_paragraphs.max(1);
    let mut placements: Vec<ImagePlacement> = payloads
        .into_iter()
        .filter(|payload| !payload.prompt.trim().is_empty())
        .take(count)
        .map(|payload| ImagePlacement {
            insert_after_paragraph: paragraph_index(&payload.insert_after_paragraph)
                .clamp(1, upper),
            prompt: payload.prompt.trim().to_string(),
            description: payload.description.trim().to_string(),
        })
        .collect();
    placements.sort_by_key(|placement| placement.insert_after_paragraph);
    placements
}

/// Accepts numbers and numeric strings; anything else means "first paragraph".
fn paragraph_index(value: &Value) -> usize {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() && n >= 1.0 => n.round() as usize,
        _ => 1,
    }
}

fn paragraph_previews(html: &str) -> Vec<String> {
    paragraph_spans(html)
        .into_iter()
        .map(|span| {
            let text = TAG_RE.replace_all(&html[span], "");
            text.trim().chars().take(PARAGRAPH_PREVIEW_CHARS).collect()
        })
        .collect()
}

fn build_planner_prompt(title: &str, paragraphs: &[String], count: usize) -> String {
    let outline = paragraphs
        .iter()
        .enumerate()
        .map(|(idx, text)| format!("第 {} 段：{}", idx + 1, text))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"文章标题：{title}
文章共 {total} 个段落，各段开头如下：
{outline}

请为这篇文章规划 {count} 张配图，要求：
1. 第一张配图放在文章前三分之一的位置；
2. 不要把配图放在最后一个段落之后；
3. 配图位置尽量分散，不要集中在同一处；
4. prompt 使用英文，描述具体画面、风格和构图，适合直接用于 AI 绘图；
5. description 使用中文，作为图片说明。

请严格按以下 JSON 格式返回：
{{
  "images": [
    {{ "prompt": "English prompt", "insertAfterParagraph": 2, "description": "中文图片说明" }}
  ]
}}"#,
        total = paragraphs.len(),
    )
}

/// Either `{"images": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanReply {
    Wrapped { images: Vec<PlacementPayload> },
    List(Vec<PlacementPayload>),
}

impl PlanReply {
    fn into_items(self) -> Vec<PlacementPayload> {
        match self {
            PlanReply::Wrapped { images } | PlanReply::List(images) => images,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PlacementPayload {
    prompt: String,
    insert_after_paragraph: Value,
    description: String,
}
