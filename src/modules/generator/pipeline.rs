use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{
    images::{ImageModel, ImageSynthesizer},
    planner::ImagePlanner,
    progress::{ProgressChannel, ProgressStep},
    splice::{count_paragraphs, insert_images},
};
use crate::{
    config::{
        AiSettings, ConfigProvider, DEFAULT_ARTICLE_IMAGE_COUNT, ImageSettings,
        KEY_ARTICLE_IMAGE_COUNT, MAX_ARTICLE_IMAGE_COUNT, bounded_setting,
    },
    error::PipelineError,
    llm::{ChatMessage, ChatModel, parse_model_json},
    models::{DraftArticle, GeneratedArticle, GeneratedImage, NewArticle, TopicInsight},
    store::ContentStore,
    web::escape_html,
};

/// Summary stored when the draft could not be parsed.
pub const DRAFT_FALLBACK_SUMMARY: &str = "【解析失败】AI 返回内容无法解析为结构化文章，请人工检查后编辑。";

const DRAFT_SYSTEM_PROMPT: &str = "你是一名资深的新媒体内容创作者，擅长把选题洞察写成结构清晰、可读性强的公众号文章。请只输出 JSON，不要输出任何额外说明。";

static LEGACY_IMAGE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[INSERT_IMAGE:[^\]]*\]").expect("marker pattern is valid")
});

static MARKER_PARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<p>\s*\[INSERT_IMAGE:[^\]]*\]\s*</p>").expect("marker paragraph pattern is valid")
});

/// Body of `POST /api/articles/generate`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub insight: Option<TopicInsight>,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub search_id: Option<String>,
    #[serde(default)]
    pub generate_images: bool,
    #[serde(default)]
    pub image_count: Option<usize>,
}

/// Turns one insight into a saved, optionally illustrated article.
#[derive(Clone)]
pub struct GenerationPipeline {
    config: Arc<dyn ConfigProvider>,
    chat: Arc<dyn ChatModel>,
    images: Arc<dyn ImageModel>,
    store: Arc<dyn ContentStore>,
}

impl GenerationPipeline {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        chat: Arc<dyn ChatModel>,
        images: Arc<dyn ImageModel>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            config,
            chat,
            images,
            store,
        }
    }

    /// Drive one run to its terminal event.
    ///
    /// If the consumer of `progress` disconnects, the run is dropped at its
    /// next suspension point and nothing further is persisted.
    pub async fn run(&self, request: GenerateRequest, progress: &mut ProgressChannel) {
        let watcher = progress.watcher();

        let outcome = tokio::select! {
            biased;
            _ = watcher.closed() => None,
            outcome = self.execute(&request, progress) => Some(outcome),
        };

        match outcome {
            Some(Ok(article)) => match serde_json::to_value(&article) {
                Ok(data) => {
                    info!(article_id = %article.id, images = article.images.len(), "article generation completed");
                    progress.complete("文章生成完成", data).await;
                }
                Err(err) => {
                    error!(?err, "failed to encode generated article");
                    progress.fail("文章结果编码失败").await;
                }
            },
            Some(Err(err)) => {
                warn!(error = %err, "article generation failed");
                progress.fail(err.to_string()).await;
            }
            None => info!("progress consumer disconnected, generation cancelled"),
        }
    }

    async fn execute(
        &self,
        request: &GenerateRequest,
        progress: &mut ProgressChannel,
    ) -> Result<GeneratedArticle, PipelineError> {
        progress
            .emit(ProgressStep::Validating, "正在校验配置和请求参数...", 0)
            .await;
        let ai = AiSettings::resolve(self.config.as_ref()).await?;
        let insight = request
            .insight
            .as_ref()
            .filter(|insight| !insight.title.trim().is_empty())
            .ok_or_else(|| PipelineError::InvalidRequest("insight".to_string()))?;
        let keyword = request
            .keyword
            .as_deref()
            .map(str::trim)
            .filter(|keyword| !keyword.is_empty())
            .ok_or_else(|| PipelineError::InvalidRequest("keyword".to_string()))?;
        progress
            .emit(ProgressStep::Validating, "参数校验通过", 10)
            .await;

        info!(insight = %insight.title, keyword, "generating article draft");
        progress
            .emit(ProgressStep::Generating, "正在撰写文章内容...", 15)
            .await;
        let draft = self.write_draft(&ai, insight, keyword).await?;
        debug!(
            title = %draft.title,
            paragraphs = count_paragraphs(&draft.content),
            image_keywords = ?draft.image_keywords,
            "draft ready"
        );
        progress
            .emit(ProgressStep::Generating, "文章内容生成完成", 50)
            .await;

        let (content, generated) = if request.generate_images {
            self.illustrate(&ai, &draft, request.image_count, progress)
                .await?
        } else {
            (draft.content.clone(), Vec::new())
        };

        progress
            .emit(ProgressStep::Saving, "正在保存文章...", 85)
            .await;
        let article = self
            .save(request, insight, keyword, draft, content, generated)
            .await?;
        progress
            .emit(ProgressStep::Saving, "文章已保存", 90)
            .await;

        Ok(article)
    }

    async fn write_draft(
        &self,
        ai: &AiSettings,
        insight: &TopicInsight,
        keyword: &str,
    ) -> Result<DraftArticle, PipelineError> {
        let messages = [
            ChatMessage::system(DRAFT_SYSTEM_PROMPT),
            ChatMessage::user(build_draft_prompt(insight, keyword)),
        ];
        let raw = self.chat.complete(ai, &messages).await?;

        let mut draft = match parse_model_json::<DraftArticle>(&raw) {
            Ok(draft) if !draft.content.trim().is_empty() => draft,
            Ok(_) => {
                warn!("draft JSON has no content, using raw model text");
                fallback_draft(insight, &raw)
            }
            Err(err) => {
                warn!(?err, "draft is not valid JSON, using raw model text");
                fallback_draft(insight, &raw)
            }
        };

        if draft.title.trim().is_empty() {
            draft.title = insight.title.clone();
        }
        draft.content = strip_legacy_markers(&draft.content);
        Ok(draft)
    }

    async fn illustrate(
        &self,
        ai: &AiSettings,
        draft: &DraftArticle,
        requested_count: Option<usize>,
        progress: &mut ProgressChannel,
    ) -> Result<(String, Vec<Option<GeneratedImage>>), PipelineError> {
        let Some(image_settings) = ImageSettings::resolve(self.config.as_ref()).await? else {
            info!("image generation credentials not configured, skipping imagery");
            return Ok((draft.content.clone(), Vec::new()));
        };

        let count = match requested_count {
            Some(0) => {
                info!("caller requested zero images, skipping imagery");
                return Ok((draft.content.clone(), Vec::new()));
            }
            Some(count) => count.min(MAX_ARTICLE_IMAGE_COUNT),
            None => {
                bounded_setting(
                    self.config.as_ref(),
                    KEY_ARTICLE_IMAGE_COUNT,
                    DEFAULT_ARTICLE_IMAGE_COUNT,
                    MAX_ARTICLE_IMAGE_COUNT,
                )
                .await
            }
        };

        progress
            .emit(ProgressStep::GeneratingPrompts, "正在规划配图位置...", 55)
            .await;
        let placements = ImagePlanner::new(self.chat.as_ref(), ai)
            .plan(&draft.title, &draft.content, count)
            .await?;
        progress
            .emit(
                ProgressStep::GeneratingPrompts,
                format!("已规划 {} 张配图", placements.len()),
                70,
            )
            .await;

        let synthesizer = ImageSynthesizer::new(self.images.as_ref(), &image_settings);
        let total = placements.len();
        let mut generated = Vec::with_capacity(total);
        for (idx, placement) in placements.iter().enumerate() {
            progress
                .emit(
                    ProgressStep::GeneratingImages,
                    format!("正在生成第 {}/{} 张配图...", idx + 1, total),
                    image_progress(idx, total),
                )
                .await;
            match synthesizer.synthesize(&placement.prompt).await {
                Ok(image) => generated.push(Some(image)),
                Err(err) => {
                    warn!(?err, slot = idx + 1, total, "image generation failed, leaving slot empty");
                    generated.push(None);
                }
            }
        }

        let succeeded = generated.iter().flatten().count();
        progress
            .emit(
                ProgressStep::GeneratingImages,
                format!("配图生成完成，成功 {succeeded}/{total} 张"),
                85,
            )
            .await;

        let content = insert_images(&draft.content, &placements, &generated);
        Ok((content, generated))
    }

    async fn save(
        &self,
        request: &GenerateRequest,
        insight: &TopicInsight,
        keyword: &str,
        draft: DraftArticle,
        content: String,
        generated: Vec<Option<GeneratedImage>>,
    ) -> Result<GeneratedArticle, PipelineError> {
        let source_keyword = match request.search_id.as_deref() {
            Some(search_id) => match self.store.search_by_id(search_id).await {
                Ok(Some(search)) => {
                    debug!(search_id = %search.id, keyword = %search.keyword, "resolved source search");
                    search.keyword
                }
                Ok(None) => keyword.to_string(),
                Err(err) => {
                    warn!(?err, search_id, "failed to load search record, using request keyword");
                    keyword.to_string()
                }
            },
            None => keyword.to_string(),
        };

        let images: Vec<String> = generated.into_iter().flatten().map(|image| image.url).collect();
        let cover_image = images.first().cloned().unwrap_or_default();

        let id = self
            .store
            .create_article(NewArticle {
                title: draft.title.clone(),
                content: content.clone(),
                summary: draft.summary.clone(),
                cover_image: cover_image.clone(),
                images: images.clone(),
                source: format!("{source_keyword} · {}", insight.title),
                source_insight_id: Some(insight.id.clone()).filter(|id| !id.is_empty()),
                source_search_id: request.search_id.clone(),
            })
            .await
            .map_err(|err| {
                error!(?err, "failed to persist generated article");
                PipelineError::Persistence(err)
            })?;

        Ok(GeneratedArticle {
            id,
            title: draft.title,
            content,
            summary: draft.summary,
            images,
            cover_image,
        })
    }
}

/// Spread image slots across the 70..85 band.
fn image_progress(idx: usize, total: usize) -> u8 {
    let span = 15 * idx / total.max(1);
    70 + span.min(15) as u8
}

fn fallback_draft(insight: &TopicInsight, raw: &str) -> DraftArticle {
    DraftArticle {
        title: insight.title.clone(),
        content: format!("<p>{}</p>", escape_html(raw.trim())),
        summary: DRAFT_FALLBACK_SUMMARY.to_string(),
        image_keywords: Vec::new(),
    }
}

fn strip_legacy_markers(content: &str) -> String {
    let stripped = MARKER_PARAGRAPH_RE.replace_all(content, "");
    LEGACY_IMAGE_MARKER_RE.replace_all(&stripped, "").into_owned()
}

fn build_draft_prompt(insight: &TopicInsight, keyword: &str) -> String {
    let suggested = if insight.suggested_topics.is_empty() {
        "（无）".to_string()
    } else {
        insight.suggested_topics.join("、")
    };

    format!(
        r#"请围绕关键词「{keyword}」，基于以下选题洞察创作一篇原创公众号文章。

洞察标题：{title}
洞察说明：{description}
依据：{evidence}
建议选题：{suggested}

写作要求：
1. 标题有吸引力，不超过 30 个字；
2. 正文 1500-2500 字，使用 HTML 排版，只使用 <h2>、<h3>、<p>、<ul>、<li>、<strong>、<blockquote> 标签；
3. 每个段落使用独立的 <p> 标签，段落之间逻辑清晰；
4. 不要在正文中插入任何图片或图片占位符；
5. summary 为 100 字以内的文章摘要；
6. imageKeywords 给出 3-5 个适合配图的英文关键词。

请严格按以下 JSON 格式返回：
{{
  "title": "文章标题",
  "content": "<h2>...</h2><p>...</p>",
  "summary": "文章摘要",
  "imageKeywords": ["keyword1", "keyword2"]
}}"#,
        title = insight.title,
        description = insight.description,
        evidence = insight.evidence,
    )
}
