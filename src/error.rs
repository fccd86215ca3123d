use thiserror::Error;

use crate::llm::ModelCallError;

/// Failures that end a generation run with a terminal `error` event.
///
/// The `Display` text is what the client sees as the event message.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Config(String),
    #[error("请求参数缺失: {0}")]
    InvalidRequest(String),
    #[error("读取配置失败: {0:#}")]
    Settings(anyhow::Error),
    #[error(transparent)]
    ModelCall(#[from] ModelCallError),
    #[error("保存文章失败: {0:#}")]
    Persistence(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_call_message_is_transparent() {
        let err = PipelineError::from(ModelCallError::Status {
            status: 500,
            body: "upstream down".to_string(),
        });
        assert_eq!(err.to_string(), "AI 接口返回错误 (HTTP 500): upstream down");
    }

    #[test]
    fn persistence_message_includes_cause_chain() {
        let cause = anyhow::anyhow!("connection reset").context("insert article");
        let err = PipelineError::Persistence(cause);
        assert_eq!(err.to_string(), "保存文章失败: insert article: connection reset");
    }
}
