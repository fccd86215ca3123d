use axum::response::sse::Event;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pipeline stage reported in each progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Validating,
    Generating,
    GeneratingPrompts,
    GeneratingImages,
    Saving,
    Completed,
    Error,
}

impl ProgressStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStep::Completed | ProgressStep::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationProgress {
    pub step: ProgressStep,
    pub message: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Producer half of the progress stream.
///
/// Progress never goes backwards and nothing is sent after the first
/// `completed` or `error` event.
pub struct ProgressChannel {
    tx: mpsc::Sender<GenerationProgress>,
    last_progress: u8,
    finished: bool,
}

impl ProgressChannel {
    pub fn new(tx: mpsc::Sender<GenerationProgress>) -> Self {
        Self {
            tx,
            last_progress: 0,
            finished: false,
        }
    }

    pub async fn emit(&mut self, step: ProgressStep, message: impl Into<String>, progress: u8) {
        self.send(step, message.into(), progress, None).await;
    }

    pub async fn complete(&mut self, message: impl Into<String>, data: Value) {
        self.send(ProgressStep::Completed, message.into(), 100, Some(data))
            .await;
    }

    pub async fn fail(&mut self, message: impl Into<String>) {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "文章生成失败".to_string();
        }
        let progress = self.last_progress;
        self.send(ProgressStep::Error, message, progress, None).await;
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sender clone whose `closed()` resolves once the consumer goes away.
    pub fn watcher(&self) -> mpsc::Sender<GenerationProgress> {
        self.tx.clone()
    }

    async fn send(&mut self, step: ProgressStep, message: String, progress: u8, data: Option<Value>) {
        if self.finished {
            debug!(?step, "progress event after terminal event ignored");
            return;
        }

        let progress = progress.min(100).max(self.last_progress);
        self.last_progress = progress;
        self.finished = step.is_terminal();

        let event = GenerationProgress {
            step,
            message,
            progress,
            data,
        };
        if self.tx.send(event).await.is_err() {
            debug!(?step, "progress consumer is gone");
        }
    }
}

fn frame_json(event: &GenerationProgress) -> String {
    serde_json::to_string(event).unwrap_or_else(|err| {
        warn!(?err, "failed to encode progress event");
        format!(
            r#"{{"step":"error","message":"进度事件编码失败","progress":{}}}"#,
            event.progress
        )
    })
}

/// Wraps one event as an SSE `data:` frame.
pub fn sse_frame(event: &GenerationProgress) -> Event {
    Event::default().data(frame_json(event))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn drain(rx: &mut mpsc::Receiver<GenerationProgress>) -> Vec<GenerationProgress> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn progress_never_decreases_and_is_capped() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut channel = ProgressChannel::new(tx);

        channel.emit(ProgressStep::Generating, "a", 40).await;
        channel.emit(ProgressStep::GeneratingPrompts, "b", 20).await;
        channel.emit(ProgressStep::Saving, "c", 250).await;

        let values: Vec<_> = drain(&mut rx).iter().map(|e| e.progress).collect();
        assert_eq!(values, vec![40, 40, 100]);
    }

    #[tokio::test]
    async fn only_first_terminal_event_is_sent() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut channel = ProgressChannel::new(tx);

        channel.emit(ProgressStep::Validating, "start", 5).await;
        channel.fail("").await;
        channel.complete("done", json!({})).await;
        channel.emit(ProgressStep::Saving, "late", 90).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].step, ProgressStep::Error);
        assert_eq!(events[1].progress, 5);
        assert_eq!(events[1].message, "文章生成失败");
        assert!(channel.is_finished());
    }

    #[tokio::test]
    async fn emitting_without_consumer_does_not_fail() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut channel = ProgressChannel::new(tx);
        channel.emit(ProgressStep::Generating, "x", 10).await;
        assert!(channel.watcher().is_closed());
    }

    #[test]
    fn frame_uses_snake_case_steps_and_omits_missing_data() {
        let event = GenerationProgress {
            step: ProgressStep::GeneratingImages,
            message: "正在生成第 1/3 张配图...".to_string(),
            progress: 70,
            data: None,
        };
        let value: Value = serde_json::from_str(&frame_json(&event)).expect("json");
        assert_eq!(value["step"], "generating_images");
        assert_eq!(value["progress"], 70);
        assert!(value.get("data").is_none());
    }

    #[test]
    fn completed_frame_carries_data() {
        let event = GenerationProgress {
            step: ProgressStep::Completed,
            message: "完成".to_string(),
            progress: 100,
            data: Some(json!({"id": "a1", "coverImage": ""})),
        };
        let value: Value = serde_json::from_str(&frame_json(&event)).expect("json");
        assert_eq!(value["step"], "completed");
        assert_eq!(value["data"]["id"], "a1");
    }
}
