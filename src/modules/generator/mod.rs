use std::{convert::Infallible, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt as _, wrappers::ReceiverStream};
use tracing::info;

mod images;
mod pipeline;
mod planner;
mod progress;
mod splice;

pub use images::{ImageClient, ImageModel};
pub use pipeline::{GenerateRequest, GenerationPipeline};
pub use progress::{GenerationProgress, ProgressChannel};

use crate::web::AppState;

const PROGRESS_BUFFER: usize = 32;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub fn router() -> Router<AppState> {
    Router::new().route("/api/articles/generate", post(generate_article))
}

async fn generate_article(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<GenerationProgress>(PROGRESS_BUFFER);
    let pipeline = state.generation_pipeline();

    info!(
        generate_images = request.generate_images,
        search_id = request.search_id.as_deref().unwrap_or(""),
        "article generation requested"
    );

    tokio::spawn(async move {
        let mut progress = ProgressChannel::new(tx);
        pipeline.run(request, &mut progress).await;
    });

    let stream =
        ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(progress::sse_frame(&event)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
