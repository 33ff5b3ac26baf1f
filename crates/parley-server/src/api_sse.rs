//! SSE stream of pipeline observer events.

use crate::AppState;
use axum::{
    extract::Extension,
    response::{sse::Event, Sse},
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// What the pipeline reported while a turn was being spoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Sentences that just completed.
    Sentences { sentences: Vec<String> },
    /// The whole text of a finished turn.
    FullText { text: String },
}

impl TurnEvent {
    fn name(&self) -> &'static str {
        match self {
            TurnEvent::Sentences { .. } => "sentences",
            TurnEvent::FullText { .. } => "full_text",
        }
    }
}

/// Handler for `GET /events/turn`.
///
/// The stream ends when the server begins shutting down.
pub async fn get_turn_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events_tx.subscribe();
    let stream = BroadcastStream::new(rx);

    let mapped_stream = stream.filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default().event(event.name()).data(data))),
            Err(e) => {
                tracing::error!("failed to serialize turn event: {}", e);
                None
            }
        },
        Err(broadcast_error) => {
            tracing::warn!(
                error = %broadcast_error,
                "turn SSE stream lagged; events were dropped for this subscriber"
            );
            None
        }
    });

    let mut closing = state.closing.subscribe();
    let closed = async move {
        let _ = closing.wait_for(|closed| *closed).await;
    };

    Sse::new(futures_util::StreamExt::take_until(mapped_stream, closed))
        .keep_alive(axum::response::sse::KeepAlive::default())
}
