//! Server-Sent Events variant of the stream, for callers that prefer it
//! over the WebSocket channel.

use super::types::{AppError, ChunksQuery};
use super::ws::event_to_wire;
use super::AppState;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::DateTime;
use futures::stream::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// `GET /api/conversations/:id/stream` — an init event carrying the
/// conversation and its chunk log (honoring `since`), then the live feed
/// filtered to this conversation.
pub async fn stream_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ChunksQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let conversation = state.db.get_conversation(&id)?;
    let since = query.since.and_then(DateTime::from_timestamp_millis);
    let chunks = state.db.list_chunks(&id, since)?;

    // Subscribe before building the init payload so nothing published after
    // the chunk read can be missed.
    let rx = state.bus.subscribe();

    let init = json!({
        "type": "init",
        "conversation": conversation,
        "isStreaming": state.scheduler.is_active(&id),
        "chunks": chunks,
    });
    let init_stream =
        futures::stream::once(async move { Ok(Event::default().event("init").data(init.to_string())) });

    let conv_id = id.clone();
    let live = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event) => {
            let relevant = event.is_broadcast()
                || event.conversation_id() == Some(conv_id.as_str());
            if relevant {
                let wire = event_to_wire(&event);
                let name = wire
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("event")
                    .to_string();
                Some(Ok(Event::default().event(name).data(wire.to_string())))
            } else {
                None
            }
        }
        Err(_) => None, // lagged messages are recoverable via /chunks
    });

    Ok(Sse::new(init_stream.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
