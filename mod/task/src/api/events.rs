use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::engine::TaskEngine;

/// Subscription scope: events are delivered per owner and project.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStreamQuery {
    pub owner_id: String,
    pub project_id: String,
}

// ---------------------------------------------------------------------------
// GET /events — SSE lifecycle stream
// ---------------------------------------------------------------------------

/// Stream lifecycle/progress events for one owner/project scope.
///
/// Each event is self-describing, so a consumer that reconnects can
/// resynchronize from the next event alone; lagging subscribers simply skip
/// ahead (the bus never blocks publishers on slow readers).
pub async fn stream(
    State(engine): State<Arc<TaskEngine>>,
    Query(q): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = engine.events().subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        // A lagged receiver drops the missed events and keeps going.
        let ev = item.ok()?;
        if ev.owner_id != q.owner_id || ev.project_id != q.project_id {
            return None;
        }
        Event::default()
            .event(ev.event_type.wire_name())
            .json_data(&ev)
            .ok()
            .map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
