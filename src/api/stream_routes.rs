use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;

use crate::domain::PublishedEvent;

use super::middleware::AuthUser;
use super::AppState;

fn to_sse_event(event: &PublishedEvent) -> Event {
    let mut sse = Event::default()
        .event(event.event_type.as_wire_str())
        .json_data(&event.payload)
        .unwrap_or_else(|_| Event::default().data("{}"));
    if let Some(seq) = event.seq {
        sse = sse.id(seq.to_string());
    }
    sse
}

/// Live per-client event stream. Replays persisted events newer than
/// `Last-Event-ID` before switching to live delivery, subscribing to the
/// bus *before* running the replay query so no event committed in between
/// can fall through the gap — duplicates from the overlap are filtered by
/// `seq`, never re-emitted.
pub async fn stream_events(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_event_id: i64 = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let subscription = state.bus.subscribe(auth.client_id).await;
    let store = state.store.clone();
    let client_id = auth.client_id;

    let stream = async_stream::stream! {
        let mut high_water_mark = last_event_id;

        match store.events_since(client_id, last_event_id).await {
            Ok(replay) => {
                for event in &replay {
                    high_water_mark = event.seq;
                    let published: PublishedEvent = event.into();
                    yield Ok(to_sse_event(&published));
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "replay query failed, continuing with live-only delivery");
            }
        }

        let mut subscription = subscription;
        while let Some(event) = subscription.receiver.recv().await {
            if let Some(seq) = event.seq {
                if seq <= high_water_mark {
                    continue;
                }
                high_water_mark = seq;
            }
            yield Ok(to_sse_event(&event));
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.settings.keepalive_secs))
            .event(Event::default().event("keepalive")),
    )
}
