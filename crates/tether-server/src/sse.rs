//! Runner-backed SSE streams.
//!
//! A stream replays from the requested index, then follows the runner live
//! until `done`. The subscription guard lives inside the stream, so a client
//! disconnect (axum dropping the body) detaches the listener while the
//! operation keeps running.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::Stream;

use tether_engine::EventRunner;

use crate::wire::StreamFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// The response to a start request: ends after `done`.
    Initial,
    /// Flags eviction with `buffer_gap` and ends finished operations with
    /// `reconnect_complete`.
    Reconnect,
}

pub fn runner_stream(
    runner: Arc<EventRunner>,
    from: u64,
    capacity: usize,
    mode: StreamMode,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (replay, mut live, subscription) = runner.subscribe(from, capacity);

    async_stream::stream! {
        let _subscription = subscription;
        let reconnect = mode == StreamMode::Reconnect;

        if reconnect && replay.gap {
            let first = replay
                .events
                .first()
                .map(|e| e.index)
                .unwrap_or_else(|| runner.event_count());
            tracing::info!(
                operation_id = %runner.operation_id(),
                requested = from,
                first_available = first,
                "replay gap"
            );
            yield Ok(StreamFrame::buffer_gap(from, first).to_sse());
        }

        let mut finished = replay.finished;
        for event in &replay.events {
            yield Ok(StreamFrame::from(event).to_sse());
        }

        if !finished {
            while let Some(event) = live.recv().await {
                yield Ok(StreamFrame::from(&event).to_sse());
                if event.payload.is_done() {
                    finished = true;
                    break;
                }
            }
        }

        if finished && reconnect {
            yield Ok(StreamFrame::reconnect_complete(&runner).to_sse());
        }
    }
}

pub fn keep_alive(interval: Duration) -> KeepAlive {
    KeepAlive::new()
        .interval(interval)
        .event(StreamFrame::keepalive().to_sse())
}

pub fn into_sse<S>(stream: S, interval: Duration) -> impl IntoResponse
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(keep_alive(interval))
}
