use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderName;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use futures::StreamExt;
use futures::stream;
use relay_core::SessionManager;
use relay_core::client_common::EventStream;
use tokio_util::sync::CancellationToken;

/// Response header carrying the cancellation handle; written before any
/// body bytes so the client can stop the stream it is still reading.
pub const STREAM_ID_HEADER: &str = "x-stream-id";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Ties the stream's lifetime to the response body: dropping the body —
/// client disconnect or normal end — cancels the stream and retires its id.
/// Cancellation is idempotent, so the normal-completion drop is harmless.
struct StreamGuard {
    manager: Arc<SessionManager>,
    stream_id: String,
    cancel: CancellationToken,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.manager.close_stream(&self.stream_id);
    }
}

/// Build the SSE response: one canonical event per `data:` frame in the
/// provider-shaped envelope, then the literal `[DONE]` sentinel.
pub fn sse_response(
    manager: Arc<SessionManager>,
    stream_id: String,
    cancel: CancellationToken,
    events: EventStream,
) -> Response {
    let guard = StreamGuard {
        manager,
        stream_id: stream_id.clone(),
        cancel,
    };

    let frames = events
        .map(move |event| {
            // Owned by the closure so the guard lives exactly as long as
            // the response body.
            let _ = &guard;
            Ok::<Event, Infallible>(Event::default().data(event.to_wire_envelope().to_string()))
        })
        .chain(stream::once(async {
            Ok::<Event, Infallible>(Event::default().data("[DONE]"))
        }));

    let sse = Sse::new(frames).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL));

    (
        [(HeaderName::from_static(STREAM_ID_HEADER), stream_id)],
        sse,
    )
        .into_response()
}
