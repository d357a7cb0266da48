//! MJPEG preview server.
//!
//! `GET /preview/{stream_name}` answers with a never-ending
//! `multipart/x-mixed-replace` body. Each connection gets its own task that
//! fetches the latest cached image, encodes it and hands the part to the
//! response body. The task ends when the client goes away (the body is
//! dropped), when encoding fails, or on shutdown.

pub mod mjpeg;

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::preview::PreviewCache;

struct ServerState {
    cache: Arc<PreviewCache>,
    quality: u8,
    viewers: AtomicUsize,
    shutdown: CancellationToken,
}

/// HTTP front end over a preview cache
#[derive(Clone)]
pub struct PreviewServer {
    state: Arc<ServerState>,
}

impl PreviewServer {
    pub fn new(cache: Arc<PreviewCache>, quality: u8, shutdown: CancellationToken) -> Self {
        Self {
            state: Arc::new(ServerState {
                cache,
                quality,
                viewers: AtomicUsize::new(0),
                shutdown,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/preview/{stream_name}", get(preview_stream))
            .with_state(Arc::clone(&self.state))
    }

    /// Open preview connections
    pub fn viewers(&self) -> usize {
        self.state.viewers.load(Ordering::Relaxed)
    }

    /// Stream names with a cached preview
    pub fn streams(&self) -> Vec<String> {
        self.state.cache.names()
    }

    /// Serve until the shutdown token fires
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Preview server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.state.shutdown.clone().cancelled_owned())
            .await
    }
}

async fn preview_stream(
    Path(stream_name): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    // One part in flight: a slow client slows its own loop, nothing queues up
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(stream_previews(state, stream_name, tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, mjpeg::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        body,
    )
        .into_response()
}

/// Decrements the viewer count when a connection loop exits
struct ViewerGuard(Arc<ServerState>);

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.0.viewers.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("mjpeg_viewers").decrement(1.0);
    }
}

async fn stream_previews(state: Arc<ServerState>, stream_name: String, tx: mpsc::Sender<Bytes>) {
    state.viewers.fetch_add(1, Ordering::Relaxed);
    metrics::gauge!("mjpeg_viewers").increment(1.0);
    let guard = ViewerGuard(Arc::clone(&state));
    debug!(stream = %stream_name, "Preview connection opened");

    let mut parts = 0u64;
    loop {
        let image = state.cache.get(&stream_name).into_image();
        let quality = state.quality;
        let started = Instant::now();

        let encode = tokio::task::spawn_blocking(move || mjpeg::encode_jpeg(&image, quality));
        let jpeg = match encode.await {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                warn!(stream = %stream_name, error = %e, "JPEG encode failed");
                break;
            }
            Err(e) => {
                warn!(stream = %stream_name, error = %e, "Encode task failed");
                break;
            }
        };
        metrics::histogram!("mjpeg_encode_time_us")
            .record(started.elapsed().as_micros() as f64);

        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            sent = tx.send(mjpeg::part(&jpeg)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        parts += 1;
    }

    drop(guard);
    debug!(stream = %stream_name, parts, "Preview connection closed");
}
