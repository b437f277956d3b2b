//! Mock upstream helpers shared by the relay tests

use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::{FrameStream, RelayError};

/// Serve `router` on an ephemeral local port; returns its base URL.
pub(crate) async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Base URL of a port nothing listens on.
pub(crate) async fn dead_upstream() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Drain a frame stream, keeping errors in place.
pub(crate) async fn collect(mut frames: FrameStream) -> Vec<Result<Bytes, RelayError>> {
    let mut out = Vec::new();
    while let Some(frame) = frames.next().await {
        out.push(frame);
    }
    out
}
