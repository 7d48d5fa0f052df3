//! Tests for the WebSocket status stream, served over a real listener.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use futures::StreamExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use common::{post, submit, TestApp};

/// Serve `app` on an ephemeral port and return its address.
async fn serve(app: &TestApp) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Read text frames as JSON until the server closes the connection.
async fn collect_frames(
    stream: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("status stream stalled");
        match next {
            Some(Ok(Message::Text(text))) => frames.push(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return frames,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn stream_follows_a_job_to_completion() {
    let app = common::build_test_app_with_workers();
    let addr = serve(&app).await;
    let job = submit(&app, "sleep", json!({"duration": 3})).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/jobs/{}/ws", job.id))
        .await
        .unwrap();
    let frames = collect_frames(&mut socket).await;

    let (last, snapshots) = frames.split_last().unwrap();
    assert_eq!(last["type"], "stream_end");
    assert!(snapshots.iter().all(|f| f["type"] == "job_status"));
    assert_eq!(snapshots.last().unwrap()["data"]["state"], "SUCCESS");

    // Distinct consecutive snapshots only.
    for pair in snapshots.windows(2) {
        assert_ne!(pair[0]["data"], pair[1]["data"]);
    }
}

#[tokio::test]
async fn stream_of_a_finished_job_sends_one_snapshot() {
    let app = common::build_test_app();
    let addr = serve(&app).await;
    let job = submit(&app, "sleep", json!({"duration": 3})).await;
    let response = post(app.router.clone(), &format!("/api/v1/jobs/{}/cancel", job.id)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/jobs/{}/ws", job.id))
        .await
        .unwrap();
    let frames = collect_frames(&mut socket).await;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["data"]["state"], "REVOKED");
    assert_eq!(frames[1]["type"], "stream_end");
}

#[tokio::test]
async fn stream_reports_cancellation_of_a_pending_job() {
    let app = common::build_test_app();
    let addr = serve(&app).await;
    let job = submit(&app, "sleep", json!({"duration": 3})).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/jobs/{}/ws", job.id))
        .await
        .unwrap();
    let first = socket.next().await.unwrap().unwrap();
    let first: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(first["data"]["state"], "PENDING");

    post(app.router.clone(), &format!("/api/v1/jobs/{}/cancel", job.id)).await;

    let frames = collect_frames(&mut socket).await;
    assert_eq!(frames[0]["data"]["state"], "REVOKED");
    assert_eq!(frames.last().unwrap()["type"], "stream_end");
}

#[tokio::test]
async fn unknown_job_is_rejected_before_upgrade() {
    let app = common::build_test_app();
    let addr = serve(&app).await;

    let err = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/api/v1/jobs/{}/ws",
        uuid::Uuid::now_v7()
    ))
    .await
    .unwrap_err();

    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 404);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}
