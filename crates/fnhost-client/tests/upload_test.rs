// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upload client against a stand-in router.

use std::io::{Cursor, Read};
use std::net::SocketAddr;

use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::put;
use fnhost_client::{ClientError, UploadClient};
use tempfile::TempDir;

async fn recompile(
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if name == "broken" {
        return (StatusCode::BAD_REQUEST, "compile error: expected `;`").into_response();
    }
    assert_eq!(headers["content-type"], "application/zip");

    let mut archive = zip::ZipArchive::new(Cursor::new(body.to_vec())).unwrap();
    let mut main = String::new();
    archive
        .by_name("src/main.rs")
        .unwrap()
        .read_to_string(&mut main)
        .unwrap();
    assert_eq!(main, "fn main() {}");

    axum::Json(serde_json::json!({ "status": "ok", "funcName": name })).into_response()
}

async fn start_router() -> SocketAddr {
    let app = Router::new().route("/_admin/{name}/recompile", put(recompile));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn source_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
    dir
}

#[tokio::test]
async fn test_upload_success() {
    let addr = start_router().await;
    let dir = source_dir();

    let client = UploadClient::new(format!("http://{addr}")).unwrap();
    let response = client.upload("hello", dir.path()).await.unwrap();

    assert_eq!(response.status, "ok");
    assert_eq!(response.func_name, "hello");
}

#[tokio::test]
async fn test_upload_rejected() {
    let addr = start_router().await;
    let dir = source_dir();

    let client = UploadClient::new(format!("http://{addr}")).unwrap();
    let err = client.upload("broken", dir.path()).await.unwrap_err();

    match err {
        ClientError::Rejected { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("compile error"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_upload_connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let dir = source_dir();

    let client = UploadClient::new(format!("http://{addr}")).unwrap();
    let err = client.upload("hello", dir.path()).await.unwrap_err();
    assert!(matches!(err, ClientError::Http(_)));
}
