//! Integration tests for the HTTP document-service backend against a mock
//! server.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use study_sync::HttpBackend;
use study_sync_core::{
    BatchWrite, Completion, DocumentBackend, EventBus, Identity, MemoryCache,
    RemoteError, RemoteStore, SyncEngine,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer) -> HttpBackend {
    HttpBackend::new(server.uri(), Duration::from_secs(5)).expect("backend")
}

fn user() -> Identity {
    Identity::new("u1").with_token("tok")
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_list_sends_bearer_and_parses_documents() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/u1/progress"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "documents": [
                { "id": "1_1", "data": { "createdAt": 10 } },
                { "id": "1_2", "data": { "createdAt": 11 } }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let docs = backend(&server)
        .list(&user(), "progress")
        .await
        .expect("list");
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].id, "1_1");
    assert_eq!(docs[1].data, json!({ "createdAt": 11 }));
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_missing_collection_lists_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/u1/flags"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let docs = backend(&server).list(&user(), "flags").await.expect("list");
    assert!(docs.is_empty());
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_set_puts_document_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/users/u1/flags/2_4_q1"))
        .and(body_json(json!({ "createdAt": 5, "caseId": "2_4", "questionNumber": 1 })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server)
        .set(
            &user(),
            "flags",
            "2_4_q1",
            json!({ "createdAt": 5, "caseId": "2_4", "questionNumber": 1 }),
        )
        .await
        .expect("set");
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_delete_of_missing_document_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/users/u1/progress/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server)
        .delete(&user(), "progress", "gone")
        .await
        .expect("delete");
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_commit_posts_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users/u1/caseFlags/batch"))
        .and(body_json(json!({
            "writes": [
                { "op": "set", "id": "a", "data": { "createdAt": 1 } },
                { "op": "delete", "id": "b" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server)
        .commit(
            &user(),
            "caseFlags",
            vec![
                BatchWrite::Set {
                    id: "a".into(),
                    data: json!({ "createdAt": 1 }),
                },
                BatchWrite::Delete { id: "b".into() },
            ],
        )
        .await
        .expect("commit");
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_status_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/users/u1/progress/denied"))
        .respond_with(ResponseTemplate::new(403).set_body_string("token expired"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/users/u1/progress/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend = backend(&server);
    let err = backend
        .set(&user(), "progress", "denied", json!({}))
        .await
        .unwrap_err();
    match err {
        RemoteError::Unauthenticated(message) => assert_eq!(message, "token expired"),
        other => panic!("expected Unauthenticated, got {other:?}"),
    }

    let err = backend
        .set(&user(), "progress", "broken", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Rejected { status: 500, .. }));
    assert!(!err.is_unavailable());
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_malformed_listing_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/u1/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = backend(&server)
        .list(&user(), "progress")
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Decode(_)));
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_unreachable_server_is_unavailable() {
    // Bind then release a port so nothing is listening on it.
    let uri = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        format!("http://{}", listener.local_addr().expect("addr"))
    };

    let backend = HttpBackend::new(uri, Duration::from_secs(2)).expect("backend");
    let err = backend.list(&user(), "progress").await.unwrap_err();
    assert!(err.is_unavailable(), "unexpected error: {err:?}");
}

#[tokio::test]
#[cfg_attr(
    target_os = "macos",
    ignore = "wiremock/reqwest system-configuration issue on macOS"
)]
async fn test_engine_reconciles_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/u1/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "documents": [{ "id": "remote", "data": { "createdAt": 3 } }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/users/u1/progress/batch"))
        .and(body_json(json!({
            "writes": [{ "op": "set", "id": "local", "data": { "createdAt": 7 } }]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    study_sync_core::LocalCache::set(
        cache.as_ref(),
        "completed_cases",
        r#"{"local": {"createdAt": 7}}"#,
    )
    .expect("seed");

    let bus = EventBus::new();
    let remote = Arc::new(RemoteStore::with_backend(
        bus.clone(),
        Arc::new(backend(&server)),
    ));
    let engine: SyncEngine<Completion> = SyncEngine::start(cache, remote.clone(), bus);

    remote.set_identity(Some(user()));
    engine.flush().await;

    assert!(engine.has("remote"));
    assert!(engine.has("local"));
}
