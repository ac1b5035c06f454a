//! HTTP token and lookup providers against a mock API server

use callbridge_client_core::{
    CallMode, ClientError, HttpLookupProvider, HttpTokenProvider, LookupProvider, TokenProvider,
};
use serde_json::json;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_url(server: &MockServer) -> Url {
    Url::parse(&format!("{}/v1", server.uri())).unwrap()
}

#[tokio::test]
async fn test_token_fetch_parses_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/token"))
        .and(header("authorization", "Bearer session-credential"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "mode": "dual",
            "peerReady": true,
            "carrierToken": "carrier-jwt",
            "identity": "alice",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = HttpTokenProvider::new(base_url(&server));
    let token = provider.fetch_token("session-credential").await.unwrap();
    assert_eq!(token.identity, "alice");
    assert_eq!(token.mode, Some(CallMode::Dual));
    assert_eq!(token.carrier_token.as_deref(), Some("carrier-jwt"));
    assert!(token.carrier_enabled());
    assert!(token.expires_at.is_none());
}

#[tokio::test]
async fn test_token_fetch_maps_http_status() {
    let cases = [
        (401, "Unauthorized"),
        (403, "Forbidden"),
        (503, "ServerError"),
    ];
    for (status, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/token"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let provider = HttpTokenProvider::new(base_url(&server));
        let err = provider.fetch_token("session-credential").await.unwrap_err();
        let matched = match (&err, expected) {
            (ClientError::Unauthorized { .. }, "Unauthorized") => true,
            (ClientError::Forbidden { .. }, "Forbidden") => true,
            (ClientError::ServerError { status: 503 }, "ServerError") => true,
            _ => false,
        };
        assert!(matched, "HTTP {status} mapped to {err:?}");
    }
}

#[tokio::test]
async fn test_lookup_returns_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/users/lookup/phone"))
        .and(query_param("phoneNumber", "+15551234567"))
        .and(header("authorization", "Bearer session-credential"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "exists": true,
            "identity": "bob",
            "displayName": "Bob",
        })))
        .mount(&server)
        .await;

    let provider = HttpLookupProvider::new(base_url(&server));
    let result = provider
        .lookup_phone("+15551234567", Some("session-credential"))
        .await
        .unwrap();
    assert!(result.exists);
    assert_eq!(result.identity.as_deref(), Some("bob"));
    assert_eq!(result.display_name.as_deref(), Some("Bob"));
}

#[tokio::test]
async fn test_lookup_not_found_is_a_miss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/users/lookup/phone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = HttpLookupProvider::new(base_url(&server));
    let result = provider.lookup_phone("+15550000000", None).await.unwrap();
    assert!(!result.exists);
    assert!(result.identity.is_none());
}

#[tokio::test]
async fn test_lookup_server_error_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/users/lookup/phone"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let provider = HttpLookupProvider::new(base_url(&server));
    let err = provider.lookup_phone("+15550000000", None).await.unwrap_err();
    assert!(matches!(err, ClientError::ServerError { status: 500 }));
}
