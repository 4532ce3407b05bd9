//! HTTP behavior tests for the SCIM client against a mock server

use adbridge_scim::ScimClient;
use serde_json::json;
use wiremock::matchers::{basic_auth, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_create_user_posts_to_users_with_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .and(basic_auth("api-key", ""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "Q1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ScimClient::new(server.uri(), "api-key");
    let response = client.create_user(&json!({"userName": "alice@x"}), None).await;

    assert!(response.is(201));
    assert_eq!(response.cloud_id().unwrap(), "Q1");
}

#[tokio::test]
async fn test_conflict_response_carries_existing_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"id": "Q-dup"})))
        .mount(&server)
        .await;

    let client = ScimClient::new(server.uri(), "api-key");
    let response = client.create_user(&json!({}), None).await;

    assert!(response.is(409));
    assert_eq!(response.cloud_id().unwrap(), "Q-dup");
}

#[tokio::test]
async fn test_get_and_put_hit_resource_paths() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scimv2/Users/Q1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "Q1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/scimv2/Users/Q1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "Q1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ScimClient::new(server.uri(), "api-key");
    assert!(client.get_user("Q1").await.is(200));
    assert!(client.update_user("Q1", &json!({}), None).await.is(200));
}

#[tokio::test]
async fn test_delete_group_path() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/scimv2/Groups/QG1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = ScimClient::new(server.uri(), "api-key");
    assert!(client.delete_group("QG1").await.is(200));
}

#[tokio::test]
async fn test_unreachable_server_is_a_network_error() {
    // Nothing listens on this port
    let client = ScimClient::new("http://127.0.0.1:1", "api-key");
    let response = client.get_user("Q1").await;
    assert!(response.is_network_error());
    assert!(response.status.is_none());
}

#[tokio::test]
async fn test_avatar_upload_uses_multipart() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "Q1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ScimClient::new(server.uri(), "api-key");
    let response = client
        .create_user(&json!({"userName": "alice@x"}), Some(b"jpeg-bytes".to_vec()))
        .await;
    assert!(response.is(201));

    let requests = server.received_requests().await.unwrap();
    let content_type = requests[0]
        .headers
        .get("content-type")
        .map(|v| v.to_str().unwrap_or_default().to_string())
        .unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data"));
}
