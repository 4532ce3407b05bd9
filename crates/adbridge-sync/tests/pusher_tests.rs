//! Push pipeline scenarios against a mock cloud and a real in-memory store

use std::sync::{Arc, Mutex};

use adbridge_core::domain::entity::{AdGroup, AdUser};
use adbridge_core::domain::overlay::{AdStatus, DbGroup, DbUser};
use adbridge_core::domain::status::SyncStatusSnapshot;
use adbridge_core::ports::IStore;
use adbridge_scim::ScimClient;
use adbridge_store::{DatabasePool, SqliteStore};
use adbridge_sync::{AdToWebPusher, MonitorFlags, PushOutcome};
use adbridge_audit::EventLogger;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn store() -> Arc<dyn IStore> {
    let pool = DatabasePool::in_memory().await.unwrap();
    Arc::new(SqliteStore::new(pool.pool().clone()))
}

fn pusher_for(server_uri: &str, store: Arc<dyn IStore>) -> AdToWebPusher {
    let scim = ScimClient::new(server_uri, "api-key");
    let events = EventLogger::new(store.clone());
    AdToWebPusher::new(
        store,
        scim,
        events,
        Arc::new(MonitorFlags::new()),
        Arc::new(Mutex::new(SyncStatusSnapshot::default())),
        true,
        false,
    )
}

fn unsent_user(guid: &str, upn: &str) -> DbUser {
    let mut ad = AdUser::default();
    ad.entity.object_guid = guid.to_string();
    ad.entity.distinguished_name = format!("CN={guid},CN=Users,DC=x");
    ad.user_principal_name = upn.to_string();
    ad.given_name = "Test".to_string();
    ad.sn = "User".to_string();
    let mut db = DbUser::from_ad(ad, "F1");
    db.push.status = AdStatus::Present;
    db
}

fn unsent_group(guid: &str, cn: &str) -> DbGroup {
    let mut ad = AdGroup::default();
    ad.entity.object_guid = guid.to_string();
    ad.entity.cn = format!("CN={cn},DC=x");
    ad.entity.distinguished_name = format!("CN={cn},DC=x");
    let mut db = DbGroup::from_ad(ad, "F1");
    db.push.status = AdStatus::Present;
    db
}

#[tokio::test]
async fn test_bootstrap_push_creates_groups_before_users() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Groups"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "QG"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "QU"})))
        .mount(&server)
        .await;

    let store = store().await;
    store.insert_group(&unsent_group("G1", "Nurses")).await.unwrap();
    store.insert_group(&unsent_group("G2", "Doctors")).await.unwrap();
    store.insert_user(&unsent_user("U1", "alice@x")).await.unwrap();
    store.insert_user(&unsent_user("U2", "bob@x")).await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    // All rows carry a cloud id and are marked sent
    for guid in ["G1", "G2"] {
        let group = store.group_by_guid(guid).await.unwrap().unwrap();
        assert!(group.push.is_sent_to_webserver);
        assert_eq!(group.push.qliq_id, "QG");
    }
    for guid in ["U1", "U2"] {
        let user = store.user_by_guid(guid).await.unwrap().unwrap();
        assert!(user.push.is_sent_to_webserver);
        assert_eq!(user.push.qliq_id, "QU");
    }

    // Group requests strictly precede user requests
    let requests = server.received_requests().await.unwrap();
    let paths: Vec<String> = requests.iter().map(|r| r.url.path().to_string()).collect();
    let last_group = paths.iter().rposition(|p| p.contains("Groups")).unwrap();
    let first_user = paths.iter().position(|p| p.contains("Users")).unwrap();
    assert!(last_group < first_user, "group pushes must come first: {paths:?}");
}

#[tokio::test]
async fn test_conflict_resolved_via_get_then_put() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"id": "Q1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/scimv2/Users/Q1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "Q1",
            "meta": {"created": "2026-01-01"},
            "userName": "stale@x",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/scimv2/Users/Q1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "Q1"})))
        .expect(1)
        .mount(&server)
        .await;

    let store = store().await;
    store.insert_user(&unsent_user("U1", "alice@x")).await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    let user = store.user_by_guid("U1").await.unwrap().unwrap();
    assert!(user.push.is_sent_to_webserver);
    assert_eq!(user.push.qliq_id, "Q1");

    // The PUT body is the merged payload: server fields kept, ours layered
    let requests = server.received_requests().await.unwrap();
    let put = requests
        .iter()
        .find(|r| r.method.as_str() == "PUT")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&put.body).unwrap();
    assert_eq!(body["meta"]["created"], "2026-01-01");
    assert_eq!(body["userName"], "alice@x");
}

#[tokio::test]
async fn test_put_404_quarantines_row_as_cloud_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/scimv2/Users/Q2"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"id": "Q2"})))
        .expect(1)
        .mount(&server)
        .await;

    let store = store().await;
    let mut user = unsent_user("U1", "alice@x");
    user.push.qliq_id = "Q2".to_string();
    store.insert_user(&user).await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    let user = store.user_by_guid("U1").await.unwrap().unwrap();
    assert!(user.user.entity.is_deleted);
    assert!(user.push.qliq_id.is_empty());
    assert_eq!(user.push.webserver_error, 404);
    assert!(user.push.is_sent_to_webserver);

    // A second round must not touch the quarantined row
    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_permanent_error_rows_are_skipped_not_resent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "QU"})))
        .expect(1)
        .mount(&server)
        .await;

    let store = store().await;
    let mut quarantined = unsent_user("U1", "alice@x");
    quarantined.push.webserver_error = 422;
    store.insert_user(&quarantined).await.unwrap();
    store.insert_user(&unsent_user("U2", "bob@x")).await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    // Only the clean row went over the wire; the 422 row kept its error
    let quarantined = store.user_by_guid("U1").await.unwrap().unwrap();
    assert_eq!(quarantined.push.webserver_error, 422);
    assert!(!quarantined.push.is_sent_to_webserver);
    let pushed = store.user_by_guid("U2").await.unwrap().unwrap();
    assert!(pushed.push.is_sent_to_webserver);
}

#[tokio::test]
async fn test_transient_errors_cleared_at_start_of_push() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "QU"})))
        .expect(1)
        .mount(&server)
        .await;

    let store = store().await;
    let mut transient = unsent_user("U1", "alice@x");
    transient.push.webserver_error = 503;
    store.insert_user(&transient).await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    let user = store.user_by_guid("U1").await.unwrap().unwrap();
    assert!(user.push.is_sent_to_webserver);
    assert_eq!(user.push.webserver_error, 0);
}

#[tokio::test]
async fn test_deleted_row_without_cloud_id_is_marked_sent_silently() {
    let server = MockServer::start().await;
    let store = store().await;
    let mut user = unsent_user("U1", "alice@x");
    user.user.entity.is_deleted = true;
    store.insert_user(&user).await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    let user = store.user_by_guid("U1").await.unwrap().unwrap();
    assert!(user.push.is_sent_to_webserver);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_group_deletion_cleans_up_memberships_at_end() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/scimv2/Groups/QG1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store().await;
    let mut group = unsent_group("G1", "Nurses");
    group.group.entity.is_deleted = true;
    group.push.qliq_id = "QG1".to_string();
    store.insert_group(&group).await.unwrap();

    let mut member = unsent_user("U1", "alice@x");
    member.push.is_sent_to_webserver = true;
    store.insert_user(&member).await.unwrap();
    store.add_user_to_group("U1", "G1").await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    assert!(store.group_by_guid("G1").await.unwrap().is_none());
    assert!(store.group_ids_of_user("U1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_network_failure_pauses_the_push() {
    let store = store().await;
    store.insert_user(&unsent_user("U1", "alice@x")).await.unwrap();

    // Nothing listens here
    let outcome = pusher_for("http://127.0.0.1:1", store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::NetworkPaused);

    // The row is untouched and will be retried on the next tick
    let user = store.user_by_guid("U1").await.unwrap().unwrap();
    assert!(!user.push.is_sent_to_webserver);
    assert!(user.push.qliq_id.is_empty());
}

#[tokio::test]
async fn test_bad_request_marks_row_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scimv2/Users"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let store = store().await;
    store.insert_user(&unsent_user("U1", "alice@x")).await.unwrap();

    let outcome = pusher_for(&server.uri(), store.clone()).run().await.unwrap();
    assert_eq!(outcome, PushOutcome::Drained);

    let user = store.user_by_guid("U1").await.unwrap().unwrap();
    assert_eq!(user.push.webserver_error, 422);
    assert_eq!(
        user.user.entity.valid_state,
        adbridge_core::domain::entity::ValidState::Rejected(422)
    );
}
