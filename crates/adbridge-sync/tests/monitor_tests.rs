//! End-to-end monitor scenarios against a scripted directory and a real
//! in-memory store

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adbridge_core::config::AdConfig;
use adbridge_core::domain::entity::{AdGroup, AdUser};
use adbridge_core::domain::forest::{Credentials, DomainController, Forest};
use adbridge_core::domain::newtypes::ObjectGuid;
use adbridge_core::domain::overlay::AdStatus;
use adbridge_core::domain::sync_context::SyncContext;
use adbridge_core::ports::{
    DirectoryError, DirectoryServerInfo, IDirectoryClient, IEntityPages, IStore,
};
use adbridge_store::{DatabasePool, SqliteStore};
use adbridge_sync::{AdMonitor, MonitorHandle};
use async_trait::async_trait;

const MAIN_DN: &str = "CN=qliqConnect,CN=Users,DC=x";
const NURSES_DN: &str = "CN=Nurses,CN=Users,DC=x";

// ============================================================================
// Scripted directory
// ============================================================================

#[derive(Default)]
struct FakeState {
    info: DirectoryServerInfo,
    groups: Vec<AdGroup>,
    users: Vec<AdUser>,
    unreachable_hosts: HashSet<String>,
    user_search_count: usize,
    probe_log: Vec<String>,
}

struct FakeDirectory {
    state: Mutex<FakeState>,
}

impl FakeDirectory {
    fn new() -> Arc<Self> {
        let mut state = FakeState::default();
        state.info = DirectoryServerInfo {
            dns_host_name: "dc1.example.com".to_string(),
            invocation_id: "inv-1".to_string(),
            highest_committed_usn: "1000".to_string(),
            default_naming_context: "DC=x".to_string(),
        };
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn set_groups(&self, groups: Vec<AdGroup>) {
        self.state.lock().unwrap().groups = groups;
    }

    fn set_users(&self, users: Vec<AdUser>) {
        self.state.lock().unwrap().users = users;
    }

    fn set_unreachable(&self, host: &str) {
        self.state
            .lock()
            .unwrap()
            .unreachable_hosts
            .insert(host.to_string());
    }

    fn bump_watermark(&self, usn: &str) {
        self.state.lock().unwrap().info.highest_committed_usn = usn.to_string();
    }

    fn user_search_count(&self) -> usize {
        self.state.lock().unwrap().user_search_count
    }

    fn probe_log(&self) -> Vec<String> {
        self.state.lock().unwrap().probe_log.clone()
    }

    fn apply_context(info: &DirectoryServerInfo, ctx: &mut SyncContext) {
        ctx.invocation_id = info.invocation_id.clone();
        ctx.dc_dns_name = info.dns_host_name.clone();
        ctx.highest_committed_usn = info.highest_committed_usn.clone();
    }
}

/// Serves a pre-computed result set one page at a time
struct VecPages<T> {
    items: Vec<T>,
    page_size: usize,
    offset: usize,
}

#[async_trait]
impl<T: Send + Clone + 'static> IEntityPages<T> for VecPages<T> {
    async fn next_page(&mut self) -> Result<Option<Vec<T>>, DirectoryError> {
        if self.offset >= self.items.len() {
            return Ok(None);
        }
        let end = (self.offset + self.page_size).min(self.items.len());
        let page = self.items[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(page))
    }
}

fn extract_between<'a>(filter: &'a str, prefix: &str) -> Option<&'a str> {
    let start = filter.find(prefix)? + prefix.len();
    let end = filter[start..].find("))")? + start;
    Some(&filter[start..end])
}

#[async_trait]
impl IDirectoryClient for FakeDirectory {
    async fn server_info(
        &self,
        credentials: &Credentials,
    ) -> Result<DirectoryServerInfo, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        state.probe_log.push(credentials.host.clone());
        if state.unreachable_hosts.contains(&credentials.host) {
            return Err(DirectoryError::ServerUnreachable("no route".to_string()));
        }
        Ok(state.info.clone())
    }

    async fn open_group_search(
        &self,
        credentials: &Credentials,
        page_size: u32,
        filter: &str,
        ctx: &mut SyncContext,
    ) -> Result<Box<dyn IEntityPages<AdGroup>>, DirectoryError> {
        let state = self.state.lock().unwrap();
        if state.unreachable_hosts.contains(&credentials.host) {
            return Err(DirectoryError::ServerUnreachable("no route".to_string()));
        }
        FakeDirectory::apply_context(&state.info, ctx);

        let matches: Vec<AdGroup> = if let Some(cn) = extract_between(filter, "(CN=") {
            state
                .groups
                .iter()
                .filter(|g| g.entity.cn == cn)
                .cloned()
                .collect()
        } else if let Some(member_of) = extract_between(filter, "(memberOf=") {
            state
                .groups
                .iter()
                .filter(|g| g.entity.member_of.iter().any(|dn| dn == member_of))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Ok(Box::new(VecPages {
            items: matches,
            page_size: page_size as usize,
            offset: 0,
        }))
    }

    async fn open_user_search(
        &self,
        _credentials: &Credentials,
        page_size: u32,
        filter: &str,
        ctx: &mut SyncContext,
        _include_avatars: bool,
    ) -> Result<Box<dyn IEntityPages<AdUser>>, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        state.user_search_count += 1;
        FakeDirectory::apply_context(&state.info, ctx);

        let matches: Vec<AdUser> = extract_between(filter, "(memberOf=")
            .map(|member_of| {
                state
                    .users
                    .iter()
                    .filter(|u| u.entity.member_of.iter().any(|dn| dn == member_of))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::new(VecPages {
            items: matches,
            page_size: page_size as usize,
            offset: 0,
        }))
    }

    async fn open_deleted_user_search(
        &self,
        _credentials: &Credentials,
        page_size: u32,
        ctx: &mut SyncContext,
    ) -> Result<Box<dyn IEntityPages<String>>, DirectoryError> {
        let state = self.state.lock().unwrap();
        FakeDirectory::apply_context(&state.info, ctx);
        Ok(Box::new(VecPages {
            items: Vec::new(),
            page_size: page_size as usize,
            offset: 0,
        }))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn group(guid: &str, cn: &str, dn: &str, member_of: &[&str], usn: &str) -> AdGroup {
    let mut g = AdGroup::default();
    g.entity.object_guid = guid.to_string();
    g.entity.cn = cn.to_string();
    g.entity.distinguished_name = dn.to_string();
    g.entity.object_classes = vec!["top".to_string(), "group".to_string()];
    g.entity.member_of = member_of.iter().map(|s| s.to_string()).collect();
    g.entity.usn_changed = usn.to_string();
    g
}

fn user(guid: &str, upn: &str, member_of: &[&str], usn: &str) -> AdUser {
    let mut u = AdUser::default();
    u.entity.object_guid = guid.to_string();
    u.entity.cn = upn.to_string();
    u.entity.account_name = upn.split('@').next().unwrap_or(upn).to_string();
    u.entity.distinguished_name = format!("CN={guid},CN=Users,DC=x");
    u.entity.object_classes = vec!["top".to_string(), "person".to_string(), "user".to_string()];
    u.entity.member_of = member_of.iter().map(|s| s.to_string()).collect();
    u.entity.usn_changed = usn.to_string();
    u.user_principal_name = upn.to_string();
    u.given_name = "Given".to_string();
    u.sn = "Sur".to_string();
    u
}

fn healthy_directory() -> Arc<FakeDirectory> {
    let directory = FakeDirectory::new();
    directory.set_groups(vec![
        group("G-main", "qliqConnect", MAIN_DN, &[], "10"),
        group("G-nurses", "Nurses", NURSES_DN, &[MAIN_DN], "20"),
    ]);
    directory.set_users(vec![
        user("U-alice", "alice@x", &[NURSES_DN], "30"),
        user("U-bob", "bob@x", &[NURSES_DN], "31"),
    ]);
    directory
}

fn forest(hosts: &[(&str, bool)]) -> Forest {
    Forest {
        object_guid: ObjectGuid::new("F1").unwrap(),
        user_name: "svc".to_string(),
        password: "pw".to_string(),
        sync_group: "qliqConnect".to_string(),
        domain_controllers: hosts
            .iter()
            .map(|(host, primary)| DomainController::new(*host, *primary))
            .collect(),
    }
}

fn test_config() -> AdConfig {
    let mut config = AdConfig::default();
    config.sync.enabled = true;
    config.sync.interval_mins = 60;
    // A tiny page size so every enumeration crosses page boundaries
    config.sync.page_size = 1;
    // Pushes go nowhere and pause on the network error
    config.web.server_address = "http://127.0.0.1:1".to_string();
    config.web.api_key = "test-key".to_string();
    config
}

async fn in_memory_store() -> Arc<dyn IStore> {
    let pool = DatabasePool::in_memory().await.unwrap();
    Arc::new(SqliteStore::new(pool.pool().clone()))
}

async fn start_monitor(
    store: Arc<dyn IStore>,
    directory: Arc<FakeDirectory>,
    config: AdConfig,
) -> MonitorHandle {
    let (monitor, handle) = AdMonitor::new(store, directory, config);
    tokio::spawn(monitor.run());
    handle
}

/// Polls a condition until it holds or the timeout expires
async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within timeout"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn count_completed_syncs(store: &Arc<dyn IStore>) -> usize {
    store
        .events_page(0, 200)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.message.starts_with("Active Directory sync completed"))
        .count()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_bootstrap_full_sync_populates_store() {
    let store = in_memory_store().await;
    let directory = healthy_directory();
    let handle = start_monitor(store.clone(), directory.clone(), test_config()).await;

    handle.save_forests(vec![forest(&[("dc1", true)])]).await;

    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 1 }
    })
    .await;

    // Both users are Present
    for guid in ["U-alice", "U-bob"] {
        let user = store.user_by_guid(guid).await.unwrap().unwrap();
        assert_eq!(user.push.status, AdStatus::Present, "{guid}");
        assert!(!user.user.entity.is_deleted);
        assert!(!user.push.is_sent_to_webserver);
    }

    // The main group is flagged and never pushed; the subgroup is pending
    let main = store.group_by_guid("G-main").await.unwrap().unwrap();
    assert!(main.is_main_group);
    assert!(main.push.is_sent_to_webserver);
    let nurses = store.group_by_guid("G-nurses").await.unwrap().unwrap();
    assert!(!nurses.is_main_group);
    assert!(!nurses.push.is_sent_to_webserver);

    // Memberships recorded
    let ids = store.group_ids_of_user("U-alice").await.unwrap();
    assert!(ids.contains("G-nurses"));

    // The watermark observed at the main-group query was committed
    let ctx = store.sync_context("F1", "dc1").await.unwrap().unwrap();
    assert_eq!(ctx.highest_committed_usn, "1000");
    assert!(ctx.last_full_sync.is_some());
}

#[tokio::test]
async fn test_delta_with_unchanged_subgroup_skips_member_queries() {
    let store = in_memory_store().await;
    let directory = healthy_directory();
    let handle = start_monitor(store.clone(), directory.clone(), test_config()).await;

    handle.save_forests(vec![forest(&[("dc1", true)])]).await;
    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 1 }
    })
    .await;

    let searches_after_full = directory.user_search_count();

    // No directory changes; the next cycle is a delta
    handle.request_sync(false, false).await;
    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 2 }
    })
    .await;

    // The unchanged subgroup reclassified its members without a query
    assert_eq!(directory.user_search_count(), searches_after_full);
    for guid in ["U-alice", "U-bob"] {
        let user = store.user_by_guid(guid).await.unwrap().unwrap();
        assert_eq!(user.push.status, AdStatus::Present);
    }
}

#[tokio::test]
async fn test_full_sync_detects_removed_user() {
    let store = in_memory_store().await;
    let directory = healthy_directory();
    let handle = start_monitor(store.clone(), directory.clone(), test_config()).await;

    handle.save_forests(vec![forest(&[("dc1", true)])]).await;
    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 1 }
    })
    .await;

    // Bob disappears from the directory
    directory.set_users(vec![user("U-alice", "alice@x", &[NURSES_DN], "30")]);
    directory.set_groups(vec![
        group("G-main", "qliqConnect", MAIN_DN, &[], "10"),
        group("G-nurses", "Nurses", NURSES_DN, &[MAIN_DN], "21"),
    ]);
    directory.bump_watermark("1100");

    handle.request_sync(false, true).await;
    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 2 }
    })
    .await;

    let alice = store.user_by_guid("U-alice").await.unwrap().unwrap();
    assert_eq!(alice.push.status, AdStatus::Present);
    assert!(!alice.user.entity.is_deleted);

    let bob = store.user_by_guid("U-bob").await.unwrap().unwrap();
    assert_eq!(bob.push.status, AdStatus::NotPresent);
    assert!(bob.user.entity.is_deleted);
    assert!(!bob.push.is_sent_to_webserver);

    let ctx = store.sync_context("F1", "dc1").await.unwrap().unwrap();
    assert_eq!(ctx.highest_committed_usn, "1100");
}

#[tokio::test]
async fn test_secondary_controller_used_when_primary_is_down() {
    let store = in_memory_store().await;
    let directory = healthy_directory();
    directory.set_unreachable("dc1");
    let handle = start_monitor(store.clone(), directory.clone(), test_config()).await;

    handle
        .save_forests(vec![forest(&[("dc1", true), ("dc2", false)])])
        .await;
    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 1 }
    })
    .await;

    // The primary was probed first, then the secondary carried the sync
    let probes = directory.probe_log();
    assert_eq!(probes[0], "dc1");
    assert!(probes.contains(&"dc2".to_string()));

    let ctx = store.sync_context("F1", "dc2").await.unwrap().unwrap();
    assert!(ctx.has_synced());
    assert!(store.sync_context("F1", "dc1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_anomaly_latches_and_resume_clears() {
    let store = in_memory_store().await;
    let directory = healthy_directory();
    let mut config = test_config();
    config.anomaly.user_count_threshold = 1;
    config.anomaly.percent_threshold = 50;
    let handle = start_monitor(store.clone(), directory.clone(), config).await;

    handle.save_forests(vec![forest(&[("dc1", true)])]).await;
    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 1 }
    })
    .await;

    // The whole population vanishes
    directory.set_users(vec![]);
    directory.set_groups(vec![
        group("G-main", "qliqConnect", MAIN_DN, &[], "10"),
        group("G-nurses", "Nurses", NURSES_DN, &[MAIN_DN], "22"),
    ]);
    directory.bump_watermark("1200");

    // First cycle: the guard arms, nothing is pushed
    handle.request_sync(false, true).await;
    let check_store = store.clone();
    wait_until(|| {
        let store = check_store.clone();
        async move { count_completed_syncs(&store).await >= 2 }
    })
    .await;
    let check_handle = handle.clone();
    wait_until(|| {
        let handle = check_handle.clone();
        async move { handle.status_snapshot().is_anomaly_detected }
    })
    .await;
    let snapshot = handle.status_snapshot();
    assert!(snapshot.is_anomaly_detected);
    assert!(snapshot.anomaly_message.is_empty(), "not latched yet");

    // Second cycle: still missing, the guard latches with a message
    handle.request_sync(false, true).await;
    let check_handle = handle.clone();
    wait_until(|| {
        let handle = check_handle.clone();
        async move { !handle.status_snapshot().anomaly_message.is_empty() }
    })
    .await;
    let snapshot = handle.status_snapshot();
    assert!(snapshot.is_anomaly_detected);
    assert!(snapshot.anomaly_message.contains("missing 2 users"));
    assert_eq!(snapshot.anomaly_not_present_user_count, 2);

    // A plain sync request is gated while the anomaly is latched
    let completed_before = count_completed_syncs(&store).await;
    handle.request_sync(false, false).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count_completed_syncs(&store).await, completed_before);

    // The operator resumes: one gate-lifting cycle runs, finds no newly
    // missing users, and the guard clears itself
    handle.request_sync(true, false).await;
    let check_handle = handle.clone();
    wait_until(|| {
        let handle = check_handle.clone();
        async move { !handle.status_snapshot().is_anomaly_detected }
    })
    .await;
    assert!(handle.status_snapshot().anomaly_message.is_empty());
}

#[tokio::test]
async fn test_stop_request_is_honored_and_idempotent() {
    let store = in_memory_store().await;
    let directory = healthy_directory();
    let handle = start_monitor(store.clone(), directory.clone(), test_config()).await;

    handle.save_forests(vec![forest(&[("dc1", true)])]).await;
    handle.request_stop().await;
    handle.request_stop().await;
    handle.wait_for_stopped().await;

    assert!(!handle.status_snapshot().is_ad_sync_in_progress);
}
