//! The comparator output is a faithful edit script: replaying a sequence
//! of configuration diffs leaves the store in the same state as applying
//! the final configuration directly.

use std::sync::Arc;

use adbridge_core::domain::forest::{DomainController, Forest};
use adbridge_core::domain::newtypes::ObjectGuid;
use adbridge_core::ports::IStore;
use adbridge_store::{DatabasePool, SqliteStore};
use adbridge_sync::ForestComparator;

async fn empty_store() -> Arc<dyn IStore> {
    let pool = DatabasePool::in_memory().await.unwrap();
    Arc::new(SqliteStore::new(pool.pool().clone()))
}

fn forest(guid: &str, sync_group: &str, hosts: &[(&str, bool)]) -> Forest {
    Forest {
        object_guid: ObjectGuid::new(guid).unwrap(),
        user_name: "svc".to_string(),
        password: "pw".to_string(),
        sync_group: sync_group.to_string(),
        domain_controllers: hosts
            .iter()
            .map(|(host, primary)| DomainController::new(*host, *primary))
            .collect(),
    }
}

/// Applies each configuration in turn, diffing against the previous one
async fn apply_sequence(store: &Arc<dyn IStore>, configs: &[Vec<Forest>]) {
    let mut previous: Vec<Forest> = Vec::new();
    for config in configs {
        let changes = ForestComparator::compare(&previous, config);
        if !changes.is_empty() {
            store.apply_forest_changes(&changes).await.unwrap();
        }
        previous = config.clone();
    }
}

fn normalized(mut forests: Vec<Forest>) -> Vec<Forest> {
    forests.sort_by(|a, b| a.object_guid.as_str().cmp(b.object_guid.as_str()));
    for forest in &mut forests {
        forest
            .domain_controllers
            .sort_by(|a, b| a.host.cmp(&b.host));
    }
    forests
}

#[tokio::test]
async fn test_replaying_diffs_equals_direct_apply() {
    // A sequence of configuration edits: add two forests, rotate
    // credentials, move the sync group, swap a controller, drop a forest
    let step1 = vec![
        forest("F1", "qliqConnect", &[("dc1", true)]),
        forest("F2", "Staff", &[("dc2", true), ("dc3", false)]),
    ];
    let mut step2_f1 = forest("F1", "qliqConnect", &[("dc1", true)]);
    step2_f1.password = "rotated".to_string();
    let step2 = vec![
        step2_f1.clone(),
        forest("F2", "Clinicians", &[("dc2", true), ("dc3", false)]),
    ];
    let step3 = vec![forest("F1", "qliqConnect", &[("dc1", false), ("dc4", true)])];

    let sequence = [step1, step2, step3.clone()];

    let incremental = empty_store().await;
    apply_sequence(&incremental, &sequence).await;

    let direct = empty_store().await;
    let changes = ForestComparator::compare(&[], &step3);
    direct.apply_forest_changes(&changes).await.unwrap();

    let from_sequence = normalized(incremental.load_forests().await.unwrap());
    let from_direct = normalized(direct.load_forests().await.unwrap());
    assert_eq!(from_sequence, from_direct);

    // The surviving configuration matches the final step
    assert_eq!(from_sequence.len(), 1);
    assert_eq!(from_sequence[0].object_guid.as_str(), "F1");
    assert_eq!(
        from_sequence[0]
            .domain_controllers
            .iter()
            .map(|dc| dc.host.as_str())
            .collect::<Vec<_>>(),
        vec!["dc1", "dc4"]
    );
    assert!(from_sequence[0]
        .domain_controllers
        .iter()
        .any(|dc| dc.host == "dc4" && dc.is_primary));
}

#[tokio::test]
async fn test_identical_configs_produce_no_edits() {
    let config = vec![forest("F1", "qliqConnect", &[("dc1", true)])];
    assert!(ForestComparator::compare(&config, &config).is_empty());
}
