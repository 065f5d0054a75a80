//! Durability properties of the on-disk repository: layout, crash recovery
//! and reset backups.

mod common;

use caravan::change::{NomadChange, SettingChange};
use caravan::model::applicability::Applicability;
use caravan::model::setting::Setting;
use common::{client_for, cluster_of, endpoints, TestNode};

async fn activate_alone(node: &TestNode) {
    let cluster = cluster_of(&[node]);
    node.service
        .prepare_activation(cluster.clone(), None)
        .expect("prepare activation");
    client_for(endpoints(&[node]))
        .run_change(NomadChange::ClusterActivation {
            cluster,
            license: None,
        })
        .await
        .expect("activation");
}

fn repo_files(dir: &std::path::Path, subtree: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.join("repo").join(subtree))
        .expect("read repo subtree")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn repository_layout_after_changes() {
    let node = TestNode::start("node-a", "host-a", 9410);
    activate_alone(&node).await;

    let change = NomadChange::Setting(SettingChange::set(
        Applicability::cluster(),
        Setting::ClusterName,
        None,
        "renamed",
    ));
    client_for(endpoints(&[&node]))
        .run_change(change)
        .await
        .expect("setting change");

    let config = repo_files(node.dir.path(), "config");
    assert_eq!(
        config,
        vec![
            "cluster-config.node-a.1.json".to_string(),
            "cluster-config.node-a.2.json".to_string(),
        ]
    );
    let sanskrit = repo_files(node.dir.path(), "sanskrit");
    assert_eq!(sanskrit, vec!["journal.jsonl".to_string()]);
    // The license subtree exists even when no license is installed.
    assert!(repo_files(node.dir.path(), "license").is_empty());
}

#[tokio::test]
async fn crash_recovery_reproduces_state() {
    let mut node = TestNode::start("node-a", "host-a", 9410);
    activate_alone(&node).await;

    let change = NomadChange::Setting(SettingChange::set(
        Applicability::cluster(),
        Setting::OffheapResources,
        Some("main".to_string()),
        "256MB",
    ));
    client_for(endpoints(&[&node]))
        .run_change(change)
        .await
        .expect("setting change");

    let before_discover = node.discover();
    let before_context = node.service.upcoming_node_context();

    node.restart();

    assert_eq!(node.discover(), before_discover);
    assert!(node.service.is_activated());
    assert_eq!(node.service.upcoming_node_context(), before_context);
    assert_eq!(node.service.runtime_node_context(), before_context);
}

#[tokio::test]
async fn reset_backs_up_config_and_journal() {
    let node = TestNode::start("node-a", "host-a", 9410);
    activate_alone(&node).await;

    node.service
        .nomad_server()
        .lock()
        .reset()
        .expect("reset stores");

    let config = repo_files(node.dir.path(), "config");
    assert_eq!(config.len(), 1);
    assert!(config[0].starts_with("backup-cluster-config.node-a.1.json-"));

    let sanskrit = repo_files(node.dir.path(), "sanskrit");
    assert_eq!(sanskrit.len(), 1);
    assert!(sanskrit[0].starts_with("backup-journal.jsonl-"));

    // A fresh history starts cleanly over the same repository.
    let discover = node.discover();
    assert_eq!(discover.current_version, 0);
    assert_eq!(discover.mutative_message_count, 0);
}
