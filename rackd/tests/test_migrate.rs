use std::fs;
use std::path::PathBuf;

use common::{ClusterConfig, WorkerId};
use rackd::{ConfigMigrator, MigrateOutcome};
use tempfile::tempdir;
use uuid::Uuid;

const CLUSTER_UUID: &str = "5c9d2f1e-8a57-4c3b-b0a5-7e0f6cbf0d44";

#[test]
fn test_migrate_twice_equals_once() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("rackd.yaml");
    let legacy = dir.path().join("maas_cluster.conf");
    fs::write(
        &legacy,
        format!(
            "MAAS_URL=\"http://10.55.60.1:5240/MAAS\"\nCLUSTER_UUID=\"{CLUSTER_UUID}\"\nCLUSTER_CONTROL_SOCKET=\"/run/tgt/old.sock\"\n"
        ),
    )
    .unwrap();

    let migrator = ConfigMigrator::new(&config_path);
    assert_eq!(migrator.migrate(&legacy).unwrap(), MigrateOutcome::Migrated);
    let once = fs::read_to_string(&config_path).unwrap();

    assert_eq!(
        migrator.migrate(&legacy).unwrap(),
        MigrateOutcome::AlreadyCurrent
    );
    assert_eq!(fs::read_to_string(&config_path).unwrap(), once);

    assert!(!legacy.exists());
    let kept = PathBuf::from(format!("{}.migrated", legacy.display()));
    assert!(kept.exists(), "the old file is renamed, never deleted");

    let config = ClusterConfig::load(&config_path).unwrap();
    assert_eq!(config.region_url.as_deref(), Some("http://10.55.60.1:5240/MAAS"));
    assert_eq!(config.cluster_uuid, Some(Uuid::parse_str(CLUSTER_UUID).unwrap()));
    assert_eq!(config.control_socket, PathBuf::from("/run/tgt/old.sock"));
}

#[test]
fn test_legacy_yaml_merges_into_existing_config() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("rackd.yaml");
    assert!(ClusterConfig::init(&config_path).unwrap().changed());
    let before = ClusterConfig::load(&config_path).unwrap();

    let legacy = dir.path().join("pserv.yaml");
    fs::write(
        &legacy,
        "maas_url: http://region.internal/MAAS\nlogfile: /var/log/maas/pserv.log\n",
    )
    .unwrap();

    let migrator = ConfigMigrator::new(&config_path);
    assert_eq!(migrator.migrate(&legacy).unwrap(), MigrateOutcome::Migrated);

    let after = ClusterConfig::load(&config_path).unwrap();
    assert_eq!(after.region_url.as_deref(), Some("http://region.internal/MAAS"));
    // Values the legacy file does not carry are kept.
    assert_eq!(after.cluster_uuid, before.cluster_uuid);
    assert_eq!(after.enabled_workers, before.enabled_workers);
    assert!(after.enabled_workers.contains(&WorkerId(4)));
}

#[test]
fn test_current_and_unknown_files_are_left_alone() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("rackd.yaml");
    let migrator = ConfigMigrator::new(&config_path);

    let current = dir.path().join("rackd.conf");
    fs::write(&current, "region_url: http://region/MAAS\n").unwrap();
    assert_eq!(
        migrator.migrate(&current).unwrap(),
        MigrateOutcome::AlreadyCurrent
    );
    assert!(current.exists());

    let unknown = dir.path().join("pserv.yaml");
    fs::write(&unknown, "tftp:\n  port: 69\n").unwrap();
    assert_eq!(
        migrator.migrate(&unknown).unwrap(),
        MigrateOutcome::UnrecognizedFormat
    );
    assert!(unknown.exists());
    assert!(!config_path.exists());

    assert_eq!(
        migrator.migrate(dir.path().join("absent.conf")).unwrap(),
        MigrateOutcome::AlreadyCurrent
    );
}

#[test]
fn test_migrate_all_reports_each_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("rackd.yaml");
    let shell = dir.path().join("maas_cluster.conf");
    fs::write(&shell, "MAAS_URL=http://a/MAAS\n").unwrap();
    let yaml = dir.path().join("pserv.yaml");
    fs::write(&yaml, "maas_url: http://b/MAAS\n").unwrap();

    let outcomes = ConfigMigrator::new(&config_path)
        .migrate_all(&[&shell, &yaml, &dir.path().join("rackd.conf")])
        .unwrap();
    let outcomes: Vec<_> = outcomes.into_iter().map(|(_, o)| o).collect();
    assert_eq!(
        outcomes,
        vec![
            MigrateOutcome::Migrated,
            MigrateOutcome::Migrated,
            MigrateOutcome::AlreadyCurrent
        ]
    );
    // The later file wins.
    assert_eq!(
        ClusterConfig::load(&config_path).unwrap().region_url.as_deref(),
        Some("http://b/MAAS")
    );
}
