//! Config Reload Integration Tests
//!
//! Loads a YAML config naming the `conduit-echo` driver, boots it, then
//! edits the file and applies the new plan the way the daemon does on a
//! config change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use conduit::config;
use conduit::{Lifecycle, ReloadPlan, Service};
use serde_json::{json, Value};
use tempfile::TempDir;

fn echo_dir() -> PathBuf {
    Path::new(env!("CARGO_BIN_EXE_conduit-echo"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn write_config(dir: &Path, features: &str) -> PathBuf {
    let path = dir.join("config.yaml");
    let content = format!(
        r#"
service: ledger
home: ./state
driver_dir: {driver_dir}
drivers:
  echo:
    builtin: conduit-echo
    args: [7]
  pinned:
    path: {echo_bin}
feature_map:
  kv: echo
features:
{features}
timeouts:
  rpc_secs: 5
  cold_grace_ms: 100
"#,
        driver_dir = echo_dir().display(),
        echo_bin = env!("CARGO_BIN_EXE_conduit-echo"),
        features = features,
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn test_config_edit_hot_and_cold_reloads() {
    let temp = TempDir::new().unwrap();
    let path = write_config(
        temp.path(),
        r#"
  kv:
    required: true
    data: { size: 1 }
  audit:
    driver: pinned
"#,
    );

    let cfg = config::load(Some(&path)).unwrap();
    assert_eq!(cfg.home, temp.path().join("state"));

    let service = Service::new(&cfg.service, cfg.settings(), Lifecycle::new());
    let _serving = tokio::spawn({
        let service = service.clone();
        async move { service.run().await }
    });
    service.boot(cfg.plan().unwrap()).await.unwrap();
    assert_eq!(service.feature_names(), vec!["audit", "kv"]);

    let me: Value = service.call("kv", "whoami", &Value::Null).await.unwrap();
    assert_eq!(me["service"], "ledger");
    assert_eq!(me["args"], json!(["7"]));
    let kv_pid = service.get("kv").unwrap().pid();
    let audit_pid = service.get("audit").unwrap().pid();

    // data change on kv, new args on the pinned driver, a new feature
    let path = write_config(
        temp.path(),
        r#"
  kv:
    required: true
    data: { size: 2 }
  audit:
    driver: pinned
  extra:
    driver: echo
"#,
    );
    let mut cfg = config::load(Some(&path)).unwrap();
    cfg.file
        .drivers
        .get_mut("pinned")
        .unwrap()
        .args
        .push(json!("--verbose"));

    let mut report = service.apply(cfg.plan().unwrap()).await;
    report.reloaded.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        report.reloaded,
        vec![
            ("audit".to_string(), ReloadPlan::Cold),
            ("extra".to_string(), ReloadPlan::Cold),
            ("kv".to_string(), ReloadPlan::Hot),
        ]
    );
    assert!(report.failed.is_empty());

    assert_eq!(service.get("kv").unwrap().pid(), kv_pid);
    assert_ne!(service.get("audit").unwrap().pid(), audit_pid);

    let me: Value = service.call("kv", "whoami", &Value::Null).await.unwrap();
    assert_eq!(me["options"]["data"]["size"], 2);

    // dropping features from the file stops them
    let path = write_config(
        temp.path(),
        r#"
  kv:
    data: { size: 2 }
"#,
    );
    let cfg = config::load(Some(&path)).unwrap();
    let report = service.apply(cfg.plan().unwrap()).await;
    let mut removed = report.removed.clone();
    removed.sort();
    assert_eq!(removed, vec!["audit", "extra"]);
    assert_eq!(service.feature_names(), vec!["kv"]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_invalid_builtin_name_fails_the_feature() {
    let temp = TempDir::new().unwrap();
    let path = write_config(temp.path(), "  kv: {}\n");
    let mut cfg = config::load(Some(&path)).unwrap();
    cfg.file.drivers.get_mut("echo").unwrap().builtin = Some("../conduit-echo".to_string());

    let service = Service::new(&cfg.service, cfg.settings(), Lifecycle::new());
    let _serving = tokio::spawn({
        let service = service.clone();
        async move { service.run().await }
    });

    // optional, so boot succeeds without it
    tokio::time::timeout(Duration::from_secs(10), service.boot(cfg.plan().unwrap()))
        .await
        .unwrap()
        .unwrap();
    assert!(service.get("kv").is_none());

    service.shutdown().await;
}
