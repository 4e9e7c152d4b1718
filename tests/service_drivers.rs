//! Service Integration Tests
//!
//! Boots real driver processes (the `conduit-echo` binary) and exercises
//! calls, reloads, relays, commands and crash recovery end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conduit::domain::Labels;
use conduit::{
    DriverMeta, DriverSource, FeatureConfig, FeatureSpec, FeatureState, Lifecycle, ReloadPlan,
    RpcError, Service, ServiceError, ServicePlan, ServiceSettings,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn echo_meta(args: Vec<Value>) -> DriverMeta {
    DriverMeta {
        name: "echo".to_string(),
        kind: "echo".to_string(),
        source: DriverSource::Path(PathBuf::from(env!("CARGO_BIN_EXE_conduit-echo"))),
        args,
    }
}

fn feature(name: &str, data: Value) -> FeatureSpec {
    FeatureSpec {
        feature: name.to_string(),
        driver: echo_meta(vec![json!(64)]),
        config: FeatureConfig::new(data, Value::Null),
        required: false,
    }
}

fn plan(features: Vec<FeatureSpec>) -> ServicePlan {
    let mut plan = ServicePlan::default();
    for spec in &features {
        plan.drivers
            .insert(spec.driver.name.clone(), spec.driver.clone());
    }
    plan.features = features;
    plan
}

fn settings() -> ServiceSettings {
    ServiceSettings {
        rpc_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(100),
        readiness_timeout: Duration::from_secs(10),
        cold_grace: Duration::from_millis(100),
        recovery_attempts: 3,
        recovery_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn start(
    settings: ServiceSettings,
    features: Vec<FeatureSpec>,
) -> (Arc<Service>, JoinHandle<Result<(), ServiceError>>, Result<(), ServiceError>) {
    let service = Service::new("test", settings, Lifecycle::new());
    let serving = tokio::spawn({
        let service = service.clone();
        async move { service.run().await }
    });
    let booted = service.boot(plan(features)).await;
    (service, serving, booted)
}

async fn whoami(service: &Service, feature: &str) -> Value {
    service
        .call::<_, Value>(feature, "whoami", &Value::Null)
        .await
        .unwrap()
}

/// A feature whose driver is reached through a symlink the test can remove
#[cfg(unix)]
fn linked_feature(dir: &TempDir, name: &str, required: bool) -> (FeatureSpec, PathBuf) {
    let link = dir.path().join("conduit-echo");
    std::os::unix::fs::symlink(env!("CARGO_BIN_EXE_conduit-echo"), &link).unwrap();

    let mut spec = feature(name, json!({}));
    spec.driver.source = DriverSource::Path(link.clone());
    spec.required = required;
    (spec, link)
}

/// Poll until the feature runs under a pid other than `old`
async fn wait_for_new_pid(service: &Service, feature: &str, old: Option<u32>) -> u32 {
    for _ in 0..200 {
        if let Some(runtime) = service.get(feature) {
            if runtime.state() == FeatureState::Alive && runtime.pid() != old {
                return runtime.pid().unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("feature {} was not replaced", feature);
}

#[tokio::test]
async fn test_boot_and_call() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({"size": 1}))]).await;
    booted.unwrap();

    let reply: Value = service.call("kv", "echo", &json!({"a": [1, 2]})).await.unwrap();
    assert_eq!(reply, json!({"a": [1, 2]}));

    let me = whoami(&service, "kv").await;
    assert_eq!(me["service"], "test");
    assert_eq!(me["args"], json!(["64"]));
    assert_eq!(me["options"]["data"]["size"], 1);
    assert_eq!(me["starts"], 1);

    let options: FeatureConfig = service.call("kv", "options", &Value::Null).await.unwrap();
    assert_eq!(options, FeatureConfig::new(json!({"size": 1}), Value::Null));

    let err = service
        .call::<_, Value>("kv", "fail", &"no luck")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(ref reason) if reason == "no luck"), "{:?}", err);

    let err = service
        .call::<_, Value>("kv", "missing", &Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));

    service.shutdown().await;
}

#[tokio::test]
async fn test_ping() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({}))]).await;
    booted.unwrap();

    let rtt = service.ping("kv").await.unwrap();
    assert!(rtt < Duration::from_secs(10));

    service.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_pings_on_a_shared_driver() {
    let settings = ServiceSettings {
        readiness_timeout: Duration::from_secs(2),
        ..settings()
    };
    let (service, _serving, booted) =
        start(settings, vec![feature("a", json!({})), feature("b", json!({}))]).await;
    booted.unwrap();

    for _ in 0..3 {
        let (a, b) = tokio::join!(service.ping("a"), service.ping("b"));
        a.unwrap();
        b.unwrap();
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_hot_reload_keeps_process() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({"size": 1}))]).await;
    booted.unwrap();
    let before = service.get("kv").unwrap();

    // identical config is a no-op
    let outcome = service
        .reload_feature(feature("kv", json!({"size": 1})))
        .await
        .unwrap();
    assert_eq!(outcome, ReloadPlan::Noop);

    let outcome = service
        .reload_feature(feature("kv", json!({"size": 2})))
        .await
        .unwrap();
    assert_eq!(outcome, ReloadPlan::Hot);

    let after = service.get("kv").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.pid(), before.pid());
    assert_eq!(after.state(), FeatureState::Alive);

    let me = whoami(&service, "kv").await;
    assert_eq!(me["options"]["data"]["size"], 2);
    assert_eq!(me["starts"], 2);

    service.shutdown().await;
}

#[tokio::test]
async fn test_changed_args_cold_reload() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({}))]).await;
    booted.unwrap();
    let before = service.get("kv").unwrap();

    let mut spec = feature("kv", json!({}));
    spec.driver.args = vec![json!(128), json!("--lru")];
    let outcome = service.reload_feature(spec).await.unwrap();
    assert_eq!(outcome, ReloadPlan::Cold);

    let after = service.get("kv").unwrap();
    assert_ne!(after.pid(), before.pid());
    assert!(after.generation() > before.generation());

    let me = whoami(&service, "kv").await;
    assert_eq!(me["args"], json!(["128", "--lru"]));
    assert_eq!(me["starts"], 1);

    // the replaced process is closed once the grace period has passed
    tokio::time::timeout(Duration::from_secs(5), before.handle().wait())
        .await
        .unwrap()
        .unwrap();
    assert!(before.handle().is_closed());
    assert!(!after.handle().is_closed());

    service.shutdown().await;
}

#[tokio::test]
async fn test_crash_is_recovered() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({}))]).await;
    booted.unwrap();
    let old = service.get("kv").unwrap().pid();

    service.call_no_wait("kv", "exit", &0).await.unwrap();

    let new = wait_for_new_pid(&service, "kv", old).await;
    assert_ne!(Some(new), old);
    assert!(service.recoveries() >= 1);

    let reply: Value = service.call("kv", "echo", &"back").await.unwrap();
    assert_eq!(reply, "back");

    service.shutdown().await;
}

#[tokio::test]
async fn test_crash_after_rejected_reload_uses_known_good_config() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({"size": 1}))]).await;
    booted.unwrap();
    let old = service.get("kv").unwrap().pid();

    let mut broken = feature("kv", json!({"size": 2}));
    broken.driver.source = DriverSource::Path(PathBuf::from("/nonexistent/conduit-echo"));
    let err = service.reload_feature(broken).await.unwrap_err();
    assert!(matches!(err, ServiceError::Driver(_)), "{:?}", err);
    assert_eq!(service.get("kv").unwrap().state(), FeatureState::Alive);

    let known_good = FeatureConfig::new(json!({"size": 1}), Value::Null);
    assert_eq!(service.status().features[0].fingerprint, known_good.fingerprint());

    service.call_no_wait("kv", "exit", &0).await.unwrap();
    wait_for_new_pid(&service, "kv", old).await;
    assert_eq!(service.recoveries(), 1);

    let options: FeatureConfig = service.call("kv", "options", &Value::Null).await.unwrap();
    assert_eq!(options, known_good);

    service.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_exhausted_recovery_of_required_feature_stops_service() {
    let dir = TempDir::new().unwrap();
    let (spec, link) = linked_feature(&dir, "kv", true);
    let settings = ServiceSettings {
        recovery_attempts: 2,
        ..settings()
    };

    let (service, serving, booted) = start(settings, vec![spec]).await;
    booted.unwrap();

    std::fs::remove_file(&link).unwrap();
    service.call_no_wait("kv", "exit", &0).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), serving)
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(
            result,
            Err(ServiceError::RecoveryExhausted { ref feature, attempts: 2 }) if feature == "kv"
        ),
        "{:?}",
        result
    );
    assert_eq!(service.recoveries(), 1);
    assert_eq!(service.get("kv").unwrap().state(), FeatureState::Failed);

    service.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_exhausted_recovery_of_optional_feature_keeps_serving() {
    let dir = TempDir::new().unwrap();
    let (spec, link) = linked_feature(&dir, "kv", false);
    let settings = ServiceSettings {
        recovery_attempts: 2,
        ..settings()
    };

    let (service, serving, booted) = start(settings, vec![spec]).await;
    booted.unwrap();

    std::fs::remove_file(&link).unwrap();
    service.call_no_wait("kv", "exit", &0).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!serving.is_finished());
    assert_eq!(service.recoveries(), 1);
    assert_eq!(service.status().features[0].state, FeatureState::Failed);

    service.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_driver_requested_cold_restart() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({}))]).await;
    booted.unwrap();
    let old = service.get("kv").unwrap().pid();

    let _: Value = service.call("kv", "cold", &Value::Null).await.unwrap();

    let new = wait_for_new_pid(&service, "kv", old).await;
    assert_ne!(Some(new), old);
    assert_eq!(service.recoveries(), 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_relay_between_features() {
    let (service, _serving, booted) = start(
        settings(),
        vec![feature("front", json!({})), feature("back", json!({}))],
    )
    .await;
    booted.unwrap();

    let reply: Value = service
        .call(
            "front",
            "call",
            &json!({"feature": "back", "method": "echo", "params": {"k": "v"}}),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"k": "v"}));

    // a relay to a feature that does not exist fails back to the caller
    let err = service
        .call::<_, Value>(
            "front",
            "call",
            &json!({"feature": "nowhere", "method": "echo"}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(ref reason) if reason.contains("nowhere")), "{:?}", err);

    service.shutdown().await;
}

#[tokio::test]
async fn test_command_retry() {
    let (service, _serving, booted) = start(settings(), vec![feature("kv", json!({}))]).await;
    booted.unwrap();

    let labels: Labels = [
        ("retry", "3"),
        ("backoff_ms", "10"),
        ("succeed_on", "3"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    service.command("kv", "flaky", labels, vec![]).await.unwrap();

    // the process-wide attempt counter is now 3; two more attempts stay short of 100
    let labels: Labels = [
        ("retry", "1"),
        ("backoff_ms", "10"),
        ("succeed_on", "100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let err = service
        .command("kv", "flaky", labels, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(ref reason) if reason.contains("attempt 5")), "{:?}", err);

    service.shutdown().await;
}

#[tokio::test]
async fn test_apply_removes_stale_but_keeps_dynamic() {
    let (service, _serving, booted) = start(
        settings(),
        vec![feature("a", json!({})), feature("b", json!({}))],
    )
    .await;
    booted.unwrap();

    service
        .add_dynamic_feature("session", "echo", FeatureConfig::default(), false)
        .await
        .unwrap();

    let report = service.apply(plan(vec![feature("a", json!({"v": 2}))])).await;
    assert_eq!(report.reloaded, vec![("a".to_string(), ReloadPlan::Hot)]);
    assert_eq!(report.removed, vec!["b".to_string()]);
    assert!(report.failed.is_empty());

    assert_eq!(service.feature_names(), vec!["a", "session"]);
    assert!(matches!(
        service.call::<_, Value>("b", "echo", &1).await,
        Err(RpcError::Unavailable(_))
    ));

    let err = service
        .add_dynamic_feature("other", "nope", FeatureConfig::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnknownDriver { .. }));

    service.shutdown().await;
}

#[tokio::test]
async fn test_required_feature_that_never_goes_alive_fails_boot() {
    let mut spec = feature("kv", json!({"fail_start": true}));
    spec.required = true;
    let settings = ServiceSettings {
        readiness_timeout: Duration::from_millis(500),
        ..settings()
    };

    let (service, _serving, booted) = start(settings, vec![spec]).await;
    assert!(matches!(
        booted,
        Err(ServiceError::RequiredFailed { ref feature, .. }) if feature == "kv"
    ));
    assert!(service.get("kv").is_none());

    // still reported, as failed
    let status = service.status();
    assert_eq!(status.features.len(), 1);
    assert_eq!(status.features[0].state, FeatureState::Failed);

    service.shutdown().await;
}

#[tokio::test]
async fn test_failed_hot_reload_keeps_previous_options() {
    let (service, _serving, booted) = start(
        ServiceSettings {
            readiness_timeout: Duration::from_millis(500),
            ..settings()
        },
        vec![feature("kv", json!({"size": 1}))],
    )
    .await;
    booted.unwrap();

    let err = service
        .reload_feature(feature("kv", json!({"fail_start": true})))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotReady { .. }), "{:?}", err);

    let runtime = service.get("kv").unwrap();
    assert_eq!(runtime.state(), FeatureState::Failed);
    assert_eq!(runtime.config().data, json!({"size": 1}));

    // a failed feature is replaced by a cold reload on the next attempt
    let outcome = service
        .reload_feature(feature("kv", json!({"size": 3})))
        .await
        .unwrap();
    assert_eq!(outcome, ReloadPlan::Cold);
    assert_eq!(service.get("kv").unwrap().state(), FeatureState::Alive);

    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_loop_and_drivers() {
    let (service, serving, booted) = start(settings(), vec![feature("kv", json!({}))]).await;
    booted.unwrap();
    let runtime = service.get("kv").unwrap();

    service.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(runtime.handle().is_closed());
    assert!(service.feature_names().is_empty());
    assert!(matches!(
        service.reload_feature(feature("kv", json!({}))).await,
        Err(ServiceError::ShuttingDown)
    ));
}
