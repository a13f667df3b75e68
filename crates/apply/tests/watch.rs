use std::{sync::Arc, time::Duration};

use berth_apply::{PodPhase, Reconciler};
use berth_core::{Error, ObjectKey};
use berth_kubehub::mock::{Call, MockCluster};
use kube::{api::WatchEvent, core::{DynamicObject, ErrorResponse}};
use serde_json::{json, Value};

fn setup() -> (Arc<MockCluster>, Reconciler) {
    let cluster = Arc::new(MockCluster::new());
    let reconciler = Reconciler::new(cluster.clone());
    (cluster, reconciler)
}

fn job(conditions: Value) -> Value {
    json!({
        "apiVersion": "batch/v1", "kind": "Job",
        "metadata": {"name": "migrate", "namespace": "ns"},
        "spec": {"template": {"spec": {"restartPolicy": "Never", "containers": [{"name": "m", "image": "migrate"}]}}},
        "status": {"conditions": conditions}
    })
}

fn pod(phase: &str) -> Value {
    json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": {"name": "test-hook", "namespace": "ns"},
        "spec": {"containers": [{"name": "t", "image": "busybox"}]},
        "status": {"phase": phase}
    })
}

fn obj(v: Value) -> DynamicObject {
    serde_json::from_value(v).unwrap()
}

fn job_key() -> ObjectKey {
    ObjectKey::new("Job", Some("ns"), "migrate")
}

fn pod_key() -> ObjectKey {
    ObjectKey::new("Pod", Some("ns"), "test-hook")
}

fn manifest(v: &Value) -> Vec<u8> {
    v.to_string().into_bytes()
}

#[tokio::test]
async fn job_watch_waits_for_completion() {
    let (cluster, r) = setup();
    cluster.script_watch(
        job_key(),
        vec![
            WatchEvent::Added(obj(job(json!([])))),
            WatchEvent::Modified(obj(job(json!([{"type": "Complete", "status": "True"}])))),
        ],
    );
    r.watch_until_ready("ns", &manifest(&job(json!([]))), Duration::from_secs(5)).await.unwrap();
    assert_eq!(cluster.calls(), vec![Call::Watch(job_key())]);
}

#[tokio::test]
async fn failed_job_fails_the_watch() {
    let (cluster, r) = setup();
    cluster.script_watch(
        job_key(),
        vec![WatchEvent::Modified(obj(job(json!([{"type": "Failed", "status": "True", "reason": "DeadlineExceeded"}]))))],
    );
    let err = r.watch_until_ready("ns", &manifest(&job(json!([]))), Duration::from_secs(5)).await.unwrap_err();
    match err {
        Error::JobFailed { key, reason } => {
            assert_eq!(key, job_key());
            assert_eq!(reason, "DeadlineExceeded");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn plain_objects_are_ready_once_seen() {
    let (cluster, r) = setup();
    let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "ns"}});
    cluster.seed(cm.clone()).unwrap();
    r.watch_until_ready("ns", &manifest(&cm), Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn error_events_fail_the_watch() {
    let (cluster, r) = setup();
    cluster.script_watch(
        job_key(),
        vec![WatchEvent::Error(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        })],
    );
    let err = r.watch_until_ready("ns", &manifest(&job(json!([]))), Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, Error::Watch { .. }), "err={}", err);
    assert!(err.to_string().contains("failed to deploy migrate"), "err={}", err);
}

#[tokio::test]
async fn closed_stream_before_milestone_is_an_error() {
    let (cluster, r) = setup();
    cluster.script_watch(job_key(), vec![WatchEvent::Added(obj(job(json!([]))))]);
    let err = r.watch_until_ready("ns", &manifest(&job(json!([]))), Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, Error::Watch { .. }), "err={}", err);
}

#[tokio::test]
async fn strict_decode_rejects_bad_bodies() {
    let (_cluster, r) = setup();
    let bad = json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "migrate"}, "spec": {"parallelism": "two"}});
    let err = r.watch_until_ready("ns", &manifest(&bad), Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)), "err={}", err);
    assert!(matches!(r.watch_until_ready("ns", b"", Duration::from_secs(1)).await, Err(Error::NoObjects)));
}

#[tokio::test]
async fn completed_pod_phase_is_returned() {
    let (cluster, r) = setup();
    cluster.seed(pod("Succeeded")).unwrap();
    cluster.script_watch(
        pod_key(),
        vec![WatchEvent::Added(obj(pod("Pending"))), WatchEvent::Modified(obj(pod("Running"))), WatchEvent::Modified(obj(pod("Succeeded")))],
    );
    let phase = r.wait_and_get_completed_pod_phase("ns", &manifest(&pod("Pending")), Duration::from_secs(5)).await.unwrap();
    assert_eq!(phase, PodPhase::Succeeded);
    assert_eq!(cluster.calls(), vec![Call::Watch(pod_key()), Call::Get(pod_key())]);
}

#[tokio::test]
async fn deleted_pod_is_not_found() {
    let (cluster, r) = setup();
    cluster.script_watch(pod_key(), vec![WatchEvent::Modified(obj(pod("Running"))), WatchEvent::Deleted(obj(pod("Running")))]);
    let err = r.wait_and_get_completed_pod_phase("ns", &manifest(&pod("Pending")), Duration::from_secs(5)).await.unwrap_err();
    assert!(err.is_not_found(), "err={}", err);
}

#[tokio::test]
async fn first_object_must_be_a_pod() {
    let (_cluster, r) = setup();
    let err = r.wait_and_get_completed_pod_phase("ns", &manifest(&job(json!([]))), Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::NotAPod(_)));
    assert_eq!(err.to_string(), "Job \"ns/migrate\" is not a Pod");
}

#[tokio::test]
async fn pod_phase_needs_exactly_one_object() {
    let (cluster, r) = setup();
    cluster.seed(pod("Succeeded")).unwrap();
    let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "ns"}});
    let two = format!("{}\n---\n{}", pod("Pending"), cm);
    let err = r.wait_and_get_completed_pod_phase("ns", two.as_bytes(), Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::NotSinglePod(2)), "err={}", err);
    assert!(cluster.calls().is_empty());
    let err = r.wait_and_get_completed_pod_phase("ns", b"", Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::NoObjects), "err={}", err);
}

#[tokio::test]
async fn pod_watch_ending_early_fails() {
    let (cluster, r) = setup();
    cluster.script_watch(pod_key(), vec![WatchEvent::Modified(obj(pod("Running")))]);
    let err = r.wait_and_get_completed_pod_phase("ns", &manifest(&pod("Pending")), Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, Error::Watch { .. }), "err={}", err);
}

#[tokio::test]
async fn pod_watch_times_out() {
    let (cluster, r) = setup();
    cluster.script_watch_open(pod_key(), vec![WatchEvent::Modified(obj(pod("Running")))]);
    let err = r.wait_and_get_completed_pod_phase("ns", &manifest(&pod("Pending")), Duration::from_millis(50)).await.unwrap_err();
    match err {
        Error::ReadinessTimeout { pending } => assert_eq!(pending, vec![pod_key()]),
        other => panic!("unexpected error: {}", other),
    }
}
