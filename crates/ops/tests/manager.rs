#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{ContainerManifest, ProjectType};
use keel_ops::{resource_name, Call, ClusterError, ManagerConfig, MemoryWorkloadApi, ResourceManager, Workload};

fn workload(pt: ProjectType) -> Workload {
    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), "8080".to_string());
    Workload {
        project_id: "p1".into(),
        deployment_id: "d1".into(),
        project_type: pt,
        manifest: ContainerManifest { image: "registry/p1:abc".into(), env, container_id: "c1".into() },
    }
}

fn manager(api: &Arc<MemoryWorkloadApi>, max_polls: Option<u32>) -> ResourceManager {
    let cfg = ManagerConfig { poll_interval: Duration::from_millis(10), max_polls, ..Default::default() };
    ResourceManager::new(api.clone(), cfg)
}

#[tokio::test(start_paused = true)]
async fn create_waits_for_not_found_before_creating() {
    let api = Arc::new(MemoryWorkloadApi::new().with_termination_polls(3));
    let m = manager(&api, None);
    m.create(&workload(ProjectType::Dynamic)).await.unwrap();
    m.create(&workload(ProjectType::Dynamic)).await.unwrap();

    let calls = api.calls();
    let second_delete = calls.iter().rposition(|c| matches!(c, Call::DeletePod { .. })).unwrap();
    let gone = calls
        .iter()
        .skip(second_delete)
        .position(|c| matches!(c, Call::GetPod { found: false, .. }))
        .map(|i| i + second_delete)
        .unwrap();
    let last_create = calls.iter().rposition(|c| matches!(c, Call::CreatePod { .. })).unwrap();
    assert!(gone < last_create);
    let visible = calls[second_delete..gone].iter().filter(|c| matches!(c, Call::GetPod { found: true, .. })).count();
    assert_eq!(visible, 3);
    assert!(api.pod("keel-dynamic", "p1").is_some());
}

#[tokio::test(start_paused = true)]
async fn bounded_polls_give_up() {
    let api = Arc::new(MemoryWorkloadApi::new().with_termination_polls(10));
    let m = manager(&api, Some(2));
    m.create(&workload(ProjectType::Static)).await.unwrap();
    let err = m.create(&workload(ProjectType::Static)).await.unwrap_err();
    assert!(matches!(err, ClusterError::Timeout { polls: 2, .. }));
}

#[tokio::test]
async fn recreate_if_missing_treats_conflict_as_success_and_never_deletes() {
    let api = Arc::new(MemoryWorkloadApi::new());
    let m = manager(&api, None);
    let w = workload(ProjectType::Dynamic);
    m.recreate_if_missing(&w).await.unwrap();
    m.recreate_if_missing(&w).await.unwrap();
    assert_eq!(api.pod_creates(), 2);
    assert!(!api.calls().iter().any(|c| matches!(c, Call::DeletePod { .. })));
}

#[tokio::test]
async fn recreate_if_missing_propagates_other_errors() {
    let api = Arc::new(MemoryWorkloadApi::new());
    api.fail_pod_creates(Some(ClusterError::Api { code: 500, message: "etcd".into() }));
    let m = manager(&api, None);
    let err = m.recreate_if_missing(&workload(ProjectType::Dynamic)).await.unwrap_err();
    assert_eq!(err, ClusterError::Api { code: 500, message: "etcd".into() });
}

#[tokio::test]
async fn expose_creates_then_replaces_keeping_cluster_ip() {
    let api = Arc::new(MemoryWorkloadApi::new());
    let m = manager(&api, None);
    let w = workload(ProjectType::Dynamic);
    m.expose(&w).await.unwrap();
    let ip = api.service("keel-dynamic", "p1").unwrap().spec.unwrap().cluster_ip;
    m.expose(&w).await.unwrap();
    let after = api.service("keel-dynamic", "p1").unwrap().spec.unwrap().cluster_ip;
    assert_eq!(ip, after);
    let calls = api.calls();
    assert!(matches!(calls[0], Call::CreateService { .. }));
    assert!(matches!(calls[1], Call::ReplaceService { .. }));
}

#[tokio::test]
async fn delete_of_missing_workload_succeeds() {
    let api = Arc::new(MemoryWorkloadApi::new());
    let m = manager(&api, None);
    m.delete("p1", ProjectType::Dynamic).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delete_removes_pod_and_service() {
    let api = Arc::new(MemoryWorkloadApi::new().with_termination_polls(1));
    let m = manager(&api, None);
    let w = workload(ProjectType::Dynamic);
    m.create(&w).await.unwrap();
    m.expose(&w).await.unwrap();
    m.delete("p1", ProjectType::Dynamic).await.unwrap();
    assert!(api.pod("keel-dynamic", "p1").is_none());
    assert!(api.service("keel-dynamic", "p1").is_none());
}

#[tokio::test(start_paused = true)]
async fn projects_with_similar_ids_never_touch_each_other() {
    let api = Arc::new(MemoryWorkloadApi::new());
    let m = manager(&api, None);
    let mut upper = workload(ProjectType::Dynamic);
    upper.project_id = "App_1".into();
    let mut lower = workload(ProjectType::Dynamic);
    lower.project_id = "app-1".into();

    m.create(&upper).await.unwrap();
    m.expose(&upper).await.unwrap();
    m.create(&lower).await.unwrap();
    m.expose(&lower).await.unwrap();

    let upper_name = resource_name("App_1");
    assert_ne!(upper_name, "app-1");
    assert!(api.pod("keel-dynamic", &upper_name).is_some());
    assert!(api.pod("keel-dynamic", "app-1").is_some());
    let deleted: Vec<_> = api
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::DeletePod { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(deleted, vec![upper_name.clone(), "app-1".to_string()]);

    m.delete("app-1", ProjectType::Dynamic).await.unwrap();
    assert!(api.pod("keel-dynamic", "app-1").is_none());
    assert!(api.pod("keel-dynamic", &upper_name).is_some());
    assert!(api.service("keel-dynamic", &upper_name).is_some());
}

#[tokio::test]
async fn ensure_namespaces_tolerates_existing() {
    let api = Arc::new(MemoryWorkloadApi::new());
    let m = manager(&api, None);
    m.ensure_namespaces().await.unwrap();
    m.ensure_namespaces().await.unwrap();
    assert_eq!(api.namespaces(), vec!["keel-dynamic".to_string(), "keel-static".to_string()]);
}

#[tokio::test]
async fn paid_tier_deployment_create_or_replace() {
    let api = Arc::new(MemoryWorkloadApi::new());
    let m = manager(&api, None);
    let w = workload(ProjectType::Dynamic);
    m.apply_deployment(&w, 2).await.unwrap();
    m.apply_deployment(&w, 3).await.unwrap();
    let d = api.deployment("keel-dynamic", "p1").unwrap();
    assert_eq!(d.spec.unwrap().replicas, Some(3));
    m.delete_deployment("p1", ProjectType::Dynamic).await.unwrap();
    m.delete_deployment("p1", ProjectType::Dynamic).await.unwrap();
    assert!(api.deployment("keel-dynamic", "p1").is_none());
}
