//! Reconciliation passes against an in-memory cluster.
//!
//! Each test seeds the store, runs one or more passes of a controller
//! replica and checks the persisted status, the Pods and the monitor table.


use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use harness::{
    cluster, controller, controller_with, endpoint, eventually, pods, process, publish_instances,
    seed, snapshot, IdleWatcher, ScriptedWatcher, IMAGE, NAMESPACE, NODE_1, NODE_2, POD_IP,
};
use keel_im_controller::store::ResourceStore;
use keel_im_controller::types::{
    EngineImage, EngineImageState, EventKind, InstanceManager, InstanceManagerState,
    InstanceManagerType, InstanceProcessState, PodPhase, Setting, TaintEffect, TolerationOperator,
    SETTING_TAINT_TOLERATION,
};
use keel_im_controller::{Action, ControllerError, ControllerSettings, PodManager};
use rstest::rstest;

use InstanceManagerState::{Error, Running, Starting, Stopped, Unknown};

#[rstest]
#[case::change_ownership(NODE_1, NODE_2, Unknown, Some(PodPhase::Running), false, Running, NODE_1, POD_IP, 1, 1)]
#[case::error_then_restart(NODE_1, NODE_1, Error, Some(PodPhase::Failed), false, Starting, NODE_1, "", 0, 0)]
#[case::node_down(NODE_2, NODE_1, Running, Some(PodPhase::Running), true, Unknown, NODE_2, "", 1, 0)]
#[case::restart_after_error(NODE_1, NODE_1, Error, Some(PodPhase::Running), false, Running, NODE_1, POD_IP, 1, 1)]
#[case::running(NODE_1, NODE_1, Starting, Some(PodPhase::Running), false, Running, NODE_1, POD_IP, 1, 1)]
#[case::pod_pending(NODE_1, NODE_1, Running, Some(PodPhase::Pending), false, Starting, NODE_1, "", 1, 0)]
#[case::starting(NODE_1, NODE_1, Stopped, None, false, Starting, NODE_1, "", 1, 0)]
#[tokio::test]
#[allow(clippy::too_many_arguments)]
async fn test_reconcile_scenarios(
    #[case] controller_id: &str,
    #[case] owner: &str,
    #[case] prior: InstanceManagerState,
    #[case] pod_phase: Option<PodPhase>,
    #[case] node_down: bool,
    #[case] expected_state: InstanceManagerState,
    #[case] expected_owner: &str,
    #[case] expected_ip: &str,
    #[case] expected_pods: usize,
    #[case] expected_sessions: usize,
    #[values(InstanceManagerType::Engine, InstanceManagerType::Replica)] im_type: InstanceManagerType,
) {
    let store = cluster().await;
    let im = seed(&store, NODE_1, im_type, owner, prior, pod_phase).await;
    if node_down {
        store.remove_node(NODE_1).await;
    }

    let ctrl = controller(&store, controller_id, Arc::new(IdleWatcher));
    ctrl.reconcile(im.name()).await.unwrap();

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, expected_state);
    assert_eq!(stored.status.owner_id, expected_owner);
    assert_eq!(stored.status.ip, expected_ip);

    let pods = pods(&store).await;
    assert_eq!(pods.len(), expected_pods);
    for pod in &pods {
        assert_eq!(pod.spec.containers[0].command[0], im_type.manager_binary());
        assert_eq!(pod.spec.node_name, NODE_1);
    }

    assert_eq!(ctrl.monitor().session_count().await, expected_sessions);
}

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Starting,
        Some(PodPhase::Running),
    )
    .await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    ctrl.reconcile(im.name()).await.unwrap();
    let writes = store.write_counts().await;
    let events = store.events().await.len();

    ctrl.reconcile(im.name()).await.unwrap();
    assert_eq!(store.write_counts().await, writes);
    assert_eq!(store.events().await.len(), events);
    assert_eq!(ctrl.monitor().session_count().await, 1);
}

#[tokio::test]
async fn test_missing_resource_is_not_an_error() {
    let store = cluster().await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    let action = ctrl.reconcile("instance-manager-e-00000000").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(store.write_counts().await.status_updates, 0);
}

#[tokio::test]
async fn test_replica_not_responsible_releases_monitor() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    let ctrl = controller(&store, NODE_2, Arc::new(IdleWatcher));
    ctrl.monitor().start(im.name(), POD_IP).await;
    let writes = store.write_counts().await;

    let action = ctrl.reconcile(im.name()).await.unwrap();

    assert_eq!(action, Action::await_change());
    assert!(!ctrl.monitor().is_monitoring(im.name()).await);
    assert_eq!(store.write_counts().await, writes);
}

#[tokio::test]
async fn test_responsible_replica_takes_over_from_stale_owner() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Replica,
        NODE_2,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    let stale = controller(&store, NODE_2, Arc::new(IdleWatcher));
    let responsible = controller(&store, NODE_1, Arc::new(IdleWatcher));

    // The recorded owner keeps the resource until the responsible replica claims it.
    stale.reconcile(im.name()).await.unwrap();
    assert!(stale.monitor().is_monitoring(im.name()).await);

    responsible.reconcile(im.name()).await.unwrap();
    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.owner_id, NODE_1);
    assert!(responsible.monitor().is_monitoring(im.name()).await);

    stale.reconcile(im.name()).await.unwrap();
    assert!(!stale.monitor().is_monitoring(im.name()).await);
}

#[tokio::test]
async fn test_node_down_warns_once_and_requeues() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    store.remove_node(NODE_1).await;
    let ctrl = controller(&store, NODE_2, Arc::new(IdleWatcher));

    let action = ctrl.reconcile(im.name()).await.unwrap();
    assert!(action.requeue_after.is_some());
    let writes = store.write_counts().await;

    ctrl.reconcile(im.name()).await.unwrap();
    assert_eq!(store.write_counts().await, writes);

    let node_down: Vec<_> = store
        .events()
        .await
        .into_iter()
        .filter(|e| e.reason == "NodeDown")
        .collect();
    assert_eq!(node_down.len(), 1);
    assert_eq!(node_down[0].kind, EventKind::Warning);

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert!(stored.status.instances.is_empty());
}

#[tokio::test]
async fn test_node_down_stops_active_session() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Replica,
        NODE_2,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    publish_instances(&store, im.name(), &[process("replica-1", InstanceProcessState::Running)]).await;

    let ctrl = controller(&store, NODE_2, Arc::new(IdleWatcher));
    assert!(ctrl.monitor().start(im.name(), POD_IP).await);

    store.remove_node(NODE_1).await;
    ctrl.reconcile(im.name()).await.unwrap();

    assert_eq!(ctrl.monitor().session_count().await, 0);
    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Unknown);
    assert!(stored.status.ip.is_empty());
    assert!(stored.status.instances.is_empty());
}

#[tokio::test]
async fn test_monitor_giving_up_clears_process_table() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Starting,
        Some(PodPhase::Running),
    )
    .await;
    let watcher = ScriptedWatcher::new();
    let ctrl = controller(&store, NODE_1, watcher.clone());
    ctrl.reconcile(im.name()).await.unwrap();

    let (store_ref, watcher_ref, ctrl_ref, name) = (&store, &watcher, &ctrl, im.name());
    assert!(eventually(move || async move { watcher_ref.opens() == 1 }).await);
    assert!(watcher.emit(
        &endpoint(POD_IP),
        snapshot(&[process("engine-1", InstanceProcessState::Running)])
    ));
    assert!(
        eventually(move || async move {
            store_ref.instance_manager(name).await.unwrap().status.instances.len() == 1
        })
        .await
    );

    // The process manager stops answering until the session gives up.
    assert!(
        eventually(move || async move {
            watcher_ref.close(&endpoint(POD_IP));
            !ctrl_ref.monitor().is_monitoring(name).await
        })
        .await
    );

    let stored = store.instance_manager(name).await.unwrap();
    assert_eq!(stored.status.current_state, Running);
    assert!(stored.status.instances.is_empty());

    ctrl.reconcile(name).await.unwrap();
    assert!(ctrl.monitor().is_monitoring(name).await);
    let stored = store.instance_manager(name).await.unwrap();
    assert!(stored.status.instances.is_empty());

    ctrl.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unmonitored_manager_drops_stale_processes() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    publish_instances(&store, im.name(), &[process("engine-1", InstanceProcessState::Running)]).await;

    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));
    ctrl.reconcile(im.name()).await.unwrap();

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Running);
    assert!(stored.status.instances.is_empty());
    assert!(ctrl.monitor().is_monitoring(im.name()).await);

    // With a session in place a published table survives the next pass.
    publish_instances(&store, im.name(), &[process("engine-1", InstanceProcessState::Running)]).await;
    ctrl.reconcile(im.name()).await.unwrap();
    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.instances.len(), 1);

    ctrl.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_deletion_removes_pod_then_finalizer() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));
    ctrl.reconcile(im.name()).await.unwrap();
    assert!(ctrl.monitor().is_monitoring(im.name()).await);

    store.delete_instance_manager(im.name()).await.unwrap();

    let action = ctrl.reconcile(im.name()).await.unwrap();
    assert!(action.requeue_after.is_some());
    assert!(pods(&store).await.is_empty());
    assert!(!ctrl.monitor().is_monitoring(im.name()).await);
    assert!(store.instance_manager(im.name()).await.is_some());

    let action = ctrl.reconcile(im.name()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(store.instance_manager(im.name()).await.is_none());
}

#[tokio::test]
async fn test_deletion_waits_for_graceful_pod_removal() {
    let store = cluster().await;
    store.set_graceful_pod_deletion(true).await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Replica,
        NODE_1,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    store.delete_instance_manager(im.name()).await.unwrap();
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    for _ in 0..2 {
        let action = ctrl.reconcile(im.name()).await.unwrap();
        assert!(action.requeue_after.is_some());
    }

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert!(stored.metadata.has_finalizer(keel_im_controller::types::FINALIZER));
    assert!(store.pod(im.name()).await.unwrap().is_terminating());
}

#[tokio::test]
async fn test_stuck_terminating_pod_is_forced_out() {
    let store = cluster().await;
    store.set_graceful_pod_deletion(true).await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    store
        .set_pod_terminating(im.name(), Utc::now() - TimeDelta::minutes(10))
        .await
        .unwrap();
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    let action = ctrl.reconcile(im.name()).await.unwrap();
    assert!(action.requeue_after.is_some());
    assert!(store.pod(im.name()).await.is_none());

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Starting);
    assert_eq!(stored.status.ip, "");
}

#[tokio::test]
async fn test_image_not_ready_gates_deployment() {
    let store = cluster().await;
    store
        .put_engine_image(EngineImage::new(NAMESPACE, IMAGE, EngineImageState::Deploying))
        .await;
    let im = seed(&store, NODE_1, InstanceManagerType::Engine, "", Stopped, None).await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    let err = ctrl.reconcile(im.name()).await.unwrap_err();
    assert!(err.is_gating());
    assert!(matches!(err, ControllerError::ImageNotReady { .. }));
    assert!(pods(&store).await.is_empty());

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Stopped);
    assert_eq!(stored.status.owner_id, NODE_1);

    let events = store.events().await;
    assert!(events
        .iter()
        .any(|e| e.reason == "ImageNotReady" && e.kind == EventKind::Warning));

    store
        .put_engine_image(EngineImage::new(NAMESPACE, IMAGE, EngineImageState::Ready))
        .await;
    ctrl.reconcile(im.name()).await.unwrap();
    assert_eq!(pods(&store).await.len(), 1);
    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Starting);
}

#[tokio::test]
async fn test_unregistered_image_gates_deployment() {
    let store = cluster().await;
    let im = InstanceManager::new(NAMESPACE, NODE_1, "keel/engine:unknown", InstanceManagerType::Replica);
    let im = store.create_instance_manager(im).await.unwrap();
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    let err = ctrl.reconcile(im.name()).await.unwrap_err();
    assert!(matches!(err, ControllerError::ImageNotReady { .. }));
    assert!(pods(&store).await.is_empty());
}

#[tokio::test]
async fn test_invalid_toleration_gates_deployment() {
    let store = cluster().await;
    store
        .put_setting(Setting::new(NAMESPACE, SETTING_TAINT_TOLERATION, "key1=value1"))
        .await;
    let im = seed(&store, NODE_1, InstanceManagerType::Engine, NODE_1, Stopped, None).await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    let err = ctrl.reconcile(im.name()).await.unwrap_err();
    assert!(err.is_gating());
    assert!(matches!(err, ControllerError::InvalidToleration(_)));
    assert!(pods(&store).await.is_empty());
    assert!(store
        .events()
        .await
        .iter()
        .any(|e| e.reason == "InvalidToleration"));
}

#[tokio::test]
async fn test_tolerations_are_applied_to_new_pod() {
    let store = cluster().await;
    store
        .put_setting(Setting::new(
            NAMESPACE,
            SETTING_TAINT_TOLERATION,
            "key1=value1:NoSchedule; key2:NoExecute",
        ))
        .await;
    let im = seed(&store, NODE_1, InstanceManagerType::Replica, NODE_1, Stopped, None).await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    ctrl.reconcile(im.name()).await.unwrap();

    let pod = store.pod(im.name()).await.unwrap();
    let tolerations = &pod.spec.tolerations;
    assert_eq!(tolerations.len(), 2);
    assert_eq!(tolerations[0].key, "key1");
    assert_eq!(tolerations[0].operator, TolerationOperator::Equal);
    assert_eq!(tolerations[0].value, "value1");
    assert_eq!(tolerations[0].effect, TaintEffect::NoSchedule);
    assert_eq!(tolerations[1].key, "key2");
    assert_eq!(tolerations[1].operator, TolerationOperator::Exists);
    assert_eq!(tolerations[1].effect, TaintEffect::NoExecute);
}

#[tokio::test]
async fn test_conflicting_write_fails_the_pass() {
    let store = cluster().await;
    let im = seed(&store, NODE_1, InstanceManagerType::Engine, NODE_1, Stopped, None).await;
    store.inject_status_conflicts(1).await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));

    let err = ctrl.reconcile(im.name()).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(!err.is_gating());

    // The retry reads the new version and converges on the Pod already created.
    ctrl.reconcile(im.name()).await.unwrap();
    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Starting);
    assert_eq!(store.write_counts().await.pod_creates, 1);
}

#[tokio::test]
async fn test_repeated_pod_failures_warn_of_crash_loop() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Running,
        Some(PodPhase::Failed),
    )
    .await;
    let mut settings = ControllerSettings::new(NODE_1);
    settings.crash_loop_threshold = 1;
    let ctrl = controller_with(&store, settings, Arc::new(IdleWatcher));

    // Fail, recreate, fail again.
    ctrl.reconcile(im.name()).await.unwrap();
    assert!(store.pod(im.name()).await.is_none());
    ctrl.reconcile(im.name()).await.unwrap();
    assert!(store.pod(im.name()).await.is_some());
    store
        .set_pod_status(im.name(), PodPhase::Failed, "")
        .await
        .unwrap();
    ctrl.reconcile(im.name()).await.unwrap();

    let events = store.events().await;
    let count = |reason: &str| {
        events
            .iter()
            .filter(|e| e.reason == reason)
            .map(|e| e.count)
            .sum::<u32>()
    };
    assert_eq!(count("PodFailed"), 2);
    assert_eq!(count("CrashLoop"), 1);

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Starting);
}

#[tokio::test]
async fn test_pod_address_change_restarts_monitor() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Replica,
        NODE_1,
        Running,
        Some(PodPhase::Running),
    )
    .await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));
    ctrl.reconcile(im.name()).await.unwrap();
    assert_eq!(ctrl.monitor().session_ip(im.name()).await.as_deref(), Some(POD_IP));

    store
        .set_pod_status(im.name(), PodPhase::Running, "10.42.0.8")
        .await
        .unwrap();
    ctrl.reconcile(im.name()).await.unwrap();

    let stored = store.instance_manager(im.name()).await.unwrap();
    assert_eq!(stored.status.current_state, Running);
    assert_eq!(stored.status.ip, "10.42.0.8");
    assert_eq!(
        ctrl.monitor().session_ip(im.name()).await.as_deref(),
        Some("10.42.0.8")
    );
}

#[tokio::test]
async fn test_orphan_pods_are_removed_by_responsible_replica() {
    let store = cluster().await;
    let kept = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Starting,
        Some(PodPhase::Pending),
    )
    .await;

    let pod_manager = PodManager::new(store.clone(), harness::pod_template());
    let orphan = InstanceManager::new(NAMESPACE, NODE_1, IMAGE, InstanceManagerType::Replica);
    store
        .create_pod(pod_manager.build_pod(&orphan, Vec::new()))
        .await
        .unwrap();

    let other = controller(&store, NODE_2, Arc::new(IdleWatcher));
    assert_eq!(other.cleanup_orphan_pods().await.unwrap(), 0);

    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));
    assert_eq!(ctrl.cleanup_orphan_pods().await.unwrap(), 1);

    let remaining = pods(&store).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name(), kept.name());
}

#[tokio::test]
async fn test_controller_id_must_name_a_node() {
    let store = cluster().await;

    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));
    assert!(ctrl.is_registered_node().await.unwrap());

    let stray = controller(&store, "keel-im-controller-7d9f", Arc::new(IdleWatcher));
    assert!(!stray.is_registered_node().await.unwrap());
}

#[tokio::test]
async fn test_shutdown_stops_sessions() {
    let store = cluster().await;
    let im = seed(
        &store,
        NODE_1,
        InstanceManagerType::Engine,
        NODE_1,
        Starting,
        Some(PodPhase::Running),
    )
    .await;
    let ctrl = controller(&store, NODE_1, Arc::new(IdleWatcher));
    ctrl.reconcile(im.name()).await.unwrap();
    assert_eq!(ctrl.monitor().session_count().await, 1);

    ctrl.shutdown(Duration::from_secs(1)).await;
    assert_eq!(ctrl.monitor().session_count().await, 0);
}
