//! keel instance-manager controller daemon.
//!
//! Runs one controller replica. The replica identity is the name of the node
//! it runs on; it reconciles the instance managers of the nodes it is
//! responsible for and watches their process managers over gRPC.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use keel_im_controller::config::Config;
use keel_im_controller::types::{
    EngineImage, EngineImageState, InstanceManager, InstanceManagerType, Node, Setting,
    SETTING_TAINT_TOLERATION,
};
use keel_im_controller::{
    ControllerSettings, ControllerWorker, GrpcProcessWatcher, InstanceManagerController, MemoryStore,
    MonitorSettings, PodManager, PodTemplate, ProcessMonitor, WorkerSettings,
};
use keel_reconcile::BackoffPolicy;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    // RUST_LOG wins over KEEL_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        controller_id = %config.controller_id,
        namespace = %config.namespace,
        workers = config.workers,
        process_manager_port = config.process_manager_port,
        "Starting keel instance-manager controller"
    );

    let store = Arc::new(MemoryStore::new(&config.namespace));
    store
        .put_node(Node::healthy(&config.namespace, &config.controller_id, Utc::now()))
        .await;
    store.set_controller_replicas([config.controller_id.clone()]).await;
    store
        .put_setting(Setting::new(&config.namespace, SETTING_TAINT_TOLERATION, ""))
        .await;

    if let Some(image) = &config.engine_image {
        store
            .put_engine_image(EngineImage::new(&config.namespace, image, EngineImageState::Ready))
            .await;
        for im_type in [InstanceManagerType::Engine, InstanceManagerType::Replica] {
            let im = InstanceManager::new(&config.namespace, &config.controller_id, image, im_type);
            let im = store
                .create_instance_manager(im)
                .await
                .context("failed to register instance manager")?;
            info!(instance_manager = %im.name(), im_type = %im_type, image = %image, "Registered instance manager");
        }
    }

    let watcher = Arc::new(GrpcProcessWatcher::default());
    let monitor = ProcessMonitor::new(
        store.clone(),
        watcher,
        MonitorSettings {
            port: config.process_manager_port,
            connect_attempts: config.monitor_connect_attempts,
            conflict_retries: config.monitor_conflict_retries,
            ..Default::default()
        },
    );

    let pods = PodManager::new(
        store.clone(),
        PodTemplate {
            namespace: config.namespace.clone(),
            service_account: config.service_account.clone(),
            process_manager_port: config.process_manager_port,
            termination_grace: config.pod_termination_grace,
        },
    );

    let mut settings = ControllerSettings::new(&config.controller_id);
    settings.node_down_grace = config.node_down_grace;
    let controller = Arc::new(InstanceManagerController::new(
        settings,
        store.clone(),
        pods,
        monitor,
    ));

    let worker = ControllerWorker::new(
        controller,
        WorkerSettings {
            workers: config.workers,
            resync_interval: config.resync_interval,
            shutdown_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for controller to shut down...");
    match tokio::time::timeout(Duration::from_secs(30), worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Controller task panicked"),
        Err(_) => error!("Timed out waiting for controller shutdown"),
    }

    info!("Instance-manager controller shutdown complete");
    Ok(())
}
