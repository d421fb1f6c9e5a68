//! Pod management for instance managers.
//!
//! Each instance manager is hosted by exactly one Pod, named after the
//! resource and pinned to its node. The Pod runs the engine image with the
//! process-manager binary matching the resource type.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::store::{ResourceStore, StoreResult};
use crate::types::{
    Container, InstanceManager, ObjectMeta, Pod, PodPhase, PodSpec, Toleration, LABEL_COMPONENT,
    COMPONENT_INSTANCE_MANAGER,
};

/// Pod settings shared by every instance manager.
#[derive(Debug, Clone)]
pub struct PodTemplate {
    pub namespace: String,
    pub service_account: String,
    pub process_manager_port: u16,
    /// Time a terminating Pod may linger before it is force-deleted.
    pub termination_grace: Duration,
}

/// What the controller needs to know about an instance manager's Pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub phase: PodPhase,
    pub ip: Option<String>,
    pub terminating: bool,
    /// The Pod was created by this call.
    pub created: bool,
}

impl PodObservation {
    fn from_pod(pod: &Pod, created: bool) -> Self {
        Self {
            phase: pod.status.phase,
            ip: pod.running_ip().map(str::to_string),
            terminating: pod.is_terminating(),
            created,
        }
    }
}

/// Creates, observes and deletes instance-manager Pods.
pub struct PodManager {
    store: Arc<dyn ResourceStore>,
    template: PodTemplate,
}

impl PodManager {
    pub fn new(store: Arc<dyn ResourceStore>, template: PodTemplate) -> Self {
        Self { store, template }
    }

    /// Build the Pod for `im`.
    pub fn build_pod(&self, im: &InstanceManager, tolerations: Vec<Toleration>) -> Pod {
        let binary = im.spec.im_type.manager_binary();
        let port = self.template.process_manager_port;

        let mut metadata = ObjectMeta::new(im.name(), &self.template.namespace);
        metadata.labels = InstanceManager::labels(&im.spec.node_id, &im.spec.image, im.spec.im_type);

        Pod {
            metadata,
            spec: PodSpec {
                node_name: im.spec.node_id.clone(),
                service_account_name: self.template.service_account.clone(),
                tolerations,
                containers: vec![Container {
                    name: binary.to_string(),
                    image: im.spec.image.clone(),
                    command: vec![binary.to_string()],
                    args: vec!["--listen".to_string(), format!("0.0.0.0:{port}")],
                    ports: vec![port],
                    privileged: true,
                }],
                restart_policy: "Never".to_string(),
            },
            status: Default::default(),
        }
    }

    /// Observe the Pod for `im`, creating it when absent.
    ///
    /// A Pod stuck terminating past the grace period is force-deleted and
    /// reported as terminating.
    #[instrument(skip(self, im, tolerations), fields(instance_manager = %im.name()))]
    pub async fn ensure_pod(
        &self,
        im: &InstanceManager,
        tolerations: Vec<Toleration>,
    ) -> StoreResult<PodObservation> {
        match self.store.get_pod(im.name()).await {
            Ok(pod) => {
                if pod.is_terminating() && self.termination_overdue(&pod) {
                    warn!(pod = %pod.name(), "Pod stuck terminating, forcing deletion");
                    self.force_delete(pod.name()).await?;
                }
                Ok(PodObservation::from_pod(&pod, false))
            }
            Err(e) if e.is_not_found() => {
                let pod = self.build_pod(im, tolerations);
                match self.store.create_pod(pod).await {
                    Ok(created) => {
                        info!(
                            pod = %created.name(),
                            node = %created.spec.node_name,
                            image = %im.spec.image,
                            "Created instance manager pod"
                        );
                        Ok(PodObservation::from_pod(&created, true))
                    }
                    // Raced with another writer; treat as created and look again next pass.
                    Err(e) if e.is_already_exists() => {
                        debug!("Pod already exists");
                        Ok(PodObservation {
                            phase: PodPhase::Pending,
                            ip: None,
                            terminating: false,
                            created: false,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the named Pod. Returns whether a Pod was still present.
    pub async fn delete_pod(&self, name: &str) -> StoreResult<bool> {
        let pod = match self.store.get_pod(name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        if pod.is_terminating() {
            if self.termination_overdue(&pod) {
                self.force_delete(name).await?;
            }
            return Ok(true);
        }

        match self.store.delete_pod(name, false).await {
            Ok(()) => {
                info!(pod = %name, "Deleted instance manager pod");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every Pod labelled as an instance-manager Pod.
    pub async fn list_managed(&self) -> StoreResult<Vec<Pod>> {
        let selector = BTreeMap::from([(
            LABEL_COMPONENT.to_string(),
            COMPONENT_INSTANCE_MANAGER.to_string(),
        )]);
        self.store.list_pods(&selector).await
    }

    fn termination_overdue(&self, pod: &Pod) -> bool {
        let Some(since) = pod.metadata.deletion_timestamp else {
            return false;
        };
        let grace = TimeDelta::from_std(self.template.termination_grace).unwrap_or(TimeDelta::MAX);
        Utc::now().signed_duration_since(since) > grace
    }

    async fn force_delete(&self, name: &str) -> StoreResult<()> {
        match self.store.delete_pod(name, true).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
