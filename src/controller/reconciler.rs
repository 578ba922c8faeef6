//! Main reconciler for load balancer services
//!
//! Implements the controller pattern using kube-rs runtime. Each pass
//! converges the cloud side of one `Service` and reports its frontend
//! addresses back in `status.loadBalancer`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Namespace, Node, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::finalizers::{self, LOAD_BALANCER_CLEANUP_FINALIZER};
use super::orchestrator::LoadBalancerReconciler;
use super::service;
use crate::cloud::client::ClusterLister;
use crate::error::{Error, Result};

const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const FOLLOWER_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub reconciler: Arc<LoadBalancerReconciler>,
    pub is_leader: Arc<AtomicBool>,
    pub field_manager: String,
}

/// Cluster snapshots read straight from the API server.
pub struct KubeClusterLister {
    client: Client,
}

impl KubeClusterLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterLister for KubeClusterLister {
    async fn list_load_balancer_services(&self) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::all(self.client.clone());
        let services = api.list(&ListParams::default()).await?;
        Ok(services
            .items
            .into_iter()
            .filter(service::is_load_balancer_service)
            .collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api
            .get_opt(namespace)
            .await?
            .and_then(|ns| ns.metadata.labels)
            .unwrap_or_default())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let services: Api<Service> = Api::all(state.client.clone());

    info!("Starting load balancer service controller");

    Controller::new(services, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    state.reconciler.shutdown();
    Ok(())
}

/// The main reconciliation function
///
/// Services that are not of type LoadBalancer are ignored unless they still
/// carry the cleanup finalizer, in which case their resources are released.
#[instrument(skip(ctx), fields(service = %format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())))]
async fn reconcile(obj: Arc<Service>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("not the leader, skipping");
        return Ok(Action::requeue(FOLLOWER_RETRY_INTERVAL));
    }

    let wants_lb = service::is_load_balancer_service(&obj);
    let has_finalizer = finalizers::has_cleanup_finalizer(&obj);
    if !wants_lb && !has_finalizer {
        return Ok(Action::await_change());
    }
    if !wants_lb && obj.metadata.deletion_timestamp.is_none() {
        info!("service is no longer a load balancer, releasing its resources");
        ctx.reconciler.ensure_load_balancer_deleted(&obj).await?;
        finalizers::release_service(&ctx.client, &obj, &ctx.field_manager).await?;
        return Ok(Action::await_change());
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, LOAD_BALANCER_CLEANUP_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(svc) => apply_service(&ctx, &svc).await,
            FinalizerEvent::Cleanup(svc) => cleanup_service(&ctx, &svc).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn apply_service(ctx: &ControllerState, svc: &Service) -> Result<Action> {
    let nodes = ctx.reconciler.context().lister.list_nodes().await?;
    let status = ctx.reconciler.ensure_load_balancer(svc, &nodes).await?;
    if svc.status.as_ref().and_then(|s| s.load_balancer.as_ref()) != Some(&status) {
        update_status(ctx, svc, &status).await?;
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn cleanup_service(ctx: &ControllerState, svc: &Service) -> Result<Action> {
    ctx.reconciler.ensure_load_balancer_deleted(svc).await?;
    Ok(Action::await_change())
}

/// Patch `status.loadBalancer` of the service
async fn update_status(
    ctx: &ControllerState,
    svc: &Service,
    status: &LoadBalancerStatus,
) -> Result<()> {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    let patch = serde_json::json!({ "status": { "loadBalancer": status } });
    api.patch_status(
        &svc.name_any(),
        &PatchParams::apply(&ctx.field_manager),
        &Patch::Merge(&patch),
    )
    .await?;
    debug!(ingress = ?status.ingress, "service status updated");
    Ok(())
}

/// Requeue delay after a failed pass.
pub fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", svc.name_any(), error);
    Action::requeue(retry_delay(error))
}
