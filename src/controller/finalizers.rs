//! Finalizer handling for load balancer services.
//!
//! The kube-rs `finalizer` helper covers deletion. A service that stops being
//! of type LoadBalancer is never deleted, so its finalizer is dropped here once
//! its cloud resources are gone.

use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::error::Result;

/// Finalizer protecting services whose cloud resources still exist.
pub const LOAD_BALANCER_CLEANUP_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

pub fn has_cleanup_finalizer(svc: &Service) -> bool {
    svc.finalizers()
        .iter()
        .any(|f| f == LOAD_BALANCER_CLEANUP_FINALIZER)
}

/// Finalizers of `svc` without the cleanup finalizer.
pub fn without_cleanup_finalizer(svc: &Service) -> Vec<String> {
    svc.finalizers()
        .iter()
        .filter(|f| f.as_str() != LOAD_BALANCER_CLEANUP_FINALIZER)
        .cloned()
        .collect()
}

/// Remove the cleanup finalizer and clear the reported load balancer status.
pub async fn release_service(client: &Client, svc: &Service, field_manager: &str) -> Result<()> {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    let status = json!({ "status": { "loadBalancer": {} } });
    api.patch_status(
        &svc.name_any(),
        &PatchParams::apply(field_manager),
        &Patch::Merge(&status),
    )
    .await?;

    let patch = json!({
        "metadata": {
            "finalizers": without_cleanup_finalizer(svc)
        }
    });
    api.patch(
        &svc.name_any(),
        &PatchParams::apply(field_manager),
        &Patch::Merge(&patch),
    )
    .await?;
    info!(service = %svc.name_any(), "removed load balancer cleanup finalizer");
    Ok(())
}
