//! Top-level load balancer operations for one service.
//!
//! Every service-level operation runs under one per-cluster lock since load
//! balancers, security groups and public IPs are shared between services and
//! are rewritten as a whole.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use super::context::ReconcileContext;
use super::naming;
use super::routes::{NodeRoute, RouteOperation, RouteTableUpdater};
use super::selection::ServiceFrontendStatus;
use super::service;
use crate::cloud::cache::CacheReadType;
use crate::error::{Error, Result};

/// Kubernetes status for the service's frontend addresses.
pub fn load_balancer_status(status: &ServiceFrontendStatus) -> LoadBalancerStatus {
    let ingress = status
        .ingress
        .iter()
        .map(|ip| LoadBalancerIngress {
            ip: Some(ip.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();
    LoadBalancerStatus {
        ingress: (!ingress.is_empty()).then_some(ingress),
    }
}

#[cfg(feature = "metrics")]
fn record<T>(operation: &str, start: Instant, result: &Result<T>) {
    super::metrics::observe_reconcile_duration_seconds(operation, start.elapsed().as_secs_f64());
    if let Err(e) = result {
        super::metrics::inc_reconcile_error(operation, e.kind());
    }
}

#[cfg(not(feature = "metrics"))]
fn record<T>(_operation: &str, _start: Instant, _result: &Result<T>) {}

pub struct LoadBalancerReconciler {
    ctx: Arc<ReconcileContext>,
    lock: Mutex<()>,
    routes: RouteTableUpdater,
}

impl LoadBalancerReconciler {
    /// Build the reconciler and start its route updater.
    pub fn new(ctx: Arc<ReconcileContext>) -> (Self, JoinHandle<()>) {
        let (routes, worker) = RouteTableUpdater::spawn(ctx.clone());
        (
            Self {
                ctx,
                lock: Mutex::new(()),
                routes,
            },
            worker,
        )
    }

    pub fn context(&self) -> &Arc<ReconcileContext> {
        &self.ctx
    }

    /// Stop background work. Queued route operations are aborted.
    pub fn shutdown(&self) {
        self.routes.stop();
    }

    /// Current status of the service's load balancer and whether it exists.
    /// A service exists when its frontend or its desired public IP does.
    #[instrument(skip(self, svc), fields(service = %service::service_name(svc)))]
    pub async fn get_load_balancer(
        &self,
        svc: &Service,
    ) -> Result<(Option<LoadBalancerStatus>, bool)> {
        let found = self
            .ctx
            .get_service_load_balancer(svc, &[], false, Vec::new())
            .await?;
        if found.exists {
            return Ok((found.status.as_ref().map(load_balancer_status), true));
        }
        let exists_pip = self.desired_public_ip_exists(svc).await?;
        debug!(exists_pip, "load balancer frontend not found");
        Ok((None, exists_pip))
    }

    async fn desired_public_ip_exists(&self, svc: &Service) -> Result<bool> {
        if service::requires_internal_load_balancer(svc) {
            return Ok(false);
        }
        let rg = service::public_ip_resource_group(svc, &self.ctx.config);
        for ipv6 in service::ipv6_flags(svc) {
            let name = match self.ctx.determine_public_ip_name(svc, ipv6).await {
                Ok((name, _)) => name,
                Err(Error::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if self
                .ctx
                .store
                .get_public_ip(&rg, &name, CacheReadType::Default)
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create or update everything the service needs. Idempotent.
    #[instrument(skip(self, svc, nodes), fields(service = %service::service_name(svc), nodes = nodes.len()))]
    pub async fn ensure_load_balancer(
        &self,
        svc: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        let _guard = self.lock.lock().await;
        let start = Instant::now();
        let result = self.reconcile_service(svc, nodes).await;
        record("ensure", start, &result);
        let status = result?;
        info!(ingress = ?status.ingress.as_ref().map(Vec::len), "load balancer ensured");
        Ok(status)
    }

    /// Refresh backend membership of a service that already has a load
    /// balancer. A service that is gone or no longer eligible is a no-op.
    #[instrument(skip(self, svc, nodes), fields(service = %service::service_name(svc), nodes = nodes.len()))]
    pub async fn update_load_balancer(&self, svc: &Service, nodes: &[Node]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let start = Instant::now();
        let result = self.update_service(svc, nodes).await;
        record("update", start, &result);
        result
    }

    async fn update_service(&self, svc: &Service, nodes: &[Node]) -> Result<()> {
        let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");
        let name = svc.metadata.name.as_deref().unwrap_or_default();
        let Some(latest) = self.ctx.lister.get_service(namespace, name).await? else {
            debug!("service no longer exists, skipping update");
            return Ok(());
        };
        if latest.metadata.deletion_timestamp.is_some()
            || !service::is_load_balancer_service(&latest)
        {
            debug!("service is being deleted or is not a load balancer, skipping update");
            return Ok(());
        }
        let found = self
            .ctx
            .get_service_load_balancer(&latest, nodes, false, Vec::new())
            .await?;
        if !found.exists {
            debug!("service has no load balancer yet, skipping update");
            return Ok(());
        }
        self.reconcile_service(&latest, nodes).await.map(|_| ())
    }

    async fn reconcile_service(&self, svc: &Service, nodes: &[Node]) -> Result<LoadBalancerStatus> {
        let svc_name = service::service_name(svc);
        self.ctx.update_node_caches(nodes);

        let lb = self
            .ctx
            .reconcile_load_balancer(svc, Some(nodes), true)
            .await?;
        let status = self
            .ctx
            .service_load_balancer_status(svc, &lb)
            .await?
            .ok_or_else(|| Error::not_found("FrontendIPConfiguration", &svc_name))?;

        self.ctx
            .reconcile_security_group(svc, &status.primary_ips, Some(&lb.name), true)
            .await?;
        for fip in &status.frontends {
            self.ctx
                .reconcile_private_link_service(svc, fip, true)
                .await?;
        }

        let updated = service::with_load_balancer_ips(svc, &status.primary_ips);
        let flipped = service::flip_internal(&updated);
        self.ctx
            .reconcile_load_balancer(&flipped, None, false)
            .await?;
        self.ctx
            .reconcile_public_ips(&updated, Some(&lb.name), true)
            .await?;
        Ok(load_balancer_status(&status))
    }

    /// Remove everything the service owns. Succeeds when nothing is left.
    #[instrument(skip(self, svc), fields(service = %service::service_name(svc)))]
    pub async fn ensure_load_balancer_deleted(&self, svc: &Service) -> Result<()> {
        let _guard = self.lock.lock().await;
        let start = Instant::now();
        let result = self.delete_service(svc).await;
        record("delete", start, &result);
        result?;
        info!("load balancer resources of service deleted");
        Ok(())
    }

    async fn delete_service(&self, svc: &Service) -> Result<()> {
        let found = self
            .ctx
            .get_service_load_balancer(svc, &[], false, Vec::new())
            .await?;
        let ips = found
            .status
            .map(|s| s.primary_ips)
            .unwrap_or_default();
        self.ctx
            .reconcile_security_group(svc, &ips, Some(&found.lb.name), false)
            .await?;

        self.ctx.reconcile_load_balancer(svc, None, false).await?;
        let flipped = service::flip_internal(svc);
        self.ctx
            .reconcile_load_balancer(&flipped, None, false)
            .await?;
        self.ctx.reconcile_public_ips(svc, None, false).await?;
        Ok(())
    }

    /// Route traffic for `cidr` to the node. Resolves once the batch holding
    /// the operation is written.
    #[instrument(skip(self))]
    pub async fn create_route(&self, node_name: &str, cidr: &str, next_hop_ip: &str) -> Result<()> {
        let route = self.ctx.node_route(node_name, cidr, next_hop_ip);
        self.routes
            .submit(RouteOperation::Create(route))?
            .wait()
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_route(&self, node_name: &str, cidr: &str) -> Result<()> {
        let name = naming::route_name(node_name, cidr, self.ctx.config.ipv6_dual_stack_enabled);
        self.routes
            .submit(RouteOperation::Delete { name })?
            .wait()
            .await
    }

    pub async fn list_routes(&self) -> Result<Vec<NodeRoute>> {
        self.ctx.list_routes().await
    }
}
