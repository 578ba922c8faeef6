//! Batched route table updates.
//!
//! Route writes are collected on a bounded queue and applied by a single
//! worker once per interval: one read and one write of the route table per
//! batch. Every submitter gets a handle that resolves when its batch lands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::ReconcileContext;
use super::naming;
use crate::cloud::cache::CacheReadType;
use crate::cloud::types::{Route, RouteTable};
use crate::error::{Error, Result};

pub const NEXT_HOP_TYPE_VIRTUAL_APPLIANCE: &str = "VirtualAppliance";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOperation {
    Create(Route),
    Delete { name: String },
}

impl RouteOperation {
    fn route_name(&self) -> &str {
        match self {
            RouteOperation::Create(route) => &route.name,
            RouteOperation::Delete { name } => name,
        }
    }
}

struct RouteRequest {
    op: RouteOperation,
    done: oneshot::Sender<Result<()>>,
}

/// Completion of one queued route operation.
#[derive(Debug)]
pub struct RouteHandle(oneshot::Receiver<Result<()>>);

impl RouteHandle {
    pub async fn wait(self) -> Result<()> {
        self.0.await.unwrap_or_else(|_| {
            Err(Error::BatchAborted(
                "route updater stopped before the operation was applied".to_string(),
            ))
        })
    }
}

/// A route of the cluster route table, keyed by the node it serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRoute {
    pub name: String,
    pub target_node: String,
    pub destination_cidr: String,
    pub next_hop_ip: Option<String>,
}

pub struct RouteTableUpdater {
    queue: mpsc::Sender<RouteRequest>,
    shutdown: watch::Sender<bool>,
}

impl RouteTableUpdater {
    /// Start the worker. The returned task ends after [`RouteTableUpdater::stop`].
    pub fn spawn(ctx: Arc<ReconcileContext>) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::channel(ctx.config.route_queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let interval = Duration::from_secs(ctx.config.route_update_interval_seconds.max(1));
        let worker = tokio::spawn(run(ctx, rx, shutdown_rx, interval));
        (Self { queue, shutdown }, worker)
    }

    /// Queue an operation. A full queue is reported as a retriable error.
    pub fn submit(&self, op: RouteOperation) -> Result<RouteHandle> {
        let (done, handle) = oneshot::channel();
        match self.queue.try_send(RouteRequest { op, done }) {
            Ok(()) => Ok(RouteHandle(handle)),
            Err(mpsc::error::TrySendError::Full(req)) => Err(Error::Cloud {
                status: 429,
                message: format!("route queue is full, cannot queue {}", req.op.route_name()),
                retriable: true,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::BatchAborted(
                "route updater is stopped".to_string(),
            )),
        }
    }

    /// Stop the worker. Operations not yet written resolve to `BatchAborted`.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run(
    ctx: Arc<ReconcileContext>,
    mut rx: mpsc::Receiver<RouteRequest>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending: Vec<RouteRequest> = Vec::new();
    info!(interval_seconds = interval.as_secs(), "route updater started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                while let Ok(req) = rx.try_recv() {
                    pending.push(req);
                }
                if pending.is_empty() {
                    continue;
                }
                pending = apply_batch(&ctx, std::mem::take(&mut pending)).await;
            }
        }
    }
    if !pending.is_empty() {
        warn!(pending = pending.len(), "route updater stopped with pending operations");
    }
    info!("route updater stopped");
}

/// Apply one batch. Returns the requests to retry on the next tick.
async fn apply_batch(ctx: &ReconcileContext, batch: Vec<RouteRequest>) -> Vec<RouteRequest> {
    debug!(operations = batch.len(), "applying route batch");
    #[cfg(feature = "metrics")]
    super::metrics::observe_route_batch_size(batch.len());

    let table = match ctx.store.get_route_table(CacheReadType::ForceRefresh).await {
        Ok(table) => table,
        Err(e) => return settle(batch, e),
    };
    let creates = batch
        .iter()
        .any(|r| matches!(r.op, RouteOperation::Create(_)));
    let mut table = match table {
        Some(table) => table,
        None if creates => {
            info!(route_table = %ctx.config.route_table_name, "creating route table");
            RouteTable {
                name: ctx.config.route_table_name.clone(),
                location: Some(ctx.config.location.clone()),
                ..Default::default()
            }
        }
        None => {
            debug!("route table does not exist, nothing to delete");
            for req in batch {
                let _ = req.done.send(Ok(()));
            }
            return Vec::new();
        }
    };

    let mut changed = false;
    for req in &batch {
        changed |= apply_operation(&mut table, &req.op);
    }
    if !changed {
        for req in batch {
            let _ = req.done.send(Ok(()));
        }
        return Vec::new();
    }

    match ctx.store.create_or_update_route_table(&table).await {
        Ok(()) => {
            info!(routes = table.routes.len(), operations = batch.len(), "route table updated");
            for req in batch {
                let _ = req.done.send(Ok(()));
            }
            Vec::new()
        }
        Err(e) => settle(batch, e),
    }
}

/// Resolve a failed batch. Stale etags are retried, everything else fails.
fn settle(batch: Vec<RouteRequest>, e: Error) -> Vec<RouteRequest> {
    match &e {
        Error::PreconditionFailed { .. } | Error::Conflict { .. } => {
            warn!(error = %e, operations = batch.len(), "route table changed underneath, retrying batch");
            batch
        }
        Error::NotFound { kind, name } => {
            warn!(error = %e, "route table write failed");
            for req in batch {
                let _ = req.done.send(Err(Error::Cloud {
                    status: 404,
                    message: format!("{kind} {name:?} not found"),
                    retriable: false,
                }));
            }
            Vec::new()
        }
        _ => {
            warn!(error = %e, "route table write failed");
            let retriable = e.is_retriable();
            let message = e.to_string();
            for req in batch {
                let _ = req.done.send(Err(Error::Cloud {
                    status: 0,
                    message: message.clone(),
                    retriable,
                }));
            }
            Vec::new()
        }
    }
}

/// Apply one operation to the table in memory. Returns whether it changed.
pub fn apply_operation(table: &mut RouteTable, op: &RouteOperation) -> bool {
    match op {
        RouteOperation::Create(route) => {
            match table
                .routes
                .iter_mut()
                .find(|r| r.name.eq_ignore_ascii_case(&route.name))
            {
                Some(existing) if existing == route => false,
                Some(existing) => {
                    *existing = route.clone();
                    true
                }
                None => {
                    table.routes.push(route.clone());
                    true
                }
            }
        }
        RouteOperation::Delete { name } => {
            let before = table.routes.len();
            table.routes.retain(|r| !r.name.eq_ignore_ascii_case(name));
            table.routes.len() != before
        }
    }
}

impl ReconcileContext {
    pub fn node_route(&self, node_name: &str, cidr: &str, next_hop_ip: &str) -> Route {
        Route {
            name: naming::route_name(node_name, cidr, self.config.ipv6_dual_stack_enabled),
            address_prefix: cidr.to_string(),
            next_hop_type: NEXT_HOP_TYPE_VIRTUAL_APPLIANCE.to_string(),
            next_hop_ip_address: Some(next_hop_ip.to_string()),
        }
    }

    pub async fn list_routes(&self) -> Result<Vec<NodeRoute>> {
        let Some(table) = self.store.get_route_table(CacheReadType::Default).await? else {
            return Ok(Vec::new());
        };
        Ok(table
            .routes
            .into_iter()
            .map(|r| NodeRoute {
                target_node: naming::node_name_from_route(&r.name).to_string(),
                name: r.name,
                destination_cidr: r.address_prefix,
                next_hop_ip: r.next_hop_ip_address,
            })
            .collect())
    }
}
