//! Controller module for load balancer services
//! This module contains the reconcilers for every cloud resource a service
//! touches, their composition, and the kube-rs controller loop driving them.

pub mod annotations;
pub mod backend_pool;
pub mod context;
pub mod events;
mod finalizers;
#[cfg(test)]
mod fixtures;
pub mod frontend;
pub mod loadbalancer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod naming;
#[cfg(test)]
mod naming_test;
pub mod orchestrator;
#[cfg(test)]
mod orchestrator_test;
pub mod placement;
#[cfg(test)]
mod placement_test;
pub mod private_link;
#[cfg(test)]
mod private_link_test;
pub mod public_ip;
#[cfg(test)]
mod public_ip_test;
mod reconciler;
pub mod routes;
pub mod rule_diff;
pub mod rules;
#[cfg(test)]
mod rules_test;
pub mod security_group;
pub mod selection;
#[cfg(test)]
mod selection_test;
pub mod selector;
pub mod service;

pub use context::ReconcileContext;
pub use finalizers::LOAD_BALANCER_CLEANUP_FINALIZER;
pub use orchestrator::LoadBalancerReconciler;
pub use reconciler::{retry_delay, run_controller, ControllerState, KubeClusterLister};
pub use routes::{NodeRoute, RouteOperation};
