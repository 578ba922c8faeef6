//! azure-lb-reconciler: service-to-network reconciliation for Azure-style
//! cloud load balancers
//!
//! This crate converges the load balancers, public IPs, security rules,
//! private link services and routes a Kubernetes `LoadBalancer` service needs,
//! against a cloud reached through the traits in [`cloud::client`].

pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::CloudConfig;
pub use crate::error::{Error, Result};
