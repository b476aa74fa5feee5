#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use intent_policy_controller_core as core;
pub use intent_policy_controller_k8s_api as k8s;
pub use intent_policy_controller_k8s_cluster as cluster;

mod args;
pub mod classify;
pub mod enforce;
mod error;
pub mod generate;
pub mod intent;
pub mod metrics;
pub mod prompt;
pub mod queue;
pub mod reconcile;
pub mod resource;
pub mod validation;
pub mod watch;

#[cfg(test)]
mod test_util;

pub use self::{args::Args, error::Error};

use std::sync::Arc;

pub type SharedCluster = Arc<dyn cluster::Cluster>;
