use std::{sync::Arc, time::Duration};

use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;

use crate::{operator::Diagnostics, scope::ScopeCache, Error, Metrics, Result};

pub mod actuator;
pub mod controller;
pub mod credentials;
pub mod deletion_guard;
pub mod dependency;
pub mod finalizers;
pub mod progress;
pub mod status;
pub mod store;

pub mod domain;
pub mod flavor;
pub mod image;
mod image_content;
pub mod keypair;
pub mod network;
pub mod port;
pub mod project;
pub mod router;
pub mod router_interface;
pub mod security_group;
pub mod server;
pub mod subnet;
mod tags;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

/// State shared by every controller
#[derive(Clone)]
pub struct Context {
    /// Access to orchestrator objects
    pub orc: store::OrcClient,

    /// Authenticated OpenStack sessions, keyed by credentials
    pub scopes: Arc<ScopeCache>,

    /// Deletion guard over the credentials secrets of every controller
    pub credentials: credentials::CredentialsGuard,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// How often to poll OpenStack for changes nothing will notify us about
    pub poll_period: Duration,
}

/// Namespace and name of a namespaced object
pub fn object_key<K: Resource>(object: &K) -> Result<(String, String)> {
    match (object.meta().namespace.clone(), object.meta().name.clone()) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(Error::MissingObjectKey(object.name_any())),
    }
}
