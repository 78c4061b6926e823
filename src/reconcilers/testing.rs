//! Fixtures for engine tests: an in-memory cloud and actuators over it

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use tokio::sync::RwLock;

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    progress::{Outcome, ReconcileStatus, WaitingOn},
    store::{fake::FakeObjectStore, OrcClient},
    tags, Context,
};
use crate::{
    operator::Diagnostics,
    osclients,
    resources::{
        CloudCredentialsReference, Network, NetworkFilter, NetworkResourceSpec, NetworkResourceStatus, NetworkSpec,
        NetworkStatus, OrcObject, Subnet, SubnetFilter, SubnetResourceSpec, SubnetResourceStatus, SubnetSpec,
        CONDITION_AVAILABLE,
    },
    scope::ScopeCache,
    Metrics,
};

pub use super::subnet::NETWORK_DEPENDENCY as SUBNET_NETWORK;

/// A resource in the in-memory cloud
#[derive(Clone, Debug, PartialEq)]
pub struct FakeResource {
    pub id: String,
    pub kind: &'static str,
    pub name: String,
    pub tags: Vec<String>,
    pub parent: Option<String>,
}

#[derive(Default)]
struct CloudState {
    resources: BTreeMap<String, FakeResource>,
    calls: Vec<String>,
    create_failures: Vec<osclients::Error>,
}

/// An in-memory cloud recording every mutating call
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    fn lock(&self) -> std::sync::MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a resource out of band, returning its id
    pub fn add(&self, kind: &'static str, name: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().resources.insert(
            id.clone(),
            FakeResource {
                id: id.clone(),
                kind,
                name: name.to_string(),
                tags: Vec::new(),
                parent: None,
            },
        );
        id
    }

    pub fn resource(&self, id: &str) -> Option<FakeResource> {
        self.lock().resources.get(id).cloned()
    }

    /// Delete a resource out of band
    pub fn remove(&self, id: &str) {
        self.lock().resources.remove(id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn fail_next_create(&self, error: osclients::Error) {
        self.lock().create_failures.push(error);
    }

    fn list(&self, kind: &str, name: Option<&str>) -> ResourceStream<FakeResource> {
        let found: Vec<_> = self
            .lock()
            .resources
            .values()
            .filter(|r| r.kind == kind && name.map_or(true, |n| r.name == n))
            .cloned()
            .collect();
        stream::iter(found.into_iter().map(Ok)).boxed()
    }

    fn create(&self, kind: &'static str, name: &str, tags: &[String], parent: Option<String>) -> osclients::Result<FakeResource> {
        let mut state = self.lock();
        state.calls.push(format!("create {kind} {name}"));
        if !state.create_failures.is_empty() {
            return Err(state.create_failures.remove(0));
        }
        let resource = FakeResource {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            name: name.to_string(),
            tags: tags::normalize(tags),
            parent,
        };
        state.resources.insert(resource.id.clone(), resource.clone());
        Ok(resource)
    }

    fn delete(&self, id: &str) -> osclients::Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("delete {id}"));
        match state.resources.remove(id) {
            Some(_) => Ok(()),
            None => Err(osclients::Error::Http {
                status: http::StatusCode::NOT_FOUND,
                message: format!("{id} not found"),
            }),
        }
    }

    fn set_tags(&self, id: &str, tags: &[String]) {
        let mut state = self.lock();
        state.calls.push(format!("tags {id}"));
        if let Some(resource) = state.resources.get_mut(id) {
            resource.tags = tags::normalize(tags);
        }
    }
}

/// Engine context over a fake object store
pub struct TestContext {
    pub store: Arc<FakeObjectStore>,
    pub cloud: FakeCloud,
    pub ctx: Context,
}

impl TestContext {
    pub fn new() -> Self {
        let store = Arc::new(FakeObjectStore::new());
        let metrics = Metrics::default();
        let ctx = Context {
            orc: OrcClient::new(store.clone()),
            scopes: Arc::new(ScopeCache::new(NonZeroUsize::MIN, metrics.clone())),
            credentials: Default::default(),
            metrics,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            poll_period: Duration::from_secs(15),
        };
        Self {
            store,
            cloud: FakeCloud::default(),
            ctx,
        }
    }
}

pub fn credentials() -> CloudCredentialsReference {
    CloudCredentialsReference {
        secret_name: "openstack-clouds".into(),
        cloud_name: "openstack".into(),
    }
}

/// A managed network creating an OpenStack network called `resource_name`
pub fn network(name: &str, resource_name: &str) -> Network {
    let mut network = Network::new(
        name,
        NetworkSpec {
            resource: Some(NetworkResourceSpec {
                name: Some(resource_name.into()),
                ..Default::default()
            }),
            cloud_credentials_ref: credentials(),
            ..Default::default()
        },
    );
    network.metadata.namespace = Some("default".into());
    network
}

/// A network already reconciled to `Available`
pub fn available_network(name: &str, resource_name: &str) -> Network {
    let mut network = network(name, resource_name);
    network.status = Some(NetworkStatus {
        id: Some(uuid::Uuid::new_v4().to_string()),
        conditions: vec![Condition {
            type_: CONDITION_AVAILABLE.into(),
            status: "True".into(),
            reason: "Success".into(),
            message: "OpenStack resource is available".into(),
            observed_generation: Some(1),
            last_transition_time: Time(Utc::now()),
        }],
        ..Default::default()
    });
    network
}

/// A managed subnet on the network called `network_ref`
pub fn subnet(name: &str, network_ref: &str) -> Subnet {
    let mut subnet = Subnet::new(
        name,
        SubnetSpec {
            network_ref: network_ref.into(),
            resource: Some(SubnetResourceSpec {
                cidr: "10.0.0.0/24".into(),
                ..Default::default()
            }),
            cloud_credentials_ref: credentials(),
            ..Default::default()
        },
    );
    subnet.metadata.namespace = Some("default".into());
    subnet
}

fn resource_name<K: OrcObject>(object: &K, name: Option<&String>) -> String {
    name.cloned().unwrap_or_else(|| object.name_any())
}

pub struct FakeNetworkActuator {
    cloud: FakeCloud,
}

fn reconcile_fake_tags<'a>(
    actuator: &'a FakeNetworkActuator,
    object: &'a Network,
    resource: &'a FakeResource,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = object.spec.resource.as_ref().map(|r| r.tags.as_slice()).unwrap_or_default();
        if !tags::differ(desired, &resource.tags) {
            return ReconcileStatus::new();
        }
        actuator.cloud.set_tags(&resource.id, desired);
        ReconcileStatus::new().needs_refresh()
    }
    .boxed()
}

#[async_trait]
impl Actuator<Network> for FakeNetworkActuator {
    type OsResource = FakeResource;

    fn resource_id(resource: &FakeResource) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &FakeResource) -> NetworkResourceStatus {
        NetworkResourceStatus {
            name: resource.name.clone(),
            tags: resource.tags.clone(),
            status: "ACTIVE".into(),
            ..Default::default()
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<FakeResource>> {
        Ok(self.cloud.resource(id).filter(|r| r.kind == "network"))
    }

    fn list_for_adoption(&self, object: &Network) -> Option<ResourceStream<FakeResource>> {
        let spec = object.spec.resource.as_ref()?;
        Some(self.cloud.list("network", Some(&resource_name(object, spec.name.as_ref()))))
    }

    fn list_for_import(&self, _object: &Network, filter: &NetworkFilter) -> ResourceStream<FakeResource> {
        self.cloud.list("network", filter.name.as_deref())
    }

    async fn create(&self, object: &Network) -> Outcome<FakeResource> {
        let spec = object.spec.resource.clone().unwrap_or_default();
        self.cloud
            .create("network", &resource_name(object, spec.name.as_ref()), &spec.tags, None)
            .map_err(request_failed)
    }

    async fn delete(&self, _object: &Network, resource: &FakeResource) -> ReconcileStatus {
        delete_result(self.cloud.delete(&resource.id))
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Network>> {
        vec![reconcile_fake_tags]
    }
}

/// Builds network actuators over a fake cloud, without credentials
pub struct FakeNetworkFactory {
    cloud: FakeCloud,
}

impl FakeNetworkFactory {
    pub fn new(cloud: &FakeCloud) -> Self {
        Self { cloud: cloud.clone() }
    }
}

#[async_trait]
impl ActuatorFactory<Network> for FakeNetworkFactory {
    type Actuator = FakeNetworkActuator;

    const CONTROLLER_NAME: &'static str = "network";

    async fn create_actuator(&self, _ctx: &Context, _object: &Network) -> Outcome<FakeNetworkActuator> {
        Ok(FakeNetworkActuator {
            cloud: self.cloud.clone(),
        })
    }

    async fn delete_actuator(&self, ctx: &Context, object: &Network) -> Outcome<FakeNetworkActuator> {
        self.create_actuator(ctx, object).await
    }
}

pub struct FakeSubnetActuator {
    cloud: FakeCloud,
    network_id: Option<String>,
}

#[async_trait]
impl Actuator<Subnet> for FakeSubnetActuator {
    type OsResource = FakeResource;

    fn resource_id(resource: &FakeResource) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &FakeResource) -> SubnetResourceStatus {
        SubnetResourceStatus {
            name: resource.name.clone(),
            network_id: resource.parent.clone().unwrap_or_default(),
            cidr: "10.0.0.0/24".into(),
            ..Default::default()
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<FakeResource>> {
        Ok(self.cloud.resource(id).filter(|r| r.kind == "subnet"))
    }

    fn list_for_adoption(&self, object: &Subnet) -> Option<ResourceStream<FakeResource>> {
        let spec = object.spec.resource.as_ref()?;
        Some(self.cloud.list("subnet", Some(&resource_name(object, spec.name.as_ref()))))
    }

    fn list_for_import(&self, _object: &Subnet, filter: &SubnetFilter) -> ResourceStream<FakeResource> {
        self.cloud.list("subnet", filter.name.as_deref())
    }

    async fn create(&self, object: &Subnet) -> Outcome<FakeResource> {
        let Some(network_id) = self.network_id.clone() else {
            return Err(ReconcileStatus::new().waiting_on_object("Network", &object.spec.network_ref, WaitingOn::Ready));
        };
        let spec = object.spec.resource.clone().unwrap_or_default();
        self.cloud
            .create("subnet", &resource_name(object, spec.name.as_ref()), &spec.tags, Some(network_id))
            .map_err(request_failed)
    }

    async fn delete(&self, _object: &Subnet, resource: &FakeResource) -> ReconcileStatus {
        delete_result(self.cloud.delete(&resource.id))
    }
}

/// Builds subnet actuators over a fake cloud, resolving the network dependency
pub struct FakeSubnetFactory {
    cloud: FakeCloud,
}

impl FakeSubnetFactory {
    pub fn new(cloud: &FakeCloud) -> Self {
        Self { cloud: cloud.clone() }
    }
}

#[async_trait]
impl ActuatorFactory<Subnet> for FakeSubnetFactory {
    type Actuator = FakeSubnetActuator;

    const CONTROLLER_NAME: &'static str = "subnet";

    async fn create_actuator(&self, ctx: &Context, object: &Subnet) -> Outcome<FakeSubnetActuator> {
        let networks = SUBNET_NETWORK.get_guarded_dependencies(&ctx.orc, object).await?;
        let network_id = networks
            .get(&object.spec.network_ref)
            .and_then(|n| n.status_id())
            .map(str::to_string);
        Ok(FakeSubnetActuator {
            cloud: self.cloud.clone(),
            network_id,
        })
    }

    async fn delete_actuator(&self, _ctx: &Context, _object: &Subnet) -> Outcome<FakeSubnetActuator> {
        Ok(FakeSubnetActuator {
            cloud: self.cloud.clone(),
            network_id: None,
        })
    }
}
