use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, ResourceExt};

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    progress::{Outcome, ReconcileStatus},
    tags::{normalize, reconcile_neutron_tags},
    Context,
};
use crate::{
    osclients::{self, NetworkCreateOpts, NetworkingClient},
    resources::{NeutronStatusMetadata, Network, NetworkFilter, NetworkResourceStatus},
};

pub const CONTROLLER_NAME: &str = "network";

/// Name of the OpenStack network for `network`
pub fn resource_name(network: &Network) -> String {
    network
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| network.name_any())
}

fn filter_query(filter: &NetworkFilter) -> Vec<(String, String)> {
    let mut query = filter.tags.query();
    if let Some(name) = &filter.name {
        query.push(("name".into(), name.clone()));
    }
    if let Some(description) = &filter.description {
        query.push(("description".into(), description.clone()));
    }
    if let Some(external) = filter.external {
        query.push(("router:external".into(), external.to_string()));
    }
    if let Some(project_id) = &filter.project_id {
        query.push(("project_id".into(), project_id.clone()));
    }
    query
}

pub struct NetworkActuator {
    client: NetworkingClient,
}

impl NetworkActuator {
    pub fn new(client: NetworkingClient) -> Self {
        Self { client }
    }
}

fn reconcile_tags<'a>(
    actuator: &'a NetworkActuator,
    network: &'a Network,
    resource: &'a osclients::Network,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = network.spec.resource.as_ref().map(|r| r.tags.as_slice()).unwrap_or_default();
        reconcile_neutron_tags(&actuator.client, "networks", &resource.id, desired, &resource.tags).await
    }
    .boxed()
}

#[async_trait]
impl Actuator<Network> for NetworkActuator {
    type OsResource = osclients::Network;

    fn resource_id(resource: &osclients::Network) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Network) -> NetworkResourceStatus {
        NetworkResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            project_id: resource.project_id.clone(),
            status: resource.status.clone(),
            tags: normalize(&resource.tags),
            admin_state_up: resource.admin_state_up,
            availability_zone_hints: resource.availability_zone_hints.clone(),
            dns_domain: resource.dns_domain.clone().unwrap_or_default(),
            mtu: resource.mtu,
            port_security_enabled: resource.port_security_enabled,
            external: resource.external,
            shared: resource.shared,
            subnets: resource.subnets.clone(),
            metadata: NeutronStatusMetadata {
                created_at: resource.created_at.clone(),
                updated_at: resource.updated_at.clone(),
                revision_number: resource.revision_number,
            },
        }
    }

    fn is_available(&self, resource: &osclients::Network) -> bool {
        resource.status == "ACTIVE"
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Network>> {
        self.client.get_network(id).await
    }

    fn list_for_adoption(&self, network: &Network) -> Option<ResourceStream<osclients::Network>> {
        network.spec.resource.as_ref()?;
        Some(self.client.list_networks(&[("name".into(), resource_name(network))]))
    }

    fn list_for_import(&self, _network: &Network, filter: &NetworkFilter) -> ResourceStream<osclients::Network> {
        self.client.list_networks(&filter_query(filter))
    }

    async fn create(&self, network: &Network) -> Outcome<osclients::Network> {
        let spec = network.spec.resource.clone().unwrap_or_default();
        let opts = NetworkCreateOpts {
            name: Some(resource_name(network)),
            description: spec.description,
            admin_state_up: spec.admin_state_up,
            dns_domain: spec.dns_domain,
            mtu: spec.mtu,
            port_security_enabled: spec.port_security_enabled,
            external: spec.external,
            shared: spec.shared,
            availability_zone_hints: spec.availability_zone_hints,
        };
        self.client.create_network(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _network: &Network, resource: &osclients::Network) -> ReconcileStatus {
        delete_result(self.client.delete_network(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Network>> {
        vec![reconcile_tags]
    }
}

pub struct NetworkFactory;

#[async_trait]
impl ActuatorFactory<Network> for NetworkFactory {
    type Actuator = NetworkActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, network: &Network) -> Outcome<NetworkActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, network).await?;
        Ok(NetworkActuator::new(scope.networking()?))
    }

    async fn delete_actuator(&self, ctx: &Context, network: &Network) -> Outcome<NetworkActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, network).await?;
        Ok(NetworkActuator::new(scope.networking()?))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Network>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(NetworkFactory)
        .await
}
