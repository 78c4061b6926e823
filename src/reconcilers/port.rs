use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, ResourceExt};

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    dependency::{is_available, Dependency},
    progress::{Outcome, ReconcileStatus, WaitingOn},
    tags::{normalize, reconcile_neutron_tags},
    Context,
};
use crate::{
    osclients::{self, AddressPair, FixedIp, NetworkingClient, PortCreateOpts},
    resources::{
        AllowedAddressPair, FixedIpStatus, Network, NeutronStatusMetadata, OrcObject, Port, PortFilter,
        PortResourceStatus, SecurityGroup, Subnet,
    },
};

pub const CONTROLLER_NAME: &str = "port";

fn network_refs(port: &Port) -> Vec<String> {
    vec![port.spec.network_ref.clone()]
}

fn subnet_refs(port: &Port) -> Vec<String> {
    port.spec
        .resource
        .iter()
        .flat_map(|r| r.addresses.iter().map(|a| a.subnet_ref.clone()))
        .collect()
}

fn security_group_refs(port: &Port) -> Vec<String> {
    port.spec
        .resource
        .iter()
        .flat_map(|r| r.security_group_refs.iter().cloned())
        .collect()
}

pub const NETWORK_DEPENDENCY: Dependency<Port, Network> =
    Dependency::new(CONTROLLER_NAME, "network", network_refs, is_available);

pub const SUBNET_DEPENDENCY: Dependency<Port, Subnet> =
    Dependency::new(CONTROLLER_NAME, "subnet", subnet_refs, is_available);

pub const SECURITY_GROUP_DEPENDENCY: Dependency<Port, SecurityGroup> =
    Dependency::new(CONTROLLER_NAME, "securitygroup", security_group_refs, is_available);

fn resource_name(port: &Port) -> String {
    port.spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| port.name_any())
}

fn filter_query(filter: &PortFilter, network_id: Option<&str>) -> Vec<(String, String)> {
    let mut query = filter.tags.query();
    let fields = [
        ("name", filter.name.clone()),
        ("description", filter.description.clone()),
        ("project_id", filter.project_id.clone()),
        ("network_id", network_id.map(str::to_string)),
    ];
    query.extend(
        fields
            .into_iter()
            .filter_map(|(key, value)| Some((key.to_string(), value?))),
    );
    query
}

/// OpenStack ids of the objects a port references, resolved by name
#[derive(Default)]
pub struct PortReferences {
    network_id: Option<String>,
    subnet_ids: BTreeMap<String, String>,
    security_group_ids: BTreeMap<String, String>,
}

fn ids<K: OrcObject>(objects: BTreeMap<String, K>) -> BTreeMap<String, String> {
    objects
        .into_iter()
        .filter_map(|(name, object)| Some((name, object.status_id()?.to_string())))
        .collect()
}

pub struct PortActuator {
    client: NetworkingClient,
    references: PortReferences,
}

impl PortActuator {
    pub fn new(client: NetworkingClient, references: PortReferences) -> Self {
        Self { client, references }
    }

    fn create_opts(&self, port: &Port, network_id: String) -> PortCreateOpts {
        let spec = port.spec.resource.clone().unwrap_or_default();
        let fixed_ips = spec
            .addresses
            .iter()
            .filter_map(|a| {
                Some(FixedIp {
                    ip_address: a.ip.clone(),
                    subnet_id: self.references.subnet_ids.get(&a.subnet_ref)?.clone(),
                })
            })
            .collect();
        let security_groups = spec
            .security_group_refs
            .iter()
            .filter_map(|name| self.references.security_group_ids.get(name).cloned())
            .collect();
        PortCreateOpts {
            network_id,
            name: Some(resource_name(port)),
            description: spec.description,
            admin_state_up: spec.admin_state_up,
            allowed_address_pairs: spec
                .allowed_address_pairs
                .into_iter()
                .map(|p| AddressPair {
                    ip_address: p.ip,
                    mac_address: p.mac,
                })
                .collect(),
            fixed_ips,
            security_groups: Some(security_groups),
        }
    }
}

fn reconcile_tags<'a>(
    actuator: &'a PortActuator,
    port: &'a Port,
    resource: &'a osclients::Port,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = port.spec.resource.as_ref().map(|r| r.tags.as_slice()).unwrap_or_default();
        reconcile_neutron_tags(&actuator.client, "ports", &resource.id, desired, &resource.tags).await
    }
    .boxed()
}

#[async_trait]
impl Actuator<Port> for PortActuator {
    type OsResource = osclients::Port;

    fn resource_id(resource: &osclients::Port) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Port) -> PortResourceStatus {
        PortResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            network_id: resource.network_id.clone(),
            project_id: resource.project_id.clone(),
            status: resource.status.clone(),
            tags: normalize(&resource.tags),
            admin_state_up: resource.admin_state_up,
            mac_address: resource.mac_address.clone(),
            device_id: resource.device_id.clone(),
            device_owner: resource.device_owner.clone(),
            allowed_address_pairs: resource
                .allowed_address_pairs
                .iter()
                .map(|p| AllowedAddressPair {
                    ip: p.ip_address.clone(),
                    mac: p.mac_address.clone(),
                })
                .collect(),
            fixed_ips: resource
                .fixed_ips
                .iter()
                .map(|ip| FixedIpStatus {
                    ip: ip.ip_address.clone().unwrap_or_default(),
                    subnet_id: ip.subnet_id.clone(),
                })
                .collect(),
            security_groups: resource.security_groups.clone(),
            metadata: NeutronStatusMetadata {
                created_at: resource.created_at.clone(),
                updated_at: resource.updated_at.clone(),
                revision_number: resource.revision_number,
            },
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Port>> {
        self.client.get_port(id).await
    }

    fn list_for_adoption(&self, port: &Port) -> Option<ResourceStream<osclients::Port>> {
        port.spec.resource.as_ref()?;
        let mut query = vec![("name".to_string(), resource_name(port))];
        if let Some(network_id) = &self.references.network_id {
            query.push(("network_id".into(), network_id.clone()));
        }
        Some(self.client.list_ports(&query))
    }

    fn list_for_import(&self, _port: &Port, filter: &PortFilter) -> ResourceStream<osclients::Port> {
        self.client
            .list_ports(&filter_query(filter, self.references.network_id.as_deref()))
    }

    async fn create(&self, port: &Port) -> Outcome<osclients::Port> {
        let Some(network_id) = self.references.network_id.clone() else {
            return Err(ReconcileStatus::new().waiting_on_object("Network", &port.spec.network_ref, WaitingOn::Ready));
        };
        let opts = self.create_opts(port, network_id);
        self.client.create_port(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _port: &Port, resource: &osclients::Port) -> ReconcileStatus {
        delete_result(self.client.delete_port(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Port>> {
        vec![reconcile_tags]
    }
}

pub struct PortFactory;

#[async_trait]
impl ActuatorFactory<Port> for PortFactory {
    type Actuator = PortActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, port: &Port) -> Outcome<PortActuator> {
        let networks = NETWORK_DEPENDENCY.get_guarded_dependencies(&ctx.orc, port).await;
        let subnets = SUBNET_DEPENDENCY.get_guarded_dependencies(&ctx.orc, port).await;
        let groups = SECURITY_GROUP_DEPENDENCY.get_guarded_dependencies(&ctx.orc, port).await;
        let scope = credentials::scope(ctx, CONTROLLER_NAME, port).await;
        let (networks, subnets, groups, scope) = match (networks, subnets, groups, scope) {
            (Ok(n), Ok(s), Ok(g), Ok(c)) => (n, s, g, c),
            (n, s, g, c) => {
                let waiting = [n.err(), s.err(), g.err(), c.err()]
                    .into_iter()
                    .flatten()
                    .fold(ReconcileStatus::new(), ReconcileStatus::merge);
                return Err(waiting);
            }
        };
        let references = PortReferences {
            network_id: ids(networks).remove(&port.spec.network_ref),
            subnet_ids: ids(subnets),
            security_group_ids: ids(groups),
        };
        Ok(PortActuator::new(scope.networking()?, references))
    }

    async fn delete_actuator(&self, ctx: &Context, port: &Port) -> Outcome<PortActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, port).await?;
        Ok(PortActuator::new(scope.networking()?, PortReferences::default()))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Port>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .depends_on(NETWORK_DEPENDENCY)
        .depends_on(SUBNET_DEPENDENCY)
        .depends_on(SECURITY_GROUP_DEPENDENCY)
        .run(PortFactory)
        .await
}
