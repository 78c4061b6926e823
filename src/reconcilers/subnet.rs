use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::info;

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    dependency::{is_available, Dependency},
    finalizers::{field_owner, Transaction},
    progress::{outcome_status, Outcome, ReconcileStatus, WaitingOn},
    store::{ApplyPatch, OrcClient},
    tags::{normalize, reconcile_neutron_tags},
    Context,
};
use crate::{
    osclients::{self, NetworkingClient, SubnetCreateOpts},
    resources::{
        AllocationPool, HostRoute, Network, NeutronStatusMetadata, OrcObject, RouterInterface, RouterInterfaceSpec,
        RouterInterfaceType, Subnet, SubnetFilter, SubnetGatewayType, SubnetResourceSpec, SubnetResourceStatus,
    },
    Error,
};

pub const CONTROLLER_NAME: &str = "subnet";

fn network_refs(subnet: &Subnet) -> Vec<String> {
    vec![subnet.spec.network_ref.clone()]
}

/// Every subnet references the network it is created on
pub const NETWORK_DEPENDENCY: Dependency<Subnet, Network> =
    Dependency::new(CONTROLLER_NAME, "network", network_refs, is_available);

pub fn resource_name(subnet: &Subnet) -> String {
    subnet
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| subnet.name_any())
}

/// Name of the RouterInterface created for a subnet with a `routerRef`
pub fn router_interface_name(subnet: &Subnet) -> String {
    format!("{}-subnet", subnet.name_any())
}

fn ip_version(resource: &SubnetResourceSpec) -> i32 {
    match resource.ip_version {
        Some(version) => version.into(),
        None if resource.cidr.contains(':') => 6,
        None => 4,
    }
}

fn create_opts(resource: &SubnetResourceSpec, name: String, network_id: String) -> crate::Result<SubnetCreateOpts> {
    let gateway_ip = match &resource.gateway {
        None => None,
        Some(gateway) => match gateway.type_ {
            SubnetGatewayType::Automatic => None,
            SubnetGatewayType::None => Some(None),
            SubnetGatewayType::IP => match &gateway.ip {
                Some(ip) => Some(Some(ip.clone())),
                None => return Err(Error::invalid_configuration("gateway type IP requires gateway.ip")),
            },
        },
    };
    Ok(SubnetCreateOpts {
        network_id,
        ip_version: ip_version(resource),
        cidr: resource.cidr.clone(),
        name: Some(name),
        description: resource.description.clone(),
        gateway_ip,
        enable_dhcp: resource.enable_dhcp,
        dns_nameservers: resource.dns_nameservers.clone(),
        allocation_pools: resource
            .allocation_pools
            .iter()
            .map(|p| osclients::AllocationPool {
                start: p.start.clone(),
                end: p.end.clone(),
            })
            .collect(),
        host_routes: resource
            .host_routes
            .iter()
            .map(|r| osclients::HostRoute {
                destination: r.destination.clone(),
                nexthop: r.next_hop.clone(),
            })
            .collect(),
    })
}

fn filter_query(filter: &SubnetFilter, network_id: Option<&str>) -> Vec<(String, String)> {
    let mut query = filter.tags.query();
    let fields = [
        ("name", filter.name.clone()),
        ("description", filter.description.clone()),
        ("ip_version", filter.ip_version.map(|v| v.to_string())),
        ("cidr", filter.cidr.clone()),
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

pub struct SubnetActuator {
    client: NetworkingClient,
    orc: OrcClient,
    /// Resolved only when creating or updating
    network_id: Option<String>,
}

impl SubnetActuator {
    pub fn new(client: NetworkingClient, orc: OrcClient, network_id: Option<String>) -> Self {
        Self {
            client,
            orc,
            network_id,
        }
    }

    async fn router_interface(&self, subnet: &Subnet) -> crate::Result<Option<RouterInterface>> {
        let namespace = subnet.namespace().unwrap_or_default();
        self.orc.get(&namespace, &router_interface_name(subnet)).await
    }

    /// Delete `interface` unless that is already in progress, and wait for it to go
    async fn remove_router_interface(&self, interface: &RouterInterface) -> ReconcileStatus {
        let name = interface.name_any();
        if interface.meta().deletion_timestamp.is_none() {
            info!(%name, "deleting router interface");
            let namespace = interface.namespace().unwrap_or_default();
            if let Err(e) = self.orc.delete::<RouterInterface>(&namespace, &name).await {
                return ReconcileStatus::new().with_error(e);
            }
        }
        ReconcileStatus::new().waiting_on_object("RouterInterface", name, WaitingOn::Deletion)
    }

    async fn create_router_interface(&self, subnet: &Subnet, router_ref: &str) -> crate::Result<()> {
        let name = router_interface_name(subnet);
        let namespace = subnet.namespace().unwrap_or_default();
        let spec = RouterInterfaceSpec {
            type_: RouterInterfaceType::Subnet,
            router_ref: router_ref.to_string(),
            subnet_ref: Some(subnet.name_any()),
            cloud_credentials_ref: subnet.spec.cloud_credentials_ref.clone(),
        };
        let body = json!({
            "apiVersion": RouterInterface::api_version(&()),
            "kind": RouterInterface::kind(&()),
            "metadata": {
                "name": name,
                "namespace": namespace,
                "ownerReferences": subnet.controller_owner_ref(&()).into_iter().collect::<Vec<_>>(),
            },
            "spec": serde_json::to_value(spec)?,
        });
        info!(%name, router = router_ref, "creating router interface");
        self.orc
            .apply::<RouterInterface>(
                &namespace,
                &name,
                ApplyPatch::main(field_owner(CONTROLLER_NAME, Transaction::Attachment), body),
            )
            .await
    }
}

/// Whether `subnet` is the controlling owner of `interface`
fn owned_by(interface: &RouterInterface, subnet: &Subnet) -> bool {
    let Some(uid) = subnet.uid() else {
        return false;
    };
    interface
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

fn interface_matches(interface: &RouterInterface, subnet: &Subnet, router_ref: &str) -> bool {
    interface.spec.type_ == RouterInterfaceType::Subnet
        && interface.spec.subnet_ref.as_deref() == Some(subnet.name_any().as_str())
        && interface.spec.router_ref == router_ref
}

fn reconcile_tags<'a>(
    actuator: &'a SubnetActuator,
    subnet: &'a Subnet,
    resource: &'a osclients::Subnet,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = subnet.spec.resource.as_ref().map(|r| r.tags.as_slice()).unwrap_or_default();
        reconcile_neutron_tags(&actuator.client, "subnets", &resource.id, desired, &resource.tags).await
    }
    .boxed()
}

/// Keep the owned RouterInterface in line with `routerRef`
fn ensure_router_interface<'a>(
    actuator: &'a SubnetActuator,
    subnet: &'a Subnet,
    _resource: &'a osclients::Subnet,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let router_ref = subnet.spec.resource.as_ref().and_then(|r| r.router_ref.as_deref());
        let existing = match actuator.router_interface(subnet).await {
            Ok(existing) => existing,
            Err(e) => return ReconcileStatus::new().with_error(e),
        };
        match (existing, router_ref) {
            (None, None) => ReconcileStatus::new(),
            (Some(interface), None) if !owned_by(&interface, subnet) => ReconcileStatus::new(),
            (Some(interface), Some(_)) if !owned_by(&interface, subnet) => {
                ReconcileStatus::new().with_error(Error::invalid_configuration(format!(
                    "RouterInterface {} already exists and is not owned by this subnet",
                    interface.name_any()
                )))
            }
            (Some(interface), Some(router)) if interface_matches(&interface, subnet, router) => {
                ReconcileStatus::new()
            }
            (Some(interface), _) => actuator.remove_router_interface(&interface).await,
            (None, Some(router)) => match actuator.create_router_interface(subnet, router).await {
                Ok(()) => ReconcileStatus::new().waiting_on_object(
                    "RouterInterface",
                    router_interface_name(subnet),
                    WaitingOn::Ready,
                ),
                Err(e) => ReconcileStatus::new().with_error(e),
            },
        }
    }
    .boxed()
}

#[async_trait]
impl Actuator<Subnet> for SubnetActuator {
    type OsResource = osclients::Subnet;

    fn resource_id(resource: &osclients::Subnet) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Subnet) -> SubnetResourceStatus {
        SubnetResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            network_id: resource.network_id.clone(),
            project_id: resource.project_id.clone(),
            ip_version: u8::try_from(resource.ip_version).unwrap_or_default(),
            cidr: resource.cidr.clone(),
            gateway_ip: resource.gateway_ip.clone(),
            enable_dhcp: resource.enable_dhcp,
            dns_nameservers: resource.dns_nameservers.clone(),
            allocation_pools: resource
                .allocation_pools
                .iter()
                .map(|p| AllocationPool {
                    start: p.start.clone(),
                    end: p.end.clone(),
                })
                .collect(),
            host_routes: resource
                .host_routes
                .iter()
                .map(|r| HostRoute {
                    destination: r.destination.clone(),
                    next_hop: r.nexthop.clone(),
                })
                .collect(),
            tags: normalize(&resource.tags),
            metadata: NeutronStatusMetadata {
                created_at: resource.created_at.clone(),
                updated_at: resource.updated_at.clone(),
                revision_number: resource.revision_number,
            },
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Subnet>> {
        self.client.get_subnet(id).await
    }

    fn list_for_adoption(&self, subnet: &Subnet) -> Option<ResourceStream<osclients::Subnet>> {
        let resource = subnet.spec.resource.as_ref()?;
        let mut query = vec![
            ("name".to_string(), resource_name(subnet)),
            ("cidr".to_string(), resource.cidr.clone()),
        ];
        if let Some(network_id) = &self.network_id {
            query.push(("network_id".into(), network_id.clone()));
        }
        Some(self.client.list_subnets(&query))
    }

    fn list_for_import(&self, _subnet: &Subnet, filter: &SubnetFilter) -> ResourceStream<osclients::Subnet> {
        self.client.list_subnets(&filter_query(filter, self.network_id.as_deref()))
    }

    async fn create(&self, subnet: &Subnet) -> Outcome<osclients::Subnet> {
        let Some(network_id) = self.network_id.clone() else {
            return Err(ReconcileStatus::new().waiting_on_object(
                "Network",
                &subnet.spec.network_ref,
                WaitingOn::Ready,
            ));
        };
        let resource = subnet.spec.resource.clone().unwrap_or_default();
        let opts = create_opts(&resource, resource_name(subnet), network_id)?;
        self.client.create_subnet(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _subnet: &Subnet, resource: &osclients::Subnet) -> ReconcileStatus {
        delete_result(self.client.delete_subnet(&resource.id).await)
    }

    async fn delete_companions(&self, subnet: &Subnet) -> ReconcileStatus {
        match self.router_interface(subnet).await {
            Ok(Some(interface)) if owned_by(&interface, subnet) => self.remove_router_interface(&interface).await,
            Ok(_) => ReconcileStatus::new(),
            Err(e) => ReconcileStatus::new().with_error(e),
        }
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Subnet>> {
        vec![reconcile_tags, ensure_router_interface]
    }
}

pub struct SubnetFactory;

#[async_trait]
impl ActuatorFactory<Subnet> for SubnetFactory {
    type Actuator = SubnetActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, subnet: &Subnet) -> Outcome<SubnetActuator> {
        let networks = NETWORK_DEPENDENCY.get_guarded_dependencies(&ctx.orc, subnet).await;
        let scope = credentials::scope(ctx, CONTROLLER_NAME, subnet).await;
        let (networks, scope) = match (networks, scope) {
            (Ok(networks), Ok(scope)) => (networks, scope),
            (networks, scope) => return Err(outcome_status(networks).merge(outcome_status(scope))),
        };
        let network_id = networks
            .get(&subnet.spec.network_ref)
            .and_then(|n| n.status_id())
            .map(str::to_string);
        Ok(SubnetActuator::new(scope.networking()?, ctx.orc.clone(), network_id))
    }

    async fn delete_actuator(&self, ctx: &Context, subnet: &Subnet) -> Outcome<SubnetActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, subnet).await?;
        Ok(SubnetActuator::new(scope.networking()?, ctx.orc.clone(), None))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Subnet>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .depends_on(NETWORK_DEPENDENCY)
        .owns::<RouterInterface>()
        .run(SubnetFactory)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        osclients::ServiceClient,
        reconcilers::testing::{subnet, TestContext},
        resources::SubnetGateway,
    };

    fn offline_actuator(test: &TestContext) -> SubnetActuator {
        let client = NetworkingClient::new(ServiceClient::new(reqwest::Client::new(), "http://127.0.0.1:9", "t"));
        SubnetActuator::new(client, test.ctx.orc.clone(), Some("net-id".into()))
    }

    fn routed_subnet(router: &str) -> Subnet {
        let mut object = subnet("subnet-a", "net-a");
        if let Some(resource) = object.spec.resource.as_mut() {
            resource.router_ref = Some(router.into());
        }
        object
    }

    #[test]
    fn gateway_modes_map_to_create_opts() {
        let mut resource = SubnetResourceSpec {
            cidr: "fd00::/64".into(),
            ..Default::default()
        };
        let opts = create_opts(&resource, "s".into(), "n".into()).unwrap();
        assert_eq!(opts.ip_version, 6);
        assert_eq!(opts.gateway_ip, None);

        resource.gateway = Some(SubnetGateway {
            type_: SubnetGatewayType::None,
            ip: None,
        });
        let body = serde_json::to_value(create_opts(&resource, "s".into(), "n".into()).unwrap()).unwrap();
        assert_eq!(body["gateway_ip"], serde_json::Value::Null);
        assert!(body.get("gateway_ip").is_some());

        resource.gateway = Some(SubnetGateway {
            type_: SubnetGatewayType::IP,
            ip: None,
        });
        let err = create_opts(&resource, "s".into(), "n".into()).unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn router_ref_creates_an_owned_router_interface() {
        let test = TestContext::new();
        test.store.insert(&routed_subnet("router-a"));
        let object = test.store.object::<Subnet>("default", "subnet-a").unwrap();
        let actuator = offline_actuator(&test);

        let status = ensure_router_interface(&actuator, &object, &Default::default()).await;
        assert_eq!(status.messages(), vec!["waiting for RouterInterface/subnet-a-subnet to be available"]);

        let interface = test
            .store
            .object::<RouterInterface>("default", "subnet-a-subnet")
            .unwrap();
        assert_eq!(interface.spec.router_ref, "router-a");
        assert_eq!(interface.spec.subnet_ref.as_deref(), Some("subnet-a"));
        let owners = interface.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Subnet");
        assert_eq!(owners[0].uid, object.uid().unwrap());

        let status = ensure_router_interface(&actuator, &object, &Default::default()).await;
        assert!(status.is_complete());
    }

    #[tokio::test]
    async fn changed_router_ref_replaces_the_interface() {
        let test = TestContext::new();
        test.store.insert(&routed_subnet("router-a"));
        let object = test.store.object::<Subnet>("default", "subnet-a").unwrap();
        let actuator = offline_actuator(&test);
        ensure_router_interface(&actuator, &object, &Default::default()).await;

        let mut moved = object.clone();
        if let Some(resource) = moved.spec.resource.as_mut() {
            resource.router_ref = Some("router-b".into());
        }
        let status = ensure_router_interface(&actuator, &moved, &Default::default()).await;
        assert_eq!(status.messages(), vec!["waiting for RouterInterface/subnet-a-subnet to be deleted"]);
        assert!(test
            .store
            .object::<RouterInterface>("default", "subnet-a-subnet")
            .is_none());
    }

    #[tokio::test]
    async fn router_interface_is_removed_before_the_subnet() {
        let test = TestContext::new();
        test.store.insert(&routed_subnet("router-a"));
        let object = test.store.object::<Subnet>("default", "subnet-a").unwrap();
        let actuator = offline_actuator(&test);
        ensure_router_interface(&actuator, &object, &Default::default()).await;

        let status = actuator.delete_companions(&object).await;
        assert!(!status.is_complete());
        assert!(actuator.delete_companions(&object).await.is_complete());
    }

    #[tokio::test]
    async fn missing_network_and_credentials_are_reported_together() {
        let test = TestContext::new();
        let status = SubnetFactory
            .create_actuator(&test.ctx, &subnet("subnet-a", "net-a"))
            .await
            .err()
            .unwrap();
        assert_eq!(
            status.messages(),
            vec![
                "waiting for Network/net-a to exist".to_string(),
                "waiting for Secret/openstack-clouds to exist".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn interfaces_owned_by_others_are_left_alone() {
        let test = TestContext::new();
        let mut foreign = RouterInterface::new(
            "subnet-a-subnet",
            RouterInterfaceSpec {
                type_: RouterInterfaceType::Subnet,
                router_ref: "router-a".into(),
                subnet_ref: Some("subnet-a".into()),
                cloud_credentials_ref: crate::reconcilers::testing::credentials(),
            },
        );
        foreign.metadata.namespace = Some("default".into());
        test.store.insert(&foreign);
        test.store.insert(&subnet("subnet-a", "net-a"));
        let unrouted = test.store.object::<Subnet>("default", "subnet-a").unwrap();
        let actuator = offline_actuator(&test);

        assert!(ensure_router_interface(&actuator, &unrouted, &Default::default())
            .await
            .is_complete());
        assert!(actuator.delete_companions(&unrouted).await.is_complete());

        let mut routed = unrouted.clone();
        if let Some(resource) = routed.spec.resource.as_mut() {
            resource.router_ref = Some("router-a".into());
        }
        let status = ensure_router_interface(&actuator, &routed, &Default::default()).await;
        assert!(status.terminal_error().is_some());
        assert!(test
            .store
            .object::<RouterInterface>("default", "subnet-a-subnet")
            .is_some());
    }
}
