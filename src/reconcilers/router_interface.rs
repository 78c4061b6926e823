//! Router interfaces attach a subnet to a router
//!
//! The OpenStack resource is the router port neutron creates on the subnet,
//! so `status.id` holds a port id. The router is guarded. The subnet is only
//! followed, because a subnet removes its own interface before it is deleted.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use kube::Client;
use tracing::info;

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    dependency::{is_available, Dependency},
    object_key,
    progress::{Outcome, ReconcileStatus},
    Context,
};
use crate::{
    osclients::{self, NetworkingClient},
    resources::{OrcObject, Router, RouterInterface, RouterInterfaceResourceStatus, Subnet},
};

pub const CONTROLLER_NAME: &str = "routerinterface";

fn router_refs(interface: &RouterInterface) -> Vec<String> {
    vec![interface.spec.router_ref.clone()]
}

fn subnet_refs(interface: &RouterInterface) -> Vec<String> {
    interface.spec.subnet_ref.iter().cloned().collect()
}

pub const ROUTER_DEPENDENCY: Dependency<RouterInterface, Router> =
    Dependency::new(CONTROLLER_NAME, "router", router_refs, is_available);

pub const SUBNET_DEPENDENCY: Dependency<RouterInterface, Subnet> =
    Dependency::new(CONTROLLER_NAME, "subnet", subnet_refs, is_available);

/// Router and subnet ids, known only once both are available
pub struct Attachment {
    router_id: String,
    subnet_id: String,
}

pub struct RouterInterfaceActuator {
    client: NetworkingClient,
    attachment: Option<Attachment>,
}

impl RouterInterfaceActuator {
    pub fn new(client: NetworkingClient, attachment: Option<Attachment>) -> Self {
        Self { client, attachment }
    }
}

fn subnet_id(port: &osclients::Port) -> Option<&str> {
    port.fixed_ips.first().map(|ip| ip.subnet_id.as_str())
}

#[async_trait]
impl Actuator<RouterInterface> for RouterInterfaceActuator {
    type OsResource = osclients::Port;

    fn resource_id(port: &osclients::Port) -> &str {
        &port.id
    }

    fn resource_status(&self, port: &osclients::Port) -> RouterInterfaceResourceStatus {
        RouterInterfaceResourceStatus {
            status: port.status.clone(),
            router_id: port.device_id.clone(),
            subnet_id: subnet_id(port).unwrap_or_default().to_string(),
            ip_addresses: port.fixed_ips.iter().filter_map(|ip| ip.ip_address.clone()).collect(),
        }
    }

    fn is_available(&self, port: &osclients::Port) -> bool {
        port.status == "ACTIVE"
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Port>> {
        self.client.get_port(id).await
    }

    /// The router port on the subnet, if the interface was added before its id was recorded
    fn list_for_adoption(&self, _interface: &RouterInterface) -> Option<ResourceStream<osclients::Port>> {
        let attachment = self.attachment.as_ref()?;
        Some(self.client.list_ports(&[
            ("device_id".into(), attachment.router_id.clone()),
            ("fixed_ips".into(), format!("subnet_id={}", attachment.subnet_id)),
        ]))
    }

    fn list_for_import(&self, _interface: &RouterInterface, _filter: &()) -> ResourceStream<osclients::Port> {
        stream::empty().boxed()
    }

    async fn create(&self, interface: &RouterInterface) -> Outcome<osclients::Port> {
        let Some(attachment) = &self.attachment else {
            return Err(ReconcileStatus::new().waiting_on_object(
                "Router",
                &interface.spec.router_ref,
                super::progress::WaitingOn::Ready,
            ));
        };
        info!(router = %attachment.router_id, subnet = %attachment.subnet_id, "adding router interface");
        let info = self
            .client
            .add_router_interface(&attachment.router_id, &attachment.subnet_id)
            .await
            .map_err(request_failed)?;
        match self.client.get_port(&info.port_id).await? {
            Some(port) => Ok(port),
            None => Err(osclients::Error::Http {
                status: http::StatusCode::NOT_FOUND,
                message: format!("router port {} not found after adding interface", info.port_id),
            }
            .into()),
        }
    }

    async fn delete(&self, _interface: &RouterInterface, port: &osclients::Port) -> ReconcileStatus {
        let Some(subnet_id) = subnet_id(port) else {
            return delete_result(self.client.delete_port(&port.id).await);
        };
        delete_result(self.client.remove_router_interface(&port.device_id, subnet_id).await)
    }
}

pub struct RouterInterfaceFactory;

#[async_trait]
impl ActuatorFactory<RouterInterface> for RouterInterfaceFactory {
    type Actuator = RouterInterfaceActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, interface: &RouterInterface) -> Outcome<RouterInterfaceActuator> {
        let (namespace, _) = object_key(interface)?;
        let router = ROUTER_DEPENDENCY
            .get_dependency(&ctx.orc, &namespace, &interface.spec.router_ref)
            .await;
        let subnet = match &interface.spec.subnet_ref {
            Some(subnet_ref) => SUBNET_DEPENDENCY.get_dependency(&ctx.orc, &namespace, subnet_ref).await,
            None => Err(crate::Error::invalid_configuration("subnetRef is required for interfaces of type Subnet").into()),
        };
        let (router, subnet) = match (router, subnet) {
            (Ok(router), Ok(subnet)) => (router, subnet),
            (router, subnet) => {
                let waiting = [router.err(), subnet.err()]
                    .into_iter()
                    .flatten()
                    .fold(ReconcileStatus::new(), ReconcileStatus::merge);
                return Err(waiting);
            }
        };
        ROUTER_DEPENDENCY.ensure_guard(&ctx.orc, &router).await?;

        let attachment = match (router.status_id(), subnet.status_id()) {
            (Some(router_id), Some(subnet_id)) => Some(Attachment {
                router_id: router_id.to_string(),
                subnet_id: subnet_id.to_string(),
            }),
            _ => None,
        };
        let scope = credentials::scope(ctx, CONTROLLER_NAME, interface).await?;
        Ok(RouterInterfaceActuator::new(scope.networking()?, attachment))
    }

    async fn delete_actuator(&self, ctx: &Context, interface: &RouterInterface) -> Outcome<RouterInterfaceActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, interface).await?;
        Ok(RouterInterfaceActuator::new(scope.networking()?, None))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<RouterInterface>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .depends_on(ROUTER_DEPENDENCY)
        .follows(SUBNET_DEPENDENCY)
        .run(RouterInterfaceFactory)
        .await
}
