use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, ResourceExt};

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    dependency::{is_available, Dependency},
    progress::{Outcome, ReconcileStatus},
    tags::{normalize, reconcile_neutron_tags},
    Context,
};
use crate::{
    osclients::{self, GatewayInfo, NetworkingClient, RouterCreateOpts},
    resources::{ExternalGatewayStatus, Network, NeutronStatusMetadata, OrcObject, Router, RouterFilter, RouterResourceStatus},
    Error,
};

pub const CONTROLLER_NAME: &str = "router";

fn gateway_refs(router: &Router) -> Vec<String> {
    router
        .spec
        .resource
        .iter()
        .flat_map(|r| r.external_gateways.iter().map(|g| g.network_ref.clone()))
        .collect()
}

/// Routers reference the external networks they are a gateway to
pub const GATEWAY_DEPENDENCY: Dependency<Router, Network> =
    Dependency::new(CONTROLLER_NAME, "network", gateway_refs, is_available);

fn resource_name(router: &Router) -> String {
    router
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| router.name_any())
}

fn filter_query(filter: &RouterFilter) -> Vec<(String, String)> {
    let mut query = filter.tags.query();
    let fields = [
        ("name", &filter.name),
        ("description", &filter.description),
        ("project_id", &filter.project_id),
    ];
    query.extend(
        fields
            .into_iter()
            .filter_map(|(key, value)| Some((key.to_string(), value.clone()?))),
    );
    query
}

pub struct RouterActuator {
    client: NetworkingClient,
    /// OpenStack ids of the gateway networks, in spec order
    gateway_network_ids: Vec<String>,
}

impl RouterActuator {
    pub fn new(client: NetworkingClient, gateway_network_ids: Vec<String>) -> Self {
        Self {
            client,
            gateway_network_ids,
        }
    }
}

fn reconcile_tags<'a>(
    actuator: &'a RouterActuator,
    router: &'a Router,
    resource: &'a osclients::Router,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = router.spec.resource.as_ref().map(|r| r.tags.as_slice()).unwrap_or_default();
        reconcile_neutron_tags(&actuator.client, "routers", &resource.id, desired, &resource.tags).await
    }
    .boxed()
}

#[async_trait]
impl Actuator<Router> for RouterActuator {
    type OsResource = osclients::Router;

    fn resource_id(resource: &osclients::Router) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Router) -> RouterResourceStatus {
        RouterResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            project_id: resource.project_id.clone(),
            status: resource.status.clone(),
            tags: normalize(&resource.tags),
            admin_state_up: resource.admin_state_up,
            external_gateways: resource
                .external_gateway_info
                .iter()
                .map(|g| ExternalGatewayStatus {
                    network_id: g.network_id.clone(),
                })
                .collect(),
            availability_zone_hints: resource.availability_zone_hints.clone(),
            metadata: NeutronStatusMetadata {
                created_at: resource.created_at.clone(),
                updated_at: resource.updated_at.clone(),
                revision_number: resource.revision_number,
            },
        }
    }

    fn is_available(&self, resource: &osclients::Router) -> bool {
        resource.status == "ACTIVE"
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Router>> {
        self.client.get_router(id).await
    }

    fn list_for_adoption(&self, router: &Router) -> Option<ResourceStream<osclients::Router>> {
        router.spec.resource.as_ref()?;
        Some(self.client.list_routers(&[("name".into(), resource_name(router))]))
    }

    fn list_for_import(&self, _router: &Router, filter: &RouterFilter) -> ResourceStream<osclients::Router> {
        self.client.list_routers(&filter_query(filter))
    }

    async fn create(&self, router: &Router) -> Outcome<osclients::Router> {
        let spec = router.spec.resource.clone().unwrap_or_default();
        let external_gateway_info = match self.gateway_network_ids.as_slice() {
            [] => None,
            [network_id] => Some(GatewayInfo {
                network_id: network_id.clone(),
            }),
            _ => return Err(Error::invalid_configuration("only one external gateway is supported").into()),
        };
        let opts = RouterCreateOpts {
            name: Some(resource_name(router)),
            description: spec.description,
            admin_state_up: spec.admin_state_up,
            external_gateway_info,
            distributed: spec.distributed,
            availability_zone_hints: spec.availability_zone_hints,
        };
        self.client.create_router(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _router: &Router, resource: &osclients::Router) -> ReconcileStatus {
        delete_result(self.client.delete_router(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Router>> {
        vec![reconcile_tags]
    }
}

pub struct RouterFactory;

#[async_trait]
impl ActuatorFactory<Router> for RouterFactory {
    type Actuator = RouterActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, router: &Router) -> Outcome<RouterActuator> {
        let networks = GATEWAY_DEPENDENCY.get_guarded_dependencies(&ctx.orc, router).await?;
        let gateway_network_ids = gateway_refs(router)
            .iter()
            .filter_map(|name| networks.get(name)?.status_id().map(str::to_string))
            .collect();
        let scope = credentials::scope(ctx, CONTROLLER_NAME, router).await?;
        Ok(RouterActuator::new(scope.networking()?, gateway_network_ids))
    }

    async fn delete_actuator(&self, ctx: &Context, router: &Router) -> Outcome<RouterActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, router).await?;
        Ok(RouterActuator::new(scope.networking()?, Vec::new()))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Router>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .depends_on(GATEWAY_DEPENDENCY)
        .run(RouterFactory)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{extract::State, routing::post, Json, Router as HttpRouter};
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        osclients::{testing, ServiceClient},
        reconcilers::testing::credentials,
        resources::{ExternalGateway, RouterResourceSpec, RouterSpec},
    };

    fn router(gateways: &[&str]) -> Router {
        let mut router = Router::new(
            "router-a",
            RouterSpec {
                resource: Some(RouterResourceSpec {
                    external_gateways: gateways
                        .iter()
                        .map(|n| ExternalGateway {
                            network_ref: n.to_string(),
                        })
                        .collect(),
                    ..Default::default()
                }),
                cloud_credentials_ref: credentials(),
                ..Default::default()
            },
        );
        router.metadata.namespace = Some("default".into());
        router
    }

    #[test]
    fn gateways_are_dependencies() {
        let object = router(&["external", "external"]);
        assert_eq!(GATEWAY_DEPENDENCY.refs(&object), vec!["external".to_string()]);
        assert!(GATEWAY_DEPENDENCY.refs(&router(&[])).is_empty());
    }

    #[tokio::test]
    async fn gateway_network_is_sent_on_create() {
        let captured: Arc<Mutex<Vec<Value>>> = Default::default();
        async fn create(State(captured): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>) -> Json<Value> {
            captured.lock().unwrap().push(body);
            Json(json!({"router": {"id": "r1", "status": "ACTIVE", "external_gateway_info": {"network_id": "ext-id"}}}))
        }
        let base = testing::serve(
            HttpRouter::new()
                .route("/v2.0/routers", post(create))
                .with_state(captured.clone()),
        )
        .await;
        let client = NetworkingClient::new(ServiceClient::new(reqwest::Client::new(), base, "t"));
        let actuator = RouterActuator::new(client, vec!["ext-id".into()]);

        let created = actuator.create(&router(&["external"])).await.unwrap();
        assert_eq!(
            captured.lock().unwrap()[0],
            json!({"router": {"name": "router-a", "external_gateway_info": {"network_id": "ext-id"}}})
        );
        let status = actuator.resource_status(&created);
        assert_eq!(status.external_gateways[0].network_id, "ext-id");
    }

    #[tokio::test]
    async fn multiple_gateways_are_rejected() {
        let client = NetworkingClient::new(ServiceClient::new(reqwest::Client::new(), "http://127.0.0.1:9", "t"));
        let actuator = RouterActuator::new(client, vec!["a".into(), "b".into()]);
        let status = actuator.create(&router(&["a", "b"])).await.unwrap_err();
        assert_eq!(
            status.terminal_error().map(ToString::to_string).as_deref(),
            Some("only one external gateway is supported")
        );
    }
}
