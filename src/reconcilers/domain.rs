use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    progress::{Outcome, ReconcileStatus},
    Context,
};
use crate::{
    osclients::{self, DomainCreateOpts, IdentityClient},
    resources::{Domain, DomainFilter, DomainResourceStatus},
};

pub const CONTROLLER_NAME: &str = "domain";

fn resource_name(domain: &Domain) -> String {
    domain
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| domain.name_any())
}

fn filter_query(filter: &DomainFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(name) = &filter.name {
        query.push(("name".into(), name.clone()));
    }
    if let Some(enabled) = filter.enabled {
        query.push(("enabled".into(), enabled.to_string()));
    }
    query
}

pub struct DomainActuator {
    client: IdentityClient,
}

impl DomainActuator {
    pub fn new(client: IdentityClient) -> Self {
        Self { client }
    }
}

fn reconcile_update<'a>(
    actuator: &'a DomainActuator,
    domain: &'a Domain,
    resource: &'a osclients::Domain,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let Some(spec) = &domain.spec.resource else {
            return ReconcileStatus::new();
        };
        let mut changes = Map::new();
        if let Some(description) = spec.description.as_ref().filter(|d| **d != resource.description) {
            changes.insert("description".into(), json!(description));
        }
        if let Some(enabled) = spec.enabled.filter(|e| *e != resource.enabled) {
            changes.insert("enabled".into(), json!(enabled));
        }
        if changes.is_empty() {
            return ReconcileStatus::new();
        }
        info!(id = %resource.id, "updating domain");
        match actuator.client.update_domain(&resource.id, &Value::Object(changes)).await {
            Ok(_) => ReconcileStatus::new().needs_refresh(),
            Err(e) => request_failed(e),
        }
    }
    .boxed()
}

#[async_trait]
impl Actuator<Domain> for DomainActuator {
    type OsResource = osclients::Domain;

    fn resource_id(resource: &osclients::Domain) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Domain) -> DomainResourceStatus {
        DomainResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            enabled: resource.enabled,
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Domain>> {
        self.client.get_domain(id).await
    }

    fn list_for_adoption(&self, domain: &Domain) -> Option<ResourceStream<osclients::Domain>> {
        domain.spec.resource.as_ref()?;
        Some(self.client.list_domains(&[("name".into(), resource_name(domain))]))
    }

    fn list_for_import(&self, _domain: &Domain, filter: &DomainFilter) -> ResourceStream<osclients::Domain> {
        self.client.list_domains(&filter_query(filter))
    }

    async fn create(&self, domain: &Domain) -> Outcome<osclients::Domain> {
        let spec = domain.spec.resource.clone().unwrap_or_default();
        let opts = DomainCreateOpts {
            name: resource_name(domain),
            description: spec.description,
            enabled: spec.enabled,
        };
        self.client.create_domain(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _domain: &Domain, resource: &osclients::Domain) -> ReconcileStatus {
        delete_result(self.client.delete_domain(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Domain>> {
        vec![reconcile_update]
    }
}

pub struct DomainFactory;

#[async_trait]
impl ActuatorFactory<Domain> for DomainFactory {
    type Actuator = DomainActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, domain: &Domain) -> Outcome<DomainActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, domain).await?;
        Ok(DomainActuator::new(scope.identity()?))
    }

    async fn delete_actuator(&self, ctx: &Context, domain: &Domain) -> Outcome<DomainActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, domain).await?;
        Ok(DomainActuator::new(scope.identity()?))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Domain>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(DomainFactory)
        .await
}
