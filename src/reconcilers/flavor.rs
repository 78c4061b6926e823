use async_trait::async_trait;
use futures::{future, StreamExt, TryStreamExt};
use kube::{Client, ResourceExt};

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    progress::{Outcome, ReconcileStatus},
    Context,
};
use crate::{
    osclients::{self, ComputeClient, FlavorCreateOpts},
    resources::{Flavor, FlavorFilter, FlavorResourceSpec, FlavorResourceStatus},
};

pub const CONTROLLER_NAME: &str = "flavor";

fn resource_name(flavor: &Flavor) -> String {
    flavor
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| flavor.name_any())
}

/// Whether an existing flavor has the sizes requested by `spec`
///
/// Flavors cannot be updated, so adoption only accepts an exact match.
fn matches_spec(name: &str, spec: &FlavorResourceSpec, flavor: &osclients::Flavor) -> bool {
    flavor.name == name
        && flavor.ram == spec.ram
        && flavor.vcpus == spec.vcpus
        && flavor.disk == spec.disk
        && flavor.swap == spec.swap
        && flavor.ephemeral == spec.ephemeral
}

fn matches_filter(filter: &FlavorFilter, flavor: &osclients::Flavor) -> bool {
    filter.name.as_ref().map_or(true, |name| &flavor.name == name)
        && filter.ram.map_or(true, |ram| flavor.ram == ram)
        && filter.disk.map_or(true, |disk| flavor.disk == disk)
}

/// Nova only filters flavors by minimum sizes, so the rest is matched here
fn filter_query(filter: &FlavorFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(ram) = filter.ram {
        query.push(("minRam".into(), ram.to_string()));
    }
    if let Some(disk) = filter.disk {
        query.push(("minDisk".into(), disk.to_string()));
    }
    query
}

pub struct FlavorActuator {
    client: ComputeClient,
}

impl FlavorActuator {
    pub fn new(client: ComputeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Actuator<Flavor> for FlavorActuator {
    type OsResource = osclients::Flavor;

    fn resource_id(resource: &osclients::Flavor) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Flavor) -> FlavorResourceStatus {
        FlavorResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            ram: resource.ram,
            vcpus: resource.vcpus,
            disk: resource.disk,
            swap: resource.swap,
            ephemeral: resource.ephemeral,
            is_public: resource.is_public,
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Flavor>> {
        self.client.get_flavor(id).await
    }

    fn list_for_adoption(&self, flavor: &Flavor) -> Option<ResourceStream<osclients::Flavor>> {
        let spec = flavor.spec.resource.clone()?;
        let name = resource_name(flavor);
        Some(
            self.client
                .list_flavors(&[])
                .try_filter(move |found| future::ready(matches_spec(&name, &spec, found)))
                .boxed(),
        )
    }

    fn list_for_import(&self, _flavor: &Flavor, filter: &FlavorFilter) -> ResourceStream<osclients::Flavor> {
        let filter = filter.clone();
        self.client
            .list_flavors(&filter_query(&filter))
            .try_filter(move |found| future::ready(matches_filter(&filter, found)))
            .boxed()
    }

    async fn create(&self, flavor: &Flavor) -> Outcome<osclients::Flavor> {
        let spec = flavor.spec.resource.clone().unwrap_or_default();
        let opts = FlavorCreateOpts {
            name: resource_name(flavor),
            description: spec.description,
            ram: spec.ram,
            vcpus: spec.vcpus,
            disk: spec.disk,
            swap: Some(spec.swap).filter(|swap| *swap > 0),
            ephemeral: Some(spec.ephemeral).filter(|ephemeral| *ephemeral > 0),
            is_public: spec.is_public,
        };
        self.client.create_flavor(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _flavor: &Flavor, resource: &osclients::Flavor) -> ReconcileStatus {
        delete_result(self.client.delete_flavor(&resource.id).await)
    }
}

pub struct FlavorFactory;

#[async_trait]
impl ActuatorFactory<Flavor> for FlavorFactory {
    type Actuator = FlavorActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, flavor: &Flavor) -> Outcome<FlavorActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, flavor).await?;
        Ok(FlavorActuator::new(scope.compute()?))
    }

    async fn delete_actuator(&self, ctx: &Context, flavor: &Flavor) -> Outcome<FlavorActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, flavor).await?;
        Ok(FlavorActuator::new(scope.compute()?))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Flavor>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(FlavorFactory)
        .await
}
