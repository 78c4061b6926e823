use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    progress::{Outcome, ReconcileStatus, WaitingOn},
    Context,
};
use crate::{
    osclients::{self, VolumeClient, VolumeCreateOpts},
    resources::{Volume, VolumeAttachmentStatus, VolumeFilter, VolumeResourceStatus},
    Error,
};

pub const CONTROLLER_NAME: &str = "volume";

const STATUS_AVAILABLE: &str = "available";
const STATUS_IN_USE: &str = "in-use";
const STATUS_ERROR: &str = "error";

fn resource_name(volume: &Volume) -> String {
    volume
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| volume.name_any())
}

fn filter_query(filter: &VolumeFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(name) = &filter.name {
        query.push(("name".into(), name.clone()));
    }
    if let Some(size) = filter.size {
        query.push(("size".into(), size.to_string()));
    }
    query
}

pub struct VolumeActuator {
    client: VolumeClient,
    poll_period: std::time::Duration,
}

impl VolumeActuator {
    pub fn new(client: VolumeClient, poll_period: std::time::Duration) -> Self {
        Self { client, poll_period }
    }
}

/// A volume which failed to create will never become available
fn check_error<'a>(
    _actuator: &'a VolumeActuator,
    _volume: &'a Volume,
    resource: &'a osclients::Volume,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        if resource.status == STATUS_ERROR {
            ReconcileStatus::new().with_error(Error::unrecoverable("volume is in error state"))
        } else {
            ReconcileStatus::new()
        }
    }
    .boxed()
}

#[async_trait]
impl Actuator<Volume> for VolumeActuator {
    type OsResource = osclients::Volume;

    fn resource_id(resource: &osclients::Volume) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Volume) -> VolumeResourceStatus {
        VolumeResourceStatus {
            name: resource.name.clone().unwrap_or_default(),
            description: resource.description.clone().unwrap_or_default(),
            size: resource.size,
            status: resource.status.clone(),
            attachments: resource
                .attachments
                .iter()
                .map(|a| VolumeAttachmentStatus {
                    server_id: a.server_id.clone(),
                    device: a.device.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }

    fn is_available(&self, resource: &osclients::Volume) -> bool {
        resource.status == STATUS_AVAILABLE || resource.status == STATUS_IN_USE
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Volume>> {
        self.client.get_volume(id).await
    }

    fn list_for_adoption(&self, volume: &Volume) -> Option<ResourceStream<osclients::Volume>> {
        volume.spec.resource.as_ref()?;
        Some(self.client.list_volumes(&[("name".into(), resource_name(volume))]))
    }

    fn list_for_import(&self, _volume: &Volume, filter: &VolumeFilter) -> ResourceStream<osclients::Volume> {
        self.client.list_volumes(&filter_query(filter))
    }

    async fn create(&self, volume: &Volume) -> Outcome<osclients::Volume> {
        let spec = volume.spec.resource.clone().unwrap_or_default();
        let opts = VolumeCreateOpts {
            size: spec.size,
            name: Some(resource_name(volume)),
            description: spec.description,
        };
        self.client.create_volume(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _volume: &Volume, resource: &osclients::Volume) -> ReconcileStatus {
        // Cinder refuses to delete attached volumes
        if !resource.attachments.is_empty() {
            debug!(id = %resource.id, attachments = resource.attachments.len(), "volume is still attached");
            return ReconcileStatus::new().waiting_on_cloud(WaitingOn::Update, self.poll_period);
        }
        delete_result(self.client.delete_volume(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Volume>> {
        vec![check_error]
    }
}

pub struct VolumeFactory;

#[async_trait]
impl ActuatorFactory<Volume> for VolumeFactory {
    type Actuator = VolumeActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, volume: &Volume) -> Outcome<VolumeActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, volume).await?;
        Ok(VolumeActuator::new(scope.volume()?, ctx.poll_period))
    }

    async fn delete_actuator(&self, ctx: &Context, volume: &Volume) -> Outcome<VolumeActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, volume).await?;
        Ok(VolumeActuator::new(scope.volume()?, ctx.poll_period))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Volume>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(VolumeFactory)
        .await
}
