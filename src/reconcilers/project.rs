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
    tags::{differ, normalize},
    Context,
};
use crate::{
    osclients::{self, IdentityClient, ProjectCreateOpts},
    resources::{Project, ProjectFilter, ProjectResourceSpec, ProjectResourceStatus},
};

pub const CONTROLLER_NAME: &str = "project";

fn resource_name(project: &Project) -> String {
    project
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| project.name_any())
}

fn filter_query(filter: &ProjectFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(name) = &filter.name {
        query.push(("name".into(), name.clone()));
    }
    if !filter.tags.is_empty() {
        query.push(("tags".into(), filter.tags.join(",")));
    }
    if !filter.tags_any.is_empty() {
        query.push(("tags-any".into(), filter.tags_any.join(",")));
    }
    query
}

/// Fields of `spec` which differ from the observed project, as a keystone update body
fn changes(spec: &ProjectResourceSpec, observed: &osclients::Project) -> Map<String, Value> {
    let mut changes = Map::new();
    if let Some(description) = &spec.description {
        if *description != observed.description {
            changes.insert("description".into(), json!(description));
        }
    }
    if let Some(enabled) = spec.enabled {
        if enabled != observed.enabled {
            changes.insert("enabled".into(), json!(enabled));
        }
    }
    if differ(&spec.tags, &observed.tags) {
        changes.insert("tags".into(), json!(normalize(&spec.tags)));
    }
    changes
}

pub struct ProjectActuator {
    client: IdentityClient,
}

impl ProjectActuator {
    pub fn new(client: IdentityClient) -> Self {
        Self { client }
    }
}

fn reconcile_update<'a>(
    actuator: &'a ProjectActuator,
    project: &'a Project,
    resource: &'a osclients::Project,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let Some(spec) = &project.spec.resource else {
            return ReconcileStatus::new();
        };
        let changes = changes(spec, resource);
        if changes.is_empty() {
            return ReconcileStatus::new();
        }
        info!(id = %resource.id, fields = ?changes.keys().collect::<Vec<_>>(), "updating project");
        match actuator.client.update_project(&resource.id, &Value::Object(changes)).await {
            Ok(_) => ReconcileStatus::new().needs_refresh(),
            Err(e) => request_failed(e),
        }
    }
    .boxed()
}

#[async_trait]
impl Actuator<Project> for ProjectActuator {
    type OsResource = osclients::Project;

    fn resource_id(resource: &osclients::Project) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Project) -> ProjectResourceStatus {
        ProjectResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            domain_id: resource.domain_id.clone(),
            enabled: resource.enabled,
            tags: normalize(&resource.tags),
        }
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Project>> {
        self.client.get_project(id).await
    }

    fn list_for_adoption(&self, project: &Project) -> Option<ResourceStream<osclients::Project>> {
        project.spec.resource.as_ref()?;
        Some(self.client.list_projects(&[("name".into(), resource_name(project))]))
    }

    fn list_for_import(&self, _project: &Project, filter: &ProjectFilter) -> ResourceStream<osclients::Project> {
        self.client.list_projects(&filter_query(filter))
    }

    async fn create(&self, project: &Project) -> Outcome<osclients::Project> {
        let spec = project.spec.resource.clone().unwrap_or_default();
        let opts = ProjectCreateOpts {
            name: resource_name(project),
            description: spec.description,
            enabled: spec.enabled,
            tags: normalize(&spec.tags),
        };
        self.client.create_project(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _project: &Project, resource: &osclients::Project) -> ReconcileStatus {
        delete_result(self.client.delete_project(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Project>> {
        vec![reconcile_update]
    }
}

pub struct ProjectFactory;

#[async_trait]
impl ActuatorFactory<Project> for ProjectFactory {
    type Actuator = ProjectActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, project: &Project) -> Outcome<ProjectActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, project).await?;
        Ok(ProjectActuator::new(scope.identity()?))
    }

    async fn delete_actuator(&self, ctx: &Context, project: &Project) -> Outcome<ProjectActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, project).await?;
        Ok(ProjectActuator::new(scope.identity()?))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Project>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(ProjectFactory)
        .await
}
