use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::ObjectReference, NamespaceResourceScope};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Error, Result};

#[cfg(test)]
pub mod fake;

/// Which endpoint of an object a patch targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    Main,
    Status,
}

/// A server-side apply patch
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyPatch {
    pub field_owner: String,
    pub subresource: Subresource,
    pub force: bool,
    pub body: Value,
}

impl ApplyPatch {
    pub fn main(field_owner: impl Into<String>, body: Value) -> Self {
        Self {
            field_owner: field_owner.into(),
            subresource: Subresource::Main,
            force: true,
            body,
        }
    }

    pub fn status(field_owner: impl Into<String>, body: Value) -> Self {
        Self {
            field_owner: field_owner.into(),
            subresource: Subresource::Status,
            force: true,
            body,
        }
    }

    /// Fail on a field manager conflict instead of taking ownership
    pub fn without_force(mut self) -> Self {
        self.force = false;
        self
    }
}

/// A Kubernetes event about one object
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectEvent {
    pub warning: bool,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl ObjectEvent {
    pub fn normal(reason: impl Into<String>, action: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.into(),
            note: note.into(),
            action: action.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, action: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            ..Self::normal(reason, action, note)
        }
    }
}

/// Access to orchestrator objects, erased over their kind
///
/// Every read and write the engine makes goes through this seam so the
/// reconcile logic can run against an in-memory store in tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<Value>>;

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<Value>>;

    async fn apply(&self, resource: &ApiResource, namespace: &str, name: &str, patch: ApplyPatch) -> Result<Value>;

    /// Request deletion. Missing objects are not an error.
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()>;

    async fn publish(&self, reference: &ObjectReference, event: ObjectEvent) -> Result<()>;
}

/// The store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
    reporter: Reporter,
}

impl KubeObjectStore {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<Value>> {
        let object = self.api(resource, namespace).get_opt(name).await?;
        object.map(serde_json::to_value).transpose().map_err(Error::from)
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<Value>> {
        let objects = self.api(resource, namespace).list(&ListParams::default()).await?;
        objects
            .items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .collect()
    }

    async fn apply(&self, resource: &ApiResource, namespace: &str, name: &str, patch: ApplyPatch) -> Result<Value> {
        let api = self.api(resource, namespace);
        let mut params = PatchParams::apply(&patch.field_owner);
        if patch.force {
            params = params.force();
        }

        // A conflict is retried once before it is reported
        let mut retried = false;
        loop {
            let result = match patch.subresource {
                Subresource::Main => api.patch(name, &params, &Patch::Apply(&patch.body)).await,
                Subresource::Status => api.patch_status(name, &params, &Patch::Apply(&patch.body)).await,
            };
            match result {
                Ok(object) => return Ok(serde_json::to_value(object)?),
                Err(kube::Error::Api(ae)) if ae.code == 409 && !retried => {
                    debug!(name, owner = patch.field_owner, "apply conflict, retrying");
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        match self.api(resource, namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, reference: &ObjectReference, event: ObjectEvent) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        recorder
            .publish(Event {
                type_: if event.warning {
                    EventType::Warning
                } else {
                    EventType::Normal
                },
                reason: event.reason,
                note: Some(event.note),
                action: event.action,
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

/// Typed access to orchestrator objects through an [`ObjectStore`]
#[derive(Clone)]
pub struct OrcClient {
    store: Arc<dyn ObjectStore>,
}

impl OrcClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + DeserializeOwned,
    {
        let value = self.store.get(&ApiResource::erase::<K>(&()), namespace, name).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    pub async fn list<K>(&self, namespace: &str) -> Result<Vec<K>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + DeserializeOwned,
    {
        let values = self.store.list(&ApiResource::erase::<K>(&()), namespace).await?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }

    pub async fn apply<K>(&self, namespace: &str, name: &str, patch: ApplyPatch) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.store
            .apply(&ApiResource::erase::<K>(&()), namespace, name, patch)
            .await?;
        Ok(())
    }

    pub async fn delete<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.store.delete(&ApiResource::erase::<K>(&()), namespace, name).await
    }

    /// Publish an event, logging rather than failing when the event cannot be written
    pub async fn publish<K>(&self, object: &K, event: ObjectEvent)
    where
        K: Resource<DynamicType = ()>,
    {
        let reason = event.reason.clone();
        if let Err(e) = self.store.publish(&object.object_ref(&()), event).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}
