//! In-memory object store simulating the parts of server-side apply the engine relies on

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{api::core::v1::ObjectReference, NamespaceResourceScope};
use kube::{core::ApiResource, error::ErrorResponse, Resource};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use super::{ApplyPatch, ObjectEvent, ObjectStore, Subresource};
use crate::{Error, Result};

type ObjectKey = (String, String, String);

/// Owner recorded for finalizers present when an object is inserted directly
const UNMANAGED: &str = "";

#[derive(Clone, Debug)]
pub struct RecordedApply {
    pub kind: String,
    pub name: String,
    pub patch: ApplyPatch,
}

#[derive(Default)]
struct StoredObject {
    value: Value,
    finalizer_owners: BTreeMap<String, Vec<String>>,
    status_owners: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, StoredObject>,
    events: Vec<(String, String, ObjectEvent)>,
    applies: Vec<RecordedApply>,
    apply_failures: Vec<kube::Error>,
    next_uid: u64,
}

#[derive(Default)]
pub struct FakeObjectStore {
    inner: Mutex<Inner>,
}

fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: message.into(),
        reason: reason.into(),
        code,
    }))
}

fn key(resource: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
    (resource.kind.clone(), namespace.to_string(), name.to_string())
}

fn finalizers(value: &Value) -> Vec<String> {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|f| f.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn is_deleting(value: &Value) -> bool {
    value.pointer("/metadata/deletionTimestamp").is_some_and(|t| !t.is_null())
}

impl StoredObject {
    fn current_finalizers(&self) -> Vec<String> {
        finalizers(&self.value)
    }

    fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.value["metadata"]["finalizers"] = json!(finalizers);
    }

    /// Replace the finalizers owned by `owner`, keeping everyone else's
    fn apply_finalizers(&mut self, owner: &str, wanted: Vec<String>) -> Result<()> {
        let mut current = self.current_finalizers();
        if is_deleting(&self.value) && wanted.iter().any(|f| !current.contains(f)) {
            return Err(api_error(
                422,
                "Invalid",
                "Forbidden: no new finalizers can be added if the object is being deleted",
            ));
        }

        let previous = self.finalizer_owners.remove(owner).unwrap_or_default();
        let claimed_elsewhere: BTreeSet<&String> = self.finalizer_owners.values().flatten().collect();

        current.retain(|f| wanted.contains(f) || !previous.contains(f) || claimed_elsewhere.contains(f));
        for f in &wanted {
            if !current.contains(f) {
                current.push(f.clone());
            }
        }
        if !wanted.is_empty() {
            self.finalizer_owners.insert(owner.to_string(), wanted);
        }
        self.set_finalizers(current);
        Ok(())
    }

    fn apply_status(&mut self, owner: &str, status: &serde_json::Map<String, Value>, force: bool) -> Result<()> {
        let current = self.value["status"].as_object().cloned().unwrap_or_default();
        if !force {
            for (field, value) in status {
                let owned_elsewhere = self
                    .status_owners
                    .iter()
                    .any(|(o, fields)| o != owner && fields.contains(field));
                if owned_elsewhere && current.get(field) != Some(value) {
                    return Err(api_error(
                        409,
                        "Conflict",
                        format!("Apply failed with 1 conflict: conflict with another manager using status.{field}"),
                    ));
                }
            }
        }

        let previous = self.status_owners.remove(owner).unwrap_or_default();
        if force {
            for fields in self.status_owners.values_mut() {
                fields.retain(|f| !status.contains_key(f));
            }
        }
        let claimed_elsewhere: BTreeSet<String> = self.status_owners.values().flatten().cloned().collect();

        let mut updated = current;
        for field in previous {
            if !status.contains_key(&field) && !claimed_elsewhere.contains(&field) {
                updated.remove(&field);
            }
        }
        for (field, value) in status {
            updated.insert(field.clone(), value.clone());
        }
        self.status_owners
            .insert(owner.to_string(), status.keys().cloned().collect());
        self.value["status"] = Value::Object(updated);
        Ok(())
    }
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object as if a user created it
    pub fn insert<K>(&self, object: &K)
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Serialize,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut value = serde_json::to_value(object).expect("serializable object");
        value["apiVersion"] = json!(resource.api_version);
        value["kind"] = json!(resource.kind);
        let name = value["metadata"]["name"].as_str().expect("object name").to_string();
        let namespace = value["metadata"]["namespace"].as_str().unwrap_or("default").to_string();

        let mut inner = self.lock();
        inner.next_uid += 1;
        let uid = format!("uid-{}", inner.next_uid);
        let metadata = &mut value["metadata"];
        metadata["namespace"] = json!(namespace);
        if metadata["uid"].is_null() {
            metadata["uid"] = json!(uid);
        }
        if metadata["generation"].is_null() {
            metadata["generation"] = json!(1);
        }

        let stored = StoredObject {
            finalizer_owners: BTreeMap::from([(UNMANAGED.to_string(), finalizers(&value))]),
            value,
            ..Default::default()
        };
        inner
            .objects
            .insert((resource.kind, namespace, name), stored);
    }

    pub fn object<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + DeserializeOwned,
    {
        let resource = ApiResource::erase::<K>(&());
        self.lock()
            .objects
            .get(&key(&resource, namespace, name))
            .map(|o| serde_json::from_value(o.value.clone()).expect("stored object deserializes"))
    }

    /// Edit an object as a user would, bumping its generation when the spec changes
    pub fn edit<K>(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut Value))
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut inner = self.lock();
        let object = inner
            .objects
            .get_mut(&key(&resource, namespace, name))
            .expect("edited object exists");
        let before = object.value["spec"].clone();
        edit(&mut object.value["spec"]);
        if object.value["spec"] != before {
            let generation = object.value["metadata"]["generation"].as_i64().unwrap_or(1);
            object.value["metadata"]["generation"] = json!(generation + 1);
        }
    }

    /// Remove a finalizer as an external party would
    pub fn remove_finalizer<K>(&self, namespace: &str, name: &str, finalizer: &str)
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut inner = self.lock();
        let key = key(&resource, namespace, name);
        if let Some(object) = inner.objects.get_mut(&key) {
            for owned in object.finalizer_owners.values_mut() {
                owned.retain(|f| f != finalizer);
            }
            let mut current = object.current_finalizers();
            current.retain(|f| f != finalizer);
            object.set_finalizers(current);
        }
        Self::collect_garbage(&mut inner, &key);
    }

    /// Edit an object's metadata directly
    pub fn edit_metadata<K>(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut Value))
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut inner = self.lock();
        let object = inner
            .objects
            .get_mut(&key(&resource, namespace, name))
            .expect("edited object exists");
        if object.value["metadata"]["finalizers"].is_null() {
            object.value["metadata"]["finalizers"] = json!([]);
        }
        edit(&mut object.value["metadata"]);
    }

    /// Request deletion as a user would
    pub fn delete_object<K>(&self, namespace: &str, name: &str)
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let resource = ApiResource::erase::<K>(&());
        let mut inner = self.lock();
        let key = key(&resource, namespace, name);
        if let Some(object) = inner.objects.get_mut(&key) {
            if !is_deleting(&object.value) {
                object.value["metadata"]["deletionTimestamp"] = json!(Utc::now().to_rfc3339());
            }
        }
        Self::collect_garbage(&mut inner, &key);
    }

    pub fn events(&self) -> Vec<(String, String, ObjectEvent)> {
        self.lock().events.clone()
    }

    pub fn applies(&self) -> Vec<RecordedApply> {
        self.lock().applies.clone()
    }

    /// Fail the next apply with `error`
    pub fn fail_next_apply(&self, error: kube::Error) {
        self.lock().apply_failures.push(error);
    }

    fn collect_garbage(inner: &mut Inner, key: &ObjectKey) {
        let collectable = inner
            .objects
            .get(key)
            .is_some_and(|o| is_deleting(&o.value) && o.current_finalizers().is_empty());
        if collectable {
            inner.objects.remove(key);
        }
    }

    fn create(inner: &mut Inner, key: &ObjectKey, body: &Value) -> Result<StoredObject> {
        if body.get("apiVersion").is_none() || body.get("kind").is_none() {
            return Err(api_error(400, "BadRequest", "apiVersion and kind are required"));
        }
        inner.next_uid += 1;
        let mut value = json!({
            "apiVersion": body["apiVersion"],
            "kind": body["kind"],
            "metadata": {
                "name": key.2,
                "namespace": key.1,
                "uid": format!("uid-{}", inner.next_uid),
                "generation": 1,
                "creationTimestamp": Utc::now().to_rfc3339(),
            },
            "spec": body.get("spec").cloned().unwrap_or(json!({})),
        });
        for field in ["ownerReferences", "labels"] {
            if let Some(v) = body["metadata"].get(field) {
                value["metadata"][field] = v.clone();
            }
        }
        Ok(StoredObject {
            value,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<Value>> {
        Ok(self
            .lock()
            .objects
            .get(&key(resource, namespace, name))
            .map(|o| o.value.clone()))
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<Value>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((kind, ns, _), _)| *kind == resource.kind && ns == namespace)
            .map(|(_, o)| o.value.clone())
            .collect())
    }

    async fn apply(&self, resource: &ApiResource, namespace: &str, name: &str, patch: ApplyPatch) -> Result<Value> {
        let mut inner = self.lock();
        inner.applies.push(RecordedApply {
            kind: resource.kind.clone(),
            name: name.to_string(),
            patch: patch.clone(),
        });
        if !inner.apply_failures.is_empty() {
            return Err(Error::KubeError(inner.apply_failures.remove(0)));
        }

        let key = key(resource, namespace, name);
        let body = &patch.body;
        let mut object = match inner.objects.remove(&key) {
            Some(object) => object,
            None if patch.subresource == Subresource::Main => Self::create(&mut inner, &key, body)?,
            None => return Err(api_error(404, "NotFound", format!("{} {name:?} not found", resource.plural))),
        };

        let result = (|| {
            if let Some(uid) = body.pointer("/metadata/uid").and_then(Value::as_str) {
                let stored = object.value["metadata"]["uid"].as_str().unwrap_or_default();
                if uid != stored {
                    return Err(api_error(
                        409,
                        "Conflict",
                        format!("Precondition failed: UID in precondition: {uid}, UID in object meta: {stored}"),
                    ));
                }
            }

            match patch.subresource {
                Subresource::Main => {
                    let wanted = finalizers(body);
                    object.apply_finalizers(&patch.field_owner, wanted)?;
                    if let Some(spec) = body.get("spec").and_then(Value::as_object) {
                        let before = object.value["spec"].clone();
                        for (field, value) in spec {
                            object.value["spec"][field] = value.clone();
                        }
                        if object.value["spec"] != before {
                            let generation = object.value["metadata"]["generation"].as_i64().unwrap_or(1);
                            object.value["metadata"]["generation"] = json!(generation + 1);
                        }
                    }
                }
                Subresource::Status => {
                    let status = body["status"].as_object().cloned().unwrap_or_default();
                    object.apply_status(&patch.field_owner, &status, patch.force)?;
                }
            }
            Ok(())
        })();

        let value = object.value.clone();
        inner.objects.insert(key.clone(), object);
        Self::collect_garbage(&mut inner, &key);
        result.map(|_| value)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let key = key(resource, namespace, name);
        if let Some(object) = inner.objects.get_mut(&key) {
            if object.current_finalizers().is_empty() {
                inner.objects.remove(&key);
            } else if !is_deleting(&object.value) {
                object.value["metadata"]["deletionTimestamp"] = json!(Utc::now().to_rfc3339());
            }
        }
        Ok(())
    }

    async fn publish(&self, reference: &ObjectReference, event: ObjectEvent) -> Result<()> {
        self.lock().events.push((
            reference.kind.clone().unwrap_or_default(),
            reference.name.clone().unwrap_or_default(),
            event,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    use super::*;

    fn secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("creds".into()),
                namespace: Some("default".into()),
                finalizers: Some(vec!["example.com/keep".into()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn finalizer_patch(finalizers: &[&str]) -> ApplyPatch {
        ApplyPatch::main(
            "owner-a",
            json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"finalizers": finalizers}}),
        )
    }

    #[tokio::test]
    async fn finalizers_are_owned_per_field_manager() {
        let store = FakeObjectStore::new();
        store.insert(&secret());
        let secrets = ApiResource::erase::<Secret>(&());

        store
            .apply(&secrets, "default", "creds", finalizer_patch(&["orc/guard"]))
            .await
            .unwrap();
        let current = store.object::<Secret>("default", "creds").unwrap();
        assert_eq!(
            current.metadata.finalizers.unwrap(),
            vec!["example.com/keep", "orc/guard"]
        );

        store
            .apply(&secrets, "default", "creds", finalizer_patch(&[]))
            .await
            .unwrap();
        let current = store.object::<Secret>("default", "creds").unwrap();
        assert_eq!(current.metadata.finalizers.unwrap(), vec!["example.com/keep"]);
    }

    #[tokio::test]
    async fn deleting_objects_are_collected_when_finalizers_clear() {
        let store = FakeObjectStore::new();
        store.insert(&secret());
        let secrets = ApiResource::erase::<Secret>(&());

        store.delete(&secrets, "default", "creds").await.unwrap();
        let current = store.object::<Secret>("default", "creds").unwrap();
        assert!(current.metadata.deletion_timestamp.is_some());

        let err = store
            .apply(&secrets, "default", "creds", finalizer_patch(&["orc/new"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KubeError(kube::Error::Api(ref ae)) if ae.code == 422));

        store.remove_finalizer::<Secret>("default", "creds", "example.com/keep");
        assert!(store.object::<Secret>("default", "creds").is_none());
    }

    #[tokio::test]
    async fn status_fields_conflict_without_force() {
        let store = FakeObjectStore::new();
        store.insert(&secret());
        let secrets = ApiResource::erase::<Secret>(&());
        let status = |owner: &str, id: &str| {
            ApplyPatch::status(owner, json!({"apiVersion": "v1", "kind": "Secret", "status": {"id": id}}))
        };

        store
            .apply(&secrets, "default", "creds", status("ids", "a").without_force())
            .await
            .unwrap();
        // Same value under another owner is shared ownership, not a conflict
        store
            .apply(&secrets, "default", "creds", status("other", "a").without_force())
            .await
            .unwrap();
        let err = store
            .apply(&secrets, "default", "creds", status("other", "b").without_force())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
