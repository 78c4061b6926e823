use std::fmt;

use kube::{Resource, ResourceExt};
use serde_json::{json, Value};

use super::store::ApplyPatch;
use crate::ORC_API_GROUP;

/// The disjoint sets of fields a controller writes with server-side apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transaction {
    /// `status.id`, written once
    Id,
    /// The controller's entry in `metadata.finalizers`
    Finalizer,
    /// Everything else in `status`
    Status,
    /// References written onto other objects, e.g. volume attachments
    Attachment,
    /// Image content transfer bookkeeping, e.g. `status.downloadAttempts`
    Download,
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transaction::Id => "id",
            Transaction::Finalizer => "finalizer",
            Transaction::Status => "status",
            Transaction::Attachment => "attachment",
            Transaction::Download => "download",
        })
    }
}

/// Field owner of `txn` for the named controller, e.g. `openstack.k-orc.cloud/networkcontroller/status`
pub fn field_owner(controller: &str, txn: Transaction) -> String {
    format!("{ORC_API_GROUP}/{controller}controller/{txn}")
}

/// The primary finalizer of a controller's own objects
pub fn finalizer_name(controller: &str) -> String {
    format!("{ORC_API_GROUP}/{controller}")
}

/// The finalizer a `dependent` controller places on `guarded` objects it references
pub fn guard_finalizer_name(dependent: &str, guarded: &str) -> String {
    format!("{ORC_API_GROUP}/{dependent}_guarding_{guarded}")
}

pub fn has_finalizer<K: ResourceExt>(object: &K, finalizer: &str) -> bool {
    object.finalizers().iter().any(|f| f == finalizer)
}

fn metadata_patch<K: Resource<DynamicType = ()>>(object: &K, finalizers: Value) -> Value {
    let mut metadata = json!({
        "name": object.meta().name,
        "finalizers": finalizers,
    });
    if let Some(uid) = &object.meta().uid {
        metadata["uid"] = json!(uid);
    }
    json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "metadata": metadata,
    })
}

/// Claim `finalizer` under `owner`
pub fn set_finalizer_patch<K: Resource<DynamicType = ()>>(object: &K, owner: String, finalizer: &str) -> ApplyPatch {
    ApplyPatch::main(owner, metadata_patch(object, json!([finalizer])))
}

/// Release every finalizer held by `owner`
pub fn remove_finalizer_patch<K: Resource<DynamicType = ()>>(object: &K, owner: String) -> ApplyPatch {
    ApplyPatch::main(owner, metadata_patch(object, json!([])))
}
