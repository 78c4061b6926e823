use std::fmt;

use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::Condition, NamespaceResourceScope,
};
use kube::{CustomResourceExt, Resource};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

mod domain;
mod flavor;
mod image;
mod keypair;
mod network;
mod port;
mod project;
mod router;
mod router_interface;
mod security_group;
mod server;
mod subnet;
mod volume;

pub use domain::*;
pub use flavor::*;
pub use image::*;
pub use keypair::*;
pub use network::*;
pub use port::*;
pub use project::*;
pub use router::*;
pub use router_interface::*;
pub use security_group::*;
pub use server::*;
pub use subnet::*;
pub use volume::*;

/// Condition type reporting whether the OpenStack resource is ready for use
pub const CONDITION_AVAILABLE: &str = "Available";

/// Condition type reporting whether the controller is still working on the object
pub const CONDITION_PROGRESSING: &str = "Progressing";

/// Machine-readable reasons carried by the `Available` and `Progressing` conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// The resource is up to date
    Success,
    /// The controller is still working towards the desired state
    Progressing,
    /// An error occurred which will be retried
    TransientError,
    /// The spec was rejected and will not be retried until it changes
    InvalidConfiguration,
    /// An invariant was violated which requires manual intervention
    UnrecoverableError,
    /// A referenced object does not exist or is not yet available
    DependencyNotReady,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::Success => "Success",
            ConditionReason::Progressing => "Progressing",
            ConditionReason::TransientError => "TransientError",
            ConditionReason::InvalidConfiguration => "InvalidConfiguration",
            ConditionReason::UnrecoverableError => "UnrecoverableError",
            ConditionReason::DependencyNotReady => "DependencyNotReady",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the controller may modify or delete the OpenStack resource
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ManagementPolicy {
    /// The controller creates, updates and deletes the resource
    #[default]
    Managed,
    /// The controller only observes an imported resource
    Unmanaged,
}

/// What happens to the OpenStack resource when the object is deleted
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnDelete {
    /// Delete the OpenStack resource
    #[default]
    Delete,
    /// Leave the OpenStack resource in place
    Detach,
}

/// Options which only apply to managed objects
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedOptions {
    #[serde(default)]
    pub on_delete: OnDelete,
}

/// Reference to a secret holding a `clouds.yaml`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudCredentialsReference {
    /// Name of a secret in the same namespace. The secret must contain a
    /// `clouds.yaml` key, and may contain a `cacert` key with a PEM bundle.
    pub secret_name: String,

    /// Name of the entry in `clouds.yaml` to use
    pub cloud_name: String,
}

/// Import an existing OpenStack resource instead of creating one
///
/// Exactly one of `id` or `filter` must be given.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceImport<F> {
    /// UUID of an existing OpenStack resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Filter which must match exactly one existing OpenStack resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<F>,
}

/// Observed state shared by every kind
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrcStatus<R> {
    /// `Available` and `Progressing` conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// ID of the OpenStack resource. Set once and never changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Last observed state of the OpenStack resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<R>,
}

impl<R> AsRef<OrcStatus<R>> for OrcStatus<R> {
    fn as_ref(&self) -> &OrcStatus<R> {
        self
    }
}

/// Tag filters understood by neutron list APIs
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterByNeutronTags {
    /// Resources must have all of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Resources must have at least one of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_any: Vec<String>,

    /// Resources must not have all of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_tags: Vec<String>,

    /// Resources must not have any of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_tags_any: Vec<String>,
}

impl FilterByNeutronTags {
    /// Query parameters for a neutron list request
    pub fn query(&self) -> Vec<(String, String)> {
        [
            ("tags", &self.tags),
            ("tags-any", &self.tags_any),
            ("not-tags", &self.not_tags),
            ("not-tags-any", &self.not_tags_any),
        ]
        .into_iter()
        .filter(|(_, tags)| !tags.is_empty())
        .map(|(key, tags)| (key.to_string(), tags.join(",")))
        .collect()
    }
}

/// Revision metadata neutron reports for most resources
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NeutronStatusMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_number: Option<i64>,
}

/// Common accessors the reconciliation engine needs from every kind
pub trait OrcObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type ResourceSpec: Clone + fmt::Debug + Send + Sync;
    type Filter: Clone + fmt::Debug + Send + Sync;
    type ResourceStatus: Clone + fmt::Debug + Serialize + PartialEq + Send + Sync;

    /// Whether `spec.import` exists on this kind
    const IMPORTABLE: bool = true;

    /// Whether the whole of `spec.resource` is immutable after creation
    const RESOURCE_IMMUTABLE: bool = false;

    fn resource_spec(&self) -> Option<&Self::ResourceSpec>;
    fn import(&self) -> Option<&ResourceImport<Self::Filter>>;
    fn management_policy(&self) -> ManagementPolicy;
    fn on_delete(&self) -> OnDelete;
    fn credentials_ref(&self) -> &CloudCredentialsReference;
    fn orc_status(&self) -> Option<&OrcStatus<Self::ResourceStatus>>;

    fn status_id(&self) -> Option<&str> {
        self.orc_status().and_then(|s| s.id.as_deref())
    }

    fn conditions(&self) -> &[Condition] {
        self.orc_status()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    /// True when the object reports `Available=True`
    fn is_available(&self) -> bool {
        self.condition(CONDITION_AVAILABLE)
            .is_some_and(|c| c.status == "True")
    }
}

/// Implement [`OrcObject`] for a kind following the common spec layout
macro_rules! orc_object {
    ($kind:ty, $resource:ty, $filter:ty, $status:ty) => {
        orc_object!($kind, $resource, $filter, $status, false);
    };
    ($kind:ty, $resource:ty, $filter:ty, $status:ty, $immutable:expr) => {
        impl $crate::resources::OrcObject for $kind {
            type ResourceSpec = $resource;
            type Filter = $filter;
            type ResourceStatus = $status;

            const RESOURCE_IMMUTABLE: bool = $immutable;

            fn resource_spec(&self) -> Option<&Self::ResourceSpec> {
                self.spec.resource.as_ref()
            }

            fn import(&self) -> Option<&$crate::resources::ResourceImport<Self::Filter>> {
                self.spec.import.as_ref()
            }

            fn management_policy(&self) -> $crate::resources::ManagementPolicy {
                self.spec.management_policy
            }

            fn on_delete(&self) -> $crate::resources::OnDelete {
                self.spec
                    .managed_options
                    .as_ref()
                    .map(|o| o.on_delete)
                    .unwrap_or_default()
            }

            fn credentials_ref(&self) -> &$crate::resources::CloudCredentialsReference {
                &self.spec.cloud_credentials_ref
            }

            fn orc_status(&self) -> Option<&$crate::resources::OrcStatus<Self::ResourceStatus>> {
                self.status.as_ref().map(AsRef::as_ref)
            }
        }
    };
}
pub(crate) use orc_object;

/// Generate the CRD for a kind, including the validation rules the derive cannot express
pub fn crd<K: CustomResourceExt + OrcObject>() -> Result<CustomResourceDefinition, serde_json::Error> {
    let mut crd = serde_json::to_value(K::crd())?;

    let versions = crd
        .pointer_mut("/spec/versions")
        .and_then(|v| v.as_array_mut())
        .into_iter()
        .flatten();
    for version in versions {
        let Some(spec) = version.pointer_mut("/schema/openAPIV3Schema/properties/spec") else {
            continue;
        };

        if K::IMPORTABLE {
            spec["x-kubernetes-validations"] = json!([
                {
                    "rule": "!has(self.__import__) || !has(self.resource)",
                    "message": "import and resource are mutually exclusive",
                },
                {
                    "rule": "self.managementPolicy == 'managed' ? has(self.resource) || has(self.__import__) : has(self.__import__)",
                    "message": "resource must be specified when policy is managed, import must be specified when policy is unmanaged",
                },
                {
                    "rule": "!has(self.managedOptions) || self.managementPolicy == 'managed'",
                    "message": "managedOptions may only be provided when policy is managed",
                },
            ]);
        }

        if let Some(import) = spec.pointer_mut("/properties/import") {
            import["minProperties"] = json!(1);
            import["maxProperties"] = json!(1);
            import["x-kubernetes-validations"] = immutable();
            if let Some(filter) = import.pointer_mut("/properties/filter") {
                filter["minProperties"] = json!(1);
            }
        }
        if K::RESOURCE_IMMUTABLE {
            if let Some(resource) = spec.pointer_mut("/properties/resource") {
                resource["x-kubernetes-validations"] = immutable();
            }
        }
    }

    serde_json::from_value(crd)
}

fn immutable() -> serde_json::Value {
    json!([{ "rule": "self == oldSelf", "message": "field is immutable" }])
}
