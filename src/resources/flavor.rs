use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    orc_object, CloudCredentialsReference, ManagedOptions, ManagementPolicy, OrcStatus,
    ResourceImport,
};

/// A nova flavor
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Flavor",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "FlavorStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlavorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<FlavorFilter>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<FlavorResourceSpec>,

    #[serde(default)]
    pub management_policy: ManagementPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlavorResourceSpec {
    /// Name of the flavor. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Memory in MiB
    pub ram: i32,

    pub vcpus: i32,

    /// Root disk size in GiB. Zero boots from a volume sized by the image.
    #[serde(default)]
    pub disk: i32,

    /// Swap size in MiB
    #[serde(default)]
    pub swap: i32,

    /// Ephemeral disk size in GiB
    #[serde(default)]
    pub ephemeral: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlavorFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlavorResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub ram: i32,

    #[serde(default)]
    pub vcpus: i32,

    #[serde(default)]
    pub disk: i32,

    #[serde(default)]
    pub swap: i32,

    #[serde(default)]
    pub ephemeral: i32,

    #[serde(default)]
    pub is_public: bool,
}

pub type FlavorStatus = OrcStatus<FlavorResourceStatus>;

orc_object!(
    Flavor,
    FlavorResourceSpec,
    FlavorFilter,
    FlavorResourceStatus,
    true
);
