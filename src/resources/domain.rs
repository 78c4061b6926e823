use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    orc_object, CloudCredentialsReference, ManagedOptions, ManagementPolicy, OrcStatus,
    ResourceImport,
};

/// A keystone domain
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Domain",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "DomainStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<DomainFilter>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<DomainResourceSpec>,

    #[serde(default)]
    pub management_policy: ManagementPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainResourceSpec {
    /// Name of the domain. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub enabled: bool,
}

pub type DomainStatus = OrcStatus<DomainResourceStatus>;

orc_object!(Domain, DomainResourceSpec, DomainFilter, DomainResourceStatus);
