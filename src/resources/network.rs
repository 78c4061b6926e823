use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    orc_object, CloudCredentialsReference, FilterByNeutronTags, ManagedOptions, ManagementPolicy,
    NeutronStatusMetadata, OrcStatus, ResourceImport,
};

/// A neutron network
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Network",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "NetworkStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Import an existing network instead of creating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<NetworkFilter>>,

    /// The network to create when managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<NetworkResourceSpec>,

    #[serde(default)]
    pub management_policy: ManagementPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResourceSpec {
    /// Name of the network. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Neutron tags, reconciled as a set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_security_enabled: Option<bool>,

    /// Whether the network is an external network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zone_hints: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "projectID")]
    pub project_id: Option<String>,

    #[serde(flatten)]
    pub tags: FilterByNeutronTags,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "projectID")]
    pub project_id: String,

    /// Neutron status of the network, e.g. `ACTIVE`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub admin_state_up: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zone_hints: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns_domain: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_security_enabled: Option<bool>,

    #[serde(default)]
    pub external: bool,

    #[serde(default)]
    pub shared: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,

    #[serde(flatten)]
    pub metadata: NeutronStatusMetadata,
}

pub type NetworkStatus = OrcStatus<NetworkResourceStatus>;

orc_object!(Network, NetworkResourceSpec, NetworkFilter, NetworkResourceStatus);
