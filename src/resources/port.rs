use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    orc_object, CloudCredentialsReference, FilterByNeutronTags, ManagedOptions, ManagementPolicy,
    NeutronStatusMetadata, OrcStatus, ResourceImport,
};

/// A neutron port on a [`Network`](super::Network)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Port",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "PortStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Name of the Network this port belongs to
    pub network_ref: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<PortFilter>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<PortResourceSpec>,

    #[serde(default)]
    pub management_policy: ManagementPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortResourceSpec {
    /// Name of the port. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_address_pairs: Vec<AllowedAddressPair>,

    /// Fixed addresses of the port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,

    /// Names of SecurityGroups applied to the port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_refs: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowedAddressPair {
    pub ip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// Fixed IP address. Allocated by neutron when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Name of the Subnet the address is allocated from
    pub subnet_ref: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "projectID")]
    pub project_id: Option<String>,

    #[serde(flatten)]
    pub tags: FilterByNeutronTags,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FixedIpStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "subnetID")]
    pub subnet_id: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "networkID")]
    pub network_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "projectID")]
    pub project_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub admin_state_up: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_address: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "deviceID")]
    pub device_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_owner: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_address_pairs: Vec<AllowedAddressPair>,

    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "fixedIPs")]
    pub fixed_ips: Vec<FixedIpStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,

    #[serde(flatten)]
    pub metadata: NeutronStatusMetadata,
}

pub type PortStatus = OrcStatus<PortResourceStatus>;

orc_object!(Port, PortResourceSpec, PortFilter, PortResourceStatus);
