use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    orc_object, CloudCredentialsReference, FilterByNeutronTags, ManagedOptions, ManagementPolicy,
    NeutronStatusMetadata, OrcStatus, ResourceImport,
};

/// A neutron subnet on a [`Network`](super::Network)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Subnet",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "SubnetStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Name of the Network this subnet belongs to
    pub network_ref: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<SubnetFilter>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<SubnetResourceSpec>,

    #[serde(default)]
    pub management_policy: ManagementPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetResourceSpec {
    /// Name of the subnet. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// IP version, 4 or 6. Inferred from the CIDR when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<u8>,

    pub cidr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<SubnetGateway>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "enableDHCP")]
    pub enable_dhcp: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocation_pools: Vec<AllocationPool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_routes: Vec<HostRoute>,

    /// Router to attach this subnet to. A RouterInterface named
    /// `<subnet>-subnet` is created and owned by the subnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum SubnetGatewayType {
    /// Let neutron pick the gateway address
    #[default]
    Automatic,
    /// No gateway
    None,
    /// Use the address given in `ip`
    IP,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetGateway {
    #[serde(rename = "type")]
    pub type_: SubnetGatewayType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocationPool {
    pub start: String,
    pub end: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostRoute {
    pub destination: String,
    pub next_hop: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "projectID")]
    pub project_id: Option<String>,

    #[serde(flatten)]
    pub tags: FilterByNeutronTags,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "networkID")]
    pub network_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "projectID")]
    pub project_id: String,

    #[serde(default)]
    pub ip_version: u8,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr: String,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "gatewayIP")]
    pub gateway_ip: Option<String>,

    #[serde(default, rename = "enableDHCP")]
    pub enable_dhcp: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocation_pools: Vec<AllocationPool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_routes: Vec<HostRoute>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(flatten)]
    pub metadata: NeutronStatusMetadata,
}

pub type SubnetStatus = OrcStatus<SubnetResourceStatus>;

orc_object!(Subnet, SubnetResourceSpec, SubnetFilter, SubnetResourceStatus);
