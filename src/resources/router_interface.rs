use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    CloudCredentialsReference, ManagementPolicy, OnDelete, OrcObject, OrcStatus, ResourceImport,
};

/// Attachment of a [`Router`](super::Router) to a [`Subnet`](super::Subnet)
///
/// The OpenStack resource backing a router interface is the router port
/// neutron creates on the subnet.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "RouterInterface",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "RouterInterfaceStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct RouterInterfaceSpec {
    #[serde(rename = "type", default)]
    pub type_: RouterInterfaceType,

    /// Name of the Router to attach
    pub router_ref: String,

    /// Name of the Subnet to attach. Required for the `Subnet` type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_ref: Option<String>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RouterInterfaceType {
    #[default]
    Subnet,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouterInterfaceResourceStatus {
    /// Neutron status of the router port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "routerID")]
    pub router_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "subnetID")]
    pub subnet_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "ipAddresses")]
    pub ip_addresses: Vec<String>,
}

pub type RouterInterfaceStatus = OrcStatus<RouterInterfaceResourceStatus>;

impl OrcObject for RouterInterface {
    type ResourceSpec = RouterInterfaceSpec;
    type Filter = ();
    type ResourceStatus = RouterInterfaceResourceStatus;

    const IMPORTABLE: bool = false;

    fn resource_spec(&self) -> Option<&Self::ResourceSpec> {
        Some(&self.spec)
    }

    fn import(&self) -> Option<&ResourceImport<Self::Filter>> {
        None
    }

    fn management_policy(&self) -> ManagementPolicy {
        ManagementPolicy::Managed
    }

    fn on_delete(&self) -> OnDelete {
        OnDelete::Delete
    }

    fn credentials_ref(&self) -> &CloudCredentialsReference {
        &self.spec.cloud_credentials_ref
    }

    fn orc_status(&self) -> Option<&OrcStatus<Self::ResourceStatus>> {
        self.status.as_ref()
    }
}
