use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    orc_object, CloudCredentialsReference, ManagedOptions, ManagementPolicy, OrcStatus,
    ResourceImport,
};

/// A nova keypair
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "KeyPair",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "KeyPairStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<KeyPairFilter>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<KeyPairResourceSpec>,

    #[serde(default)]
    pub management_policy: ManagementPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairResourceSpec {
    /// Name of the keypair. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Key type, `ssh` or `x509`
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub type_: Option<String>,

    /// Public key to import
    pub public_key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,

    #[serde(default, skip_serializing_if = "String::is_empty", rename = "type")]
    pub type_: String,
}

pub type KeyPairStatus = OrcStatus<KeyPairResourceStatus>;

orc_object!(
    KeyPair,
    KeyPairResourceSpec,
    KeyPairFilter,
    KeyPairResourceStatus,
    true
);
