use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    orc_object, CloudCredentialsReference, ManagedOptions, ManagementPolicy, OrcStatus,
    ResourceImport,
};

/// A glance image
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Image",
    group = "openstack.k-orc.cloud",
    version = "v1alpha1",
    status = "ImageStatus",
    namespaced,
    printcolumn = r#"{ "name": "ID", "type": "string", "description": "Resource ID", "jsonPath": ".status.id" }"#,
    printcolumn = r#"{ "name": "Available", "type": "string", "description": "Availability status of resource", "jsonPath": ".status.conditions[?(@.type=='Available')].status" }"#,
    printcolumn = r#"{ "name": "Message", "type": "string", "description": "Message describing current progress status", "jsonPath": ".status.conditions[?(@.type=='Progressing')].message" }"#,
    printcolumn = r#"{ "name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<ImageFilter>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ImageResourceSpec>,

    #[serde(default)]
    pub management_policy: ManagementPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,

    pub cloud_credentials_ref: CloudCredentialsReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageResourceSpec {
    /// Name of the image. Defaults to the object name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<ImageVisibility>,

    /// Image data, imported by glance when the image is created
    pub content: ImageContent,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageVisibility {
    Public,
    #[default]
    Private,
    Shared,
    Community,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    /// Container format, e.g. `bare`
    #[serde(default = "defaults::container_format")]
    pub container_format: String,

    /// Disk format, e.g. `qcow2` or `raw`
    pub disk_format: String,

    /// Minimum disk size in GiB required to boot the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_disk: Option<i32>,

    /// Minimum memory in MiB required to boot the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory: Option<i32>,

    pub download: ImageContentSourceDownload,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageContentSourceDownload {
    /// URL glance downloads the image data from
    pub url: String,

    /// Decompress the downloaded data before it is given to glance.
    /// Content which needs decompressing is always uploaded by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decompress: Option<ImageCompression>,

    /// Expected hash of the downloaded data, before any decompression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ImageHash>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageCompression {
    Gz,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageHashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    #[default]
    Sha512,
}

impl ImageHashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageHashAlgorithm::Md5 => "md5",
            ImageHashAlgorithm::Sha1 => "sha1",
            ImageHashAlgorithm::Sha256 => "sha256",
            ImageHashAlgorithm::Sha512 => "sha512",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageHash {
    pub algorithm: ImageHashAlgorithm,
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<ImageVisibility>,

    /// Images must have all of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Glance status, e.g. `queued`, `importing` or `active`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,

    #[serde(default)]
    pub protected: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub visibility: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Hash of the image data as computed by glance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ImageHash>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_b: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    #[serde(flatten)]
    pub common: OrcStatus<ImageResourceStatus>,

    /// How many times the controller has sent the image content to glance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_attempts: Option<i32>,
}

impl AsRef<OrcStatus<ImageResourceStatus>> for ImageStatus {
    fn as_ref(&self) -> &OrcStatus<ImageResourceStatus> {
        &self.common
    }
}

impl Image {
    pub fn download_attempts(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.download_attempts)
            .unwrap_or_default()
    }
}

orc_object!(
    Image,
    ImageResourceSpec,
    ImageFilter,
    ImageResourceStatus,
    true
);

mod defaults {
    pub fn container_format() -> String {
        "bare".into()
    }
}
