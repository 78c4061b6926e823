use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::{Result, ServiceClient};

/// Cinder v3 API
#[derive(Clone, Debug)]
pub struct VolumeClient {
    client: ServiceClient,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Volume {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub size: i32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub attachments: Vec<VolumeServerAttachment>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct VolumeServerAttachment {
    pub server_id: String,
    pub device: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct VolumeCreateOpts {
    pub size: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl VolumeClient {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    pub async fn get_volume(&self, id: &str) -> Result<Option<Volume>> {
        self.client.get_resource(&format!("/volumes/{id}"), "volume").await
    }

    pub fn list_volumes(&self, query: &[(String, String)]) -> BoxStream<'static, Result<Volume>> {
        self.client.list("/volumes/detail", query, "volumes")
    }

    pub async fn create_volume(&self, opts: &VolumeCreateOpts) -> Result<Volume> {
        self.client.create_resource("/volumes", "volume", opts).await
    }

    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        self.client.delete(&format!("/volumes/{id}")).await
    }
}
