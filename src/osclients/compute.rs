use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Result, ServiceClient};

/// Microversion sent with every nova request; new enough for flavor descriptions and integer swap
pub const COMPUTE_MICROVERSION: &str = "2.75";
const MICROVERSION_HEADER: &str = "X-OpenStack-Nova-API-Version";

/// Nova v2.1 API
#[derive(Clone, Debug)]
pub struct ComputeClient {
    client: ServiceClient,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "hostId", default)]
    pub host_id: String,
    /// An object with an `id`, or an empty string when booted from a volume
    #[serde(default)]
    pub image: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "os-extended-volumes:volumes_attached", default)]
    pub volumes_attached: Vec<AttachedVolume>,
    pub fault: Option<ServerFault>,
}

impl Server {
    pub fn image_id(&self) -> Option<&str> {
        self.image.get("id").and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct AttachedVolume {
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServerFault {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ServerCreateOpts {
    pub name: String,
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    pub networks: Vec<ServerNetwork>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ServerNetwork {
    pub port: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Flavor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub ram: i32,
    pub vcpus: i32,
    pub disk: i32,
    #[serde(default)]
    pub swap: i32,
    #[serde(rename = "OS-FLV-EXT-DATA:ephemeral", default)]
    pub ephemeral: i32,
    #[serde(rename = "os-flavor-access:is_public", default = "default_true")]
    pub is_public: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FlavorCreateOpts {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub ram: i32,
    pub vcpus: i32,
    pub disk: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i32>,
    #[serde(rename = "OS-FLV-EXT-DATA:ephemeral", skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<i32>,
    #[serde(rename = "os-flavor-access:is_public", skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct KeyPair {
    pub name: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(rename = "type", default)]
    pub type_: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct KeyPairCreateOpts {
    pub name: String,
    pub public_key: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct VolumeAttachment {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Deserialize)]
struct KeyPairListEntry {
    keypair: KeyPair,
}

impl ComputeClient {
    pub fn new(client: ServiceClient) -> Self {
        Self {
            client: client.with_header(MICROVERSION_HEADER, COMPUTE_MICROVERSION),
        }
    }

    pub async fn get_server(&self, id: &str) -> Result<Option<Server>> {
        self.client.get_resource(&format!("/servers/{id}"), "server").await
    }

    pub fn list_servers(&self, query: &[(String, String)]) -> BoxStream<'static, Result<Server>> {
        self.client.list("/servers/detail", query, "servers")
    }

    pub async fn create_server(&self, opts: &ServerCreateOpts) -> Result<Server> {
        #[derive(Deserialize)]
        struct CreatedServer {
            id: String,
        }
        #[derive(Deserialize)]
        struct Created {
            server: CreatedServer,
        }
        // The create response only carries the id and admin password
        let created: Created = self.client.post("/servers", &json!({ "server": opts })).await?;
        Ok(Server {
            id: created.server.id,
            name: opts.name.clone(),
            status: "BUILD".to_string(),
            tags: opts.tags.clone(),
            ..Default::default()
        })
    }

    pub async fn delete_server(&self, id: &str) -> Result<()> {
        self.client.delete(&format!("/servers/{id}")).await
    }

    pub async fn replace_server_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        let _: Value = self
            .client
            .put(&format!("/servers/{id}/tags"), &json!({ "tags": tags }))
            .await?;
        Ok(())
    }

    pub async fn list_volume_attachments(&self, server_id: &str) -> Result<Vec<VolumeAttachment>> {
        let mut body: Value = self
            .client
            .get(&format!("/servers/{server_id}/os-volume_attachments"))
            .await?;
        Ok(serde_json::from_value(body["volumeAttachments"].take())?)
    }

    pub async fn attach_volume(&self, server_id: &str, volume_id: &str, device: Option<&str>) -> Result<()> {
        let mut attachment = json!({ "volumeId": volume_id });
        if let Some(device) = device {
            attachment["device"] = json!(device);
        }
        self.client
            .post_accepted(
                &format!("/servers/{server_id}/os-volume_attachments"),
                &json!({ "volumeAttachment": attachment }),
            )
            .await
    }

    pub async fn detach_volume(&self, server_id: &str, volume_id: &str) -> Result<()> {
        self.client
            .delete(&format!("/servers/{server_id}/os-volume_attachments/{volume_id}"))
            .await
    }

    pub async fn get_flavor(&self, id: &str) -> Result<Option<Flavor>> {
        self.client.get_resource(&format!("/flavors/{id}"), "flavor").await
    }

    pub fn list_flavors(&self, query: &[(String, String)]) -> BoxStream<'static, Result<Flavor>> {
        self.client.list("/flavors/detail", query, "flavors")
    }

    pub async fn create_flavor(&self, opts: &FlavorCreateOpts) -> Result<Flavor> {
        self.client.create_resource("/flavors", "flavor", opts).await
    }

    pub async fn delete_flavor(&self, id: &str) -> Result<()> {
        self.client.delete(&format!("/flavors/{id}")).await
    }

    /// Key pairs are addressed by name
    pub async fn get_keypair(&self, name: &str) -> Result<Option<KeyPair>> {
        self.client
            .get_resource(&format!("/os-keypairs/{name}"), "keypair")
            .await
    }

    pub fn list_keypairs(&self) -> BoxStream<'static, Result<KeyPair>> {
        self.client
            .list::<KeyPairListEntry>("/os-keypairs", &[], "keypairs")
            .map_ok(|entry| entry.keypair)
            .boxed()
    }

    pub async fn create_keypair(&self, opts: &KeyPairCreateOpts) -> Result<KeyPair> {
        self.client.create_resource("/os-keypairs", "keypair", opts).await
    }

    pub async fn delete_keypair(&self, name: &str) -> Result<()> {
        self.client.delete(&format!("/os-keypairs/{name}")).await
    }
}
