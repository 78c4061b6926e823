use std::collections::BTreeMap;

use futures::stream::BoxStream;
use reqwest::{Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Result, ServiceClient};

/// Glance v2 API
#[derive(Clone, Debug)]
pub struct ImageClient {
    client: ServiceClient,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub container_format: Option<String>,
    pub disk_format: Option<String>,
    pub min_disk: Option<i32>,
    pub min_ram: Option<i32>,
    pub size: Option<i64>,
    pub checksum: Option<String>,
    pub os_hash_algo: Option<String>,
    pub os_hash_value: Option<String>,
    /// Glance returns custom and `os_glance_*` properties at the top level
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl Image {
    /// Set by glance when an import task failed
    pub fn failed_import(&self) -> Option<&str> {
        self.properties
            .get("os_glance_failed_import")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn import_in_progress(&self) -> bool {
        self.properties
            .get("os_glance_importing_to_stores")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    }
}

/// Image status values
pub mod image_status {
    pub const QUEUED: &str = "queued";
    pub const SAVING: &str = "saving";
    pub const IMPORTING: &str = "importing";
    pub const ACTIVE: &str = "active";
    pub const DEACTIVATED: &str = "deactivated";
    pub const KILLED: &str = "killed";
    pub const DELETED: &str = "deleted";
    pub const PENDING_DELETE: &str = "pending_delete";
}

/// The interoperable image import methods enabled in glance
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ImportInfo {
    #[serde(rename = "import-methods", default)]
    pub import_methods: ImportMethods,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ImportMethods {
    #[serde(default)]
    pub value: Vec<String>,
}

impl ImportInfo {
    pub fn supports(&self, method: &str) -> bool {
        self.import_methods.value.iter().any(|m| m == method)
    }
}

pub const IMPORT_WEB_DOWNLOAD: &str = "web-download";

#[derive(Clone, Debug, Default, Serialize)]
pub struct ImageCreateOpts {
    pub name: String,
    pub container_format: String,
    pub disk_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_disk: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_ram: Option<i32>,
}

impl ImageClient {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    pub async fn get_image(&self, id: &str) -> Result<Option<Image>> {
        self.client.get_opt(&format!("/v2/images/{id}")).await
    }

    pub fn list_images(&self, query: &[(String, String)]) -> BoxStream<'static, Result<Image>> {
        self.client.list("/v2/images", query, "images")
    }

    pub async fn create_image(&self, opts: &ImageCreateOpts) -> Result<Image> {
        self.client.post("/v2/images", opts).await
    }

    pub async fn delete_image(&self, id: &str) -> Result<()> {
        self.client.delete(&format!("/v2/images/{id}")).await
    }

    /// Ask glance to fetch the image content from `uri`
    pub async fn import_web_download(&self, id: &str, uri: &str) -> Result<()> {
        self.client
            .post_accepted(
                &format!("/v2/images/{id}/import"),
                &json!({ "method": { "name": IMPORT_WEB_DOWNLOAD, "uri": uri } }),
            )
            .await
    }

    pub async fn import_info(&self) -> Result<ImportInfo> {
        self.client.get("/v2/info/import").await
    }

    /// Upload the image content, moving the image from `queued` through `saving`
    pub async fn upload_image_data(&self, id: &str, body: reqwest::Body) -> Result<()> {
        self.client.put_data(&format!("/v2/images/{id}/file"), body).await
    }

    /// The stored image content
    pub async fn download_image_data(&self, id: &str) -> Result<Response> {
        self.client.get_data(&format!("/v2/images/{id}/file")).await
    }

    /// Fetch image content from its source
    pub async fn fetch_content(&self, url: Url) -> Result<Response> {
        self.client.fetch_external(url).await
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::Query, routing::get, Json, Router};
    use futures::TryStreamExt;
    use std::collections::HashMap;

    use super::*;
    use crate::osclients::testing;

    #[tokio::test]
    async fn listing_follows_relative_next() {
        async fn images(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
            match query.get("marker") {
                None => Json(json!({
                    "images": [{"id": "i1", "name": "cirros", "status": "active"}],
                    "next": "/v2/images?name=cirros&marker=i1",
                })),
                Some(_) => Json(json!({
                    "images": [{"id": "i2", "name": "cirros", "status": "queued"}],
                })),
            }
        }

        let base = testing::serve(Router::new().route("/v2/images", get(images))).await;
        let client = ImageClient::new(ServiceClient::new(reqwest::Client::new(), base, "t"));

        let query = vec![("name".to_string(), "cirros".to_string())];
        let found: Vec<Image> = client.list_images(&query).try_collect().await.unwrap();
        assert_eq!(
            found.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["i1", "i2"]
        );
    }

    #[tokio::test]
    async fn import_methods_are_read_from_glance() {
        async fn info() -> Json<Value> {
            Json(json!({
                "import-methods": {
                    "description": "Import methods available.",
                    "type": "array",
                    "value": ["glance-direct", "web-download"],
                },
            }))
        }

        let base = testing::serve(Router::new().route("/v2/info/import", get(info))).await;
        let client = ImageClient::new(ServiceClient::new(reqwest::Client::new(), base, "t"));
        let info = client.import_info().await.unwrap();
        assert!(info.supports(IMPORT_WEB_DOWNLOAD));
        assert!(!info.supports("copy-image"));
    }

    #[tokio::test]
    async fn image_data_is_uploaded_as_octets() {
        use axum::{body::Bytes, extract::Path, http::HeaderMap, routing::put};
        use std::sync::{Arc, Mutex};

        let received: Arc<Mutex<Vec<(String, String, Vec<u8>)>>> = Default::default();
        async fn upload(
            axum::extract::State(received): axum::extract::State<Arc<Mutex<Vec<(String, String, Vec<u8>)>>>>,
            Path(id): Path<String>,
            headers: HeaderMap,
            body: Bytes,
        ) -> axum::http::StatusCode {
            let content_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            received.lock().unwrap().push((id, content_type, body.to_vec()));
            axum::http::StatusCode::NO_CONTENT
        }

        let base = testing::serve(
            Router::new()
                .route("/v2/images/:id/file", put(upload))
                .with_state(received.clone()),
        )
        .await;
        let client = ImageClient::new(ServiceClient::new(reqwest::Client::new(), base, "t"));
        client
            .upload_image_data("i1", reqwest::Body::from(b"qcow".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            received.lock().unwrap()[0],
            ("i1".to_string(), "application/octet-stream".to_string(), b"qcow".to_vec())
        );
    }

    #[test]
    fn failed_imports_are_surfaced() {
        let image: Image = serde_json::from_value(json!({
            "id": "i1",
            "status": "queued",
            "os_glance_failed_import": "",
            "os_glance_importing_to_stores": "local",
        }))
        .unwrap();
        assert_eq!(image.failed_import(), None);
        assert!(image.import_in_progress());

        let image: Image = serde_json::from_value(json!({
            "id": "i1",
            "status": "queued",
            "os_glance_failed_import": "local",
        }))
        .unwrap();
        assert_eq!(image.failed_import(), Some("local"));
    }
}
