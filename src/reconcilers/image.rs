//! Images are created empty, then glance imports their content with
//! `web-download` or the controller streams it to glance itself

use std::time::Duration;

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    finalizers::{field_owner, Transaction},
    image_content::{hash_stream, pump, ContentTransfer, TransferError},
    object_key,
    progress::{Outcome, ReconcileStatus},
    status::object_identity,
    store::{ApplyPatch, ObjectEvent, OrcClient},
    Context,
};
use crate::{
    osclients::{self, image_status, ImageClient, ImageCreateOpts, IMPORT_WEB_DOWNLOAD},
    resources::{
        Image, ImageContentSourceDownload, ImageFilter, ImageHash, ImageHashAlgorithm, ImageResourceStatus,
        ManagementPolicy,
    },
    Error,
};

pub const CONTROLLER_NAME: &str = "image";

/// Content is sent to glance at most this many times
const MAX_DOWNLOAD_ATTEMPTS: i32 = 5;

/// Chunks buffered between the download and the upload to glance
const TRANSFER_QUEUE_DEPTH: usize = 16;

fn resource_name(image: &Image) -> String {
    image
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| image.name_any())
}

fn filter_query(filter: &ImageFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(name) = &filter.name {
        query.push(("name".into(), name.clone()));
    }
    if let Some(visibility) = filter.visibility {
        query.push(("visibility".into(), visibility_str(visibility).to_string()));
    }
    // Glance takes one `tag` parameter per required tag
    query.extend(filter.tags.iter().map(|tag| ("tag".to_string(), tag.clone())));
    query
}

fn visibility_str(visibility: crate::resources::ImageVisibility) -> &'static str {
    use crate::resources::ImageVisibility::*;
    match visibility {
        Public => "public",
        Private => "private",
        Shared => "shared",
        Community => "community",
    }
}

fn parse_algorithm(algorithm: &str) -> Option<ImageHashAlgorithm> {
    serde_json::from_value(serde_json::Value::String(algorithm.to_string())).ok()
}

/// The hash glance computed for the image data
fn glance_hash(image: &osclients::Image) -> Option<ImageHash> {
    let algorithm = parse_algorithm(image.os_hash_algo.as_deref()?)?;
    let value = image.os_hash_value.clone().filter(|v| !v.is_empty())?;
    Some(ImageHash { algorithm, value })
}

/// The hash of the image data in `algorithm`, if glance computed one
fn observed_hash(image: &osclients::Image, algorithm: ImageHashAlgorithm) -> Option<&str> {
    let observed = if algorithm == ImageHashAlgorithm::Md5 {
        image.checksum.as_deref()
    } else {
        match image.os_hash_algo.as_deref() {
            Some(algo) if algo == algorithm.as_str() => image.os_hash_value.as_deref(),
            _ => None,
        }
    };
    observed.filter(|v| !v.is_empty())
}

fn download(image: &Image) -> Option<&ImageContentSourceDownload> {
    image.spec.resource.as_ref().map(|r| &r.content.download)
}

fn download_url(image: &Image) -> crate::Result<reqwest::Url> {
    let url = download(image).map(|d| d.url.as_str()).unwrap_or_default();
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::invalid_configuration(format!("invalid download URL {url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::invalid_configuration(format!(
            "unsupported download URL scheme {scheme:?}"
        ))),
    }
}

fn downloading_message(attempts: i32) -> String {
    match attempts {
        attempts if attempts > 1 => format!("Glance is downloading image content: attempt {attempts}"),
        _ => "Glance is downloading image content".to_string(),
    }
}

pub struct ImageActuator {
    client: ImageClient,
    orc: OrcClient,
    poll_period: Duration,
}

impl ImageActuator {
    pub fn new(client: ImageClient, orc: OrcClient, poll_period: Duration) -> Self {
        Self {
            client,
            orc,
            poll_period,
        }
    }

    fn wait_for_glance(&self, message: impl Into<String>) -> ReconcileStatus {
        ReconcileStatus::new().in_progress(message, self.poll_period)
    }

    /// Count one more transfer of the content to glance in `status.downloadAttempts`
    async fn record_download_attempt(&self, image: &Image) -> crate::Result<()> {
        let (namespace, name) = object_key(image)?;
        let patch = ApplyPatch::status(
            field_owner(CONTROLLER_NAME, Transaction::Download),
            json!({
                "apiVersion": Image::api_version(&()),
                "kind": Image::kind(&()),
                "metadata": object_identity(image),
                "status": { "downloadAttempts": image.download_attempts() + 1 },
            }),
        );
        self.orc.apply::<Image>(&namespace, &name, patch).await
    }

    async fn hash_verification_failed(&self, image: &Image, id: &str, expected: &str, got: &str) -> ReconcileStatus {
        let message = format!("download hash verification failed. got: {got}");
        warn!(%id, expected, got, "download hash verification failed");
        self.orc
            .publish(image, ObjectEvent::warning("HashVerificationFailed", "Import", message.clone()))
            .await;
        ReconcileStatus::new().resource_unusable(Error::invalid_configuration(message))
    }

    /// Content needing decompression is always uploaded by us, as is content
    /// glance cannot fetch itself
    async fn can_web_download(&self, download: &ImageContentSourceDownload) -> osclients::Result<bool> {
        if download.decompress.is_some() {
            return Ok(false);
        }
        match self.client.import_info().await {
            Ok(info) => Ok(info.supports(IMPORT_WEB_DOWNLOAD)),
            // glance without interoperable import
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Content of a queued image
    async fn start_download(&self, image: &Image, resource: &osclients::Image) -> ReconcileStatus {
        if image.spec.management_policy == ManagementPolicy::Unmanaged {
            return self.wait_for_glance("Waiting for glance image content to be uploaded externally");
        }
        if resource.import_in_progress() {
            return self.wait_for_glance(downloading_message(image.download_attempts()));
        }
        if let Some(stores) = resource.failed_import() {
            warn!(id = %resource.id, stores, "glance failed to import image content");
            self.orc
                .publish(
                    image,
                    ObjectEvent::warning("DownloadFailed", "Import", "glance failed to import image content"),
                )
                .await;
        }
        if image.download_attempts() >= MAX_DOWNLOAD_ATTEMPTS {
            return ReconcileStatus::new().with_error(Error::invalid_configuration(format!(
                "Unable to download content after {MAX_DOWNLOAD_ATTEMPTS} attempts"
            )));
        }
        let (url, download) = match (download_url(image), download(image)) {
            (Ok(url), Some(download)) => (url, download),
            (Err(e), _) => return ReconcileStatus::new().with_error(e),
            (Ok(_), None) => return ReconcileStatus::new(),
        };
        match self.can_web_download(download).await {
            Ok(true) => self.web_download(image, resource, url).await,
            Ok(false) => self.upload_content(image, resource, url, download).await,
            Err(e) => ReconcileStatus::new().with_error(e),
        }
    }

    async fn web_download(&self, image: &Image, resource: &osclients::Image, url: reqwest::Url) -> ReconcileStatus {
        info!(id = %resource.id, %url, "starting web-download import");
        match self.client.import_web_download(&resource.id, url.as_str()).await {
            Ok(()) => match self.record_download_attempt(image).await {
                Ok(()) => self.wait_for_glance(downloading_message(image.download_attempts() + 1)),
                Err(e) => ReconcileStatus::new().with_error(e),
            },
            // glance still reports queued for a moment after accepting an import
            Err(e) if e.is_conflict() => self.wait_for_glance(downloading_message(image.download_attempts())),
            Err(e) => request_failed(e),
        }
    }

    /// Stream the content from its source to glance, hashing and decompressing on the way
    async fn upload_content(
        &self,
        image: &Image,
        resource: &osclients::Image,
        url: reqwest::Url,
        download: &ImageContentSourceDownload,
    ) -> ReconcileStatus {
        info!(id = %resource.id, %url, decompress = ?download.decompress, "uploading image content");
        let source = match self.client.fetch_content(url).await {
            Ok(response) => response,
            Err(e) => return ReconcileStatus::new().with_error(e),
        };
        if let Err(e) = self.record_download_attempt(image).await {
            return ReconcileStatus::new().with_error(e);
        }

        let (sink, received) = mpsc::channel(TRANSFER_QUEUE_DEPTH);
        let transfer = ContentTransfer::new(download.hash.as_ref(), download.decompress);
        let (pumped, uploaded) = tokio::join!(
            pump(source.bytes_stream(), transfer, sink),
            self.client
                .upload_image_data(&resource.id, reqwest::Body::wrap_stream(ReceiverStream::new(received))),
        );
        match (pumped, uploaded) {
            (Err(TransferError::HashMismatch(got)), _) => {
                let expected = download.hash.as_ref().map(|h| h.value.as_str()).unwrap_or_default();
                self.hash_verification_failed(image, &resource.id, expected, &got).await
            }
            (Err(e), _) => ReconcileStatus::new().with_error(Error::ImageContent(e.to_string())),
            (Ok(_), Err(e)) if e.is_invalid_argument() => {
                ReconcileStatus::new().with_error(Error::invalid_configuration(e.server_message()))
            }
            (Ok(_), Err(e)) => ReconcileStatus::new().with_error(e),
            (Ok(bytes), Ok(())) => {
                debug!(id = %resource.id, bytes, "uploaded image content");
                ReconcileStatus::new().needs_refresh()
            }
        }
    }

    /// Check the stored content against the expected hash
    ///
    /// Decompressed content was verified while it was uploaded, since glance
    /// never saw the downloaded bytes. Otherwise glance's own hash is used when
    /// it is in the right algorithm, and the stored data is hashed when it isn't.
    async fn verify_hash(&self, image: &Image, resource: &osclients::Image) -> ReconcileStatus {
        let Some(download) = download(image) else {
            return ReconcileStatus::new();
        };
        let Some(expected) = &download.hash else {
            return ReconcileStatus::new();
        };
        if download.decompress.is_some() {
            return ReconcileStatus::new();
        }
        let got = match observed_hash(resource, expected.algorithm) {
            Some(observed) => observed.to_string(),
            None => {
                debug!(id = %resource.id, algorithm = expected.algorithm.as_str(), "hashing stored image content");
                let hashed = match self.client.download_image_data(&resource.id).await {
                    Ok(data) => hash_stream(data.bytes_stream(), expected.algorithm).await,
                    Err(e) => return ReconcileStatus::new().with_error(e),
                };
                match hashed {
                    Ok(hash) => hash,
                    Err(e) => return ReconcileStatus::new().with_error(Error::ImageContent(e.to_string())),
                }
            }
        };
        if got.eq_ignore_ascii_case(&expected.value) {
            debug!(id = %resource.id, "download hash verification succeeded");
            ReconcileStatus::new()
        } else {
            self.hash_verification_failed(image, &resource.id, &expected.value, &got)
                .await
        }
    }
}

fn reconcile_content<'a>(
    actuator: &'a ImageActuator,
    image: &'a Image,
    resource: &'a osclients::Image,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        match resource.status.as_str() {
            image_status::ACTIVE | image_status::DEACTIVATED => actuator.verify_hash(image, resource).await,
            image_status::IMPORTING | image_status::SAVING => {
                actuator.wait_for_glance(downloading_message(image.download_attempts()))
            }
            image_status::QUEUED => actuator.start_download(image, resource).await,
            image_status::KILLED => ReconcileStatus::new().with_error(Error::unrecoverable(
                "a glance error occurred while saving image content",
            )),
            image_status::DELETED | image_status::PENDING_DELETE => {
                ReconcileStatus::new().with_error(Error::unrecoverable("image status is deleting"))
            }
            status => actuator.wait_for_glance(format!("Waiting for glance image status {status:?}")),
        }
    }
    .boxed()
}

#[async_trait]
impl Actuator<Image> for ImageActuator {
    type OsResource = osclients::Image;

    fn resource_id(resource: &osclients::Image) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Image) -> ImageResourceStatus {
        ImageResourceStatus {
            name: resource.name.clone(),
            status: resource.status.clone(),
            protected: resource.protected,
            visibility: resource.visibility.clone(),
            tags: resource.tags.clone(),
            hash: glance_hash(resource),
            size_b: resource.size,
        }
    }

    fn is_available(&self, resource: &osclients::Image) -> bool {
        resource.status == image_status::ACTIVE || resource.status == image_status::DEACTIVATED
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Image>> {
        self.client.get_image(id).await
    }

    fn list_for_adoption(&self, image: &Image) -> Option<ResourceStream<osclients::Image>> {
        image.spec.resource.as_ref()?;
        Some(self.client.list_images(&[("name".into(), resource_name(image))]))
    }

    fn list_for_import(&self, _image: &Image, filter: &ImageFilter) -> ResourceStream<osclients::Image> {
        self.client.list_images(&filter_query(filter))
    }

    async fn create(&self, image: &Image) -> Outcome<osclients::Image> {
        // Reject a bad URL before leaving an empty image behind
        download_url(image)?;
        let spec = image.spec.resource.clone().unwrap_or_default();
        let opts = ImageCreateOpts {
            name: resource_name(image),
            container_format: spec.content.container_format,
            disk_format: spec.content.disk_format,
            visibility: spec.visibility.map(|v| visibility_str(v).to_string()),
            protected: spec.protected,
            tags: spec.tags,
            min_disk: spec.content.min_disk,
            min_ram: spec.content.min_memory,
        };
        self.client.create_image(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _image: &Image, resource: &osclients::Image) -> ReconcileStatus {
        delete_result(self.client.delete_image(&resource.id).await)
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Image>> {
        vec![reconcile_content]
    }
}

pub struct ImageFactory;

#[async_trait]
impl ActuatorFactory<Image> for ImageFactory {
    type Actuator = ImageActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, image: &Image) -> Outcome<ImageActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, image).await?;
        Ok(ImageActuator::new(scope.image()?, ctx.orc.clone(), ctx.poll_period))
    }

    async fn delete_actuator(&self, ctx: &Context, image: &Image) -> Outcome<ImageActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, image).await?;
        Ok(ImageActuator::new(scope.image()?, ctx.orc.clone(), ctx.poll_period))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Image>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(ImageFactory)
        .await
}
