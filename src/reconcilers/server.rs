//! Servers boot from an Image with a Flavor, on Ports, and attach Volumes once active
//!
//! Every attached volume records the server's name in its `spec.attachments`,
//! written under this controller's attachment field owner.

use std::{
    collections::{BTreeMap, BTreeSet},
    mem,
};

use async_trait::async_trait;
use futures::{future, future::BoxFuture, FutureExt, StreamExt, TryStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::info;

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceReconciler, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    dependency::{is_available, Dependency},
    finalizers::{field_owner, Transaction},
    object_key,
    progress::{Outcome, ReconcileStatus},
    store::{ApplyPatch, OrcClient},
    tags::{differ, normalize},
    Context,
};
use crate::{
    osclients::{self, ComputeClient, ServerCreateOpts, ServerNetwork},
    resources::{
        Flavor, Image, KeyPair, OrcObject, Port, Server, ServerFilter, ServerResourceStatus, ServerVolumeStatus,
        Volume,
    },
    Error,
};

pub const CONTROLLER_NAME: &str = "server";

const STATUS_ACTIVE: &str = "ACTIVE";
const STATUS_ERROR: &str = "ERROR";

fn image_refs(server: &Server) -> Vec<String> {
    server.spec.resource.iter().map(|r| r.image_ref.clone()).collect()
}

fn flavor_refs(server: &Server) -> Vec<String> {
    server.spec.resource.iter().map(|r| r.flavor_ref.clone()).collect()
}

fn keypair_refs(server: &Server) -> Vec<String> {
    server
        .spec
        .resource
        .iter()
        .filter_map(|r| r.key_pair_ref.clone())
        .collect()
}

fn port_refs(server: &Server) -> Vec<String> {
    server
        .spec
        .resource
        .iter()
        .flat_map(|r| r.ports.iter().map(|p| p.port_ref.clone()))
        .collect()
}

fn volume_refs(server: &Server) -> Vec<String> {
    server
        .spec
        .resource
        .iter()
        .flat_map(|r| r.volumes.iter().map(|v| v.volume_ref.clone()))
        .collect()
}

pub const IMAGE_DEPENDENCY: Dependency<Server, Image> =
    Dependency::new(CONTROLLER_NAME, "image", image_refs, is_available);

pub const FLAVOR_DEPENDENCY: Dependency<Server, Flavor> =
    Dependency::new(CONTROLLER_NAME, "flavor", flavor_refs, is_available);

pub const KEYPAIR_DEPENDENCY: Dependency<Server, KeyPair> =
    Dependency::new(CONTROLLER_NAME, "keypair", keypair_refs, is_available);

pub const PORT_DEPENDENCY: Dependency<Server, Port> =
    Dependency::new(CONTROLLER_NAME, "port", port_refs, is_available);

pub const VOLUME_DEPENDENCY: Dependency<Server, Volume> =
    Dependency::new(CONTROLLER_NAME, "volume", volume_refs, is_available);

fn resource_name(server: &Server) -> String {
    server
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| server.name_any())
}

fn filter_query(filter: &ServerFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(name) = &filter.name {
        query.push(("name".into(), name.clone()));
    }
    if !filter.tags.is_empty() {
        query.push(("tags".into(), filter.tags.join(",")));
    }
    if !filter.tags_any.is_empty() {
        query.push(("tags-any".into(), filter.tags_any.join(",")));
    }
    query
}

/// A volume the server should have attached
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredVolume {
    name: String,
    id: String,
    device: Option<String>,
}

/// OpenStack ids of everything a server references
#[derive(Default)]
pub struct ServerReferences {
    image_id: Option<String>,
    flavor_id: Option<String>,
    key_name: Option<String>,
    /// In spec order, which is the order nova attaches them
    port_ids: Vec<String>,
    volumes: Vec<DesiredVolume>,
}

impl ServerReferences {
    fn resolve(
        server: &Server,
        images: BTreeMap<String, Image>,
        flavors: BTreeMap<String, Flavor>,
        keypairs: BTreeMap<String, KeyPair>,
        ports: BTreeMap<String, Port>,
        volumes: BTreeMap<String, Volume>,
    ) -> Self {
        fn id_of<K: OrcObject>(objects: &BTreeMap<String, K>, name: &str) -> Option<String> {
            objects.get(name)?.status_id().map(str::to_string)
        }
        let Some(spec) = &server.spec.resource else {
            return Self::default();
        };
        Self {
            image_id: id_of(&images, &spec.image_ref),
            flavor_id: id_of(&flavors, &spec.flavor_ref),
            key_name: spec.key_pair_ref.as_deref().and_then(|name| id_of(&keypairs, name)),
            port_ids: spec.ports.iter().filter_map(|p| id_of(&ports, &p.port_ref)).collect(),
            volumes: spec
                .volumes
                .iter()
                .filter_map(|v| {
                    Some(DesiredVolume {
                        name: v.volume_ref.clone(),
                        id: id_of(&volumes, &v.volume_ref)?,
                        device: v.device.clone(),
                    })
                })
                .collect(),
        }
    }
}

/// Keep the value of a resolved dependency, accumulating anything still outstanding
fn collect<T: Default>(waiting: &mut ReconcileStatus, outcome: Outcome<T>) -> T {
    match outcome {
        Ok(found) => found,
        Err(status) => {
            *waiting = mem::take(waiting).merge(status);
            T::default()
        }
    }
}

pub struct ServerActuator {
    client: ComputeClient,
    orc: OrcClient,
    references: ServerReferences,
}

impl ServerActuator {
    pub fn new(client: ComputeClient, orc: OrcClient, references: ServerReferences) -> Self {
        Self {
            client,
            orc,
            references,
        }
    }

    /// Write the set of servers recorded on a volume
    async fn record_attachments(&self, volume: &Volume, servers: BTreeSet<String>) -> crate::Result<()> {
        let (namespace, name) = object_key(volume)?;
        let body = json!({
            "apiVersion": Volume::api_version(&()),
            "kind": Volume::kind(&()),
            "metadata": { "name": name, "namespace": namespace },
            "spec": { "attachments": servers },
        });
        self.orc
            .apply::<Volume>(
                &namespace,
                &name,
                ApplyPatch::main(field_owner(CONTROLLER_NAME, Transaction::Attachment), body),
            )
            .await
    }

    /// Record `server` on every volume it attaches and remove it from every other volume
    async fn sync_attachment_records(&self, server: &Server, attached: &BTreeSet<&str>) -> crate::Result<()> {
        let (namespace, name) = object_key(server)?;
        for volume in self.orc.list::<Volume>(&namespace).await? {
            let recorded = volume.spec.attachments.iter().any(|s| *s == name);
            let wanted = attached.contains(volume.name_any().as_str());
            if recorded == wanted {
                continue;
            }
            let mut servers: BTreeSet<String> = volume.spec.attachments.iter().cloned().collect();
            if wanted {
                servers.insert(name.clone());
            } else {
                servers.remove(&name);
            }
            self.record_attachments(&volume, servers).await?;
        }
        Ok(())
    }
}

/// A server in error state will not recover by itself
fn check_error<'a>(
    _actuator: &'a ServerActuator,
    _server: &'a Server,
    resource: &'a osclients::Server,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        if resource.status != STATUS_ERROR {
            return ReconcileStatus::new();
        }
        let message = match &resource.fault {
            Some(fault) if !fault.message.is_empty() => format!("server is in error state: {}", fault.message),
            _ => "server is in error state".to_string(),
        };
        ReconcileStatus::new().with_error(Error::unrecoverable(message))
    }
    .boxed()
}

fn reconcile_tags<'a>(
    actuator: &'a ServerActuator,
    server: &'a Server,
    resource: &'a osclients::Server,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        let desired = server.spec.resource.as_ref().map(|r| r.tags.as_slice()).unwrap_or_default();
        if !differ(desired, &resource.tags) {
            return ReconcileStatus::new();
        }
        let tags = normalize(desired);
        info!(id = %resource.id, ?tags, "updating server tags");
        match actuator.client.replace_server_tags(&resource.id, &tags).await {
            Ok(()) => ReconcileStatus::new().needs_refresh(),
            Err(e) => request_failed(e),
        }
    }
    .boxed()
}

/// Attach and detach volumes until nova reports exactly the volumes in the spec
fn reconcile_volumes<'a>(
    actuator: &'a ServerActuator,
    server: &'a Server,
    resource: &'a osclients::Server,
) -> BoxFuture<'a, ReconcileStatus> {
    async move {
        // Nova only changes attachments of running servers
        if resource.status != STATUS_ACTIVE {
            return ReconcileStatus::new();
        }
        let desired = &actuator.references.volumes;
        let observed: BTreeSet<&str> = resource.volumes_attached.iter().map(|v| v.id.as_str()).collect();
        let wanted: BTreeSet<&str> = desired.iter().map(|v| v.id.as_str()).collect();

        let mut status = ReconcileStatus::new();
        let mut changed = false;
        for volume in desired.iter().filter(|v| !observed.contains(v.id.as_str())) {
            info!(server = %resource.id, volume = %volume.id, "attaching volume");
            match actuator
                .client
                .attach_volume(&resource.id, &volume.id, volume.device.as_deref())
                .await
            {
                Ok(()) => changed = true,
                Err(e) => status = status.merge(request_failed(e)),
            }
        }
        for id in observed.difference(&wanted) {
            info!(server = %resource.id, volume = %id, "detaching volume");
            match actuator.client.detach_volume(&resource.id, id).await {
                Ok(()) => changed = true,
                Err(e) if e.is_not_found() => changed = true,
                Err(e) => status = status.merge(request_failed(e)),
            }
        }

        let attached: BTreeSet<&str> = desired.iter().map(|v| v.name.as_str()).collect();
        if let Err(e) = actuator.sync_attachment_records(server, &attached).await {
            status = status.with_error(e);
        }
        if changed {
            status = status.needs_refresh();
        }
        status
    }
    .boxed()
}

#[async_trait]
impl Actuator<Server> for ServerActuator {
    type OsResource = osclients::Server;

    fn resource_id(resource: &osclients::Server) -> &str {
        &resource.id
    }

    fn resource_status(&self, resource: &osclients::Server) -> ServerResourceStatus {
        ServerResourceStatus {
            name: resource.name.clone(),
            host_id: resource.host_id.clone(),
            status: resource.status.clone(),
            image_id: resource.image_id().unwrap_or_default().to_string(),
            volumes: resource
                .volumes_attached
                .iter()
                .map(|v| ServerVolumeStatus { id: v.id.clone() })
                .collect(),
            tags: normalize(&resource.tags),
        }
    }

    fn is_available(&self, resource: &osclients::Server) -> bool {
        resource.status == STATUS_ACTIVE
    }

    async fn get_by_id(&self, id: &str) -> osclients::Result<Option<osclients::Server>> {
        self.client.get_server(id).await
    }

    fn list_for_adoption(&self, server: &Server) -> Option<ResourceStream<osclients::Server>> {
        server.spec.resource.as_ref()?;
        let name = resource_name(server);
        // Nova matches names as a regular expression
        let query = [("name".to_string(), format!("^{}$", regex_escape(&name)))];
        Some(
            self.client
                .list_servers(&query)
                .try_filter(move |found| future::ready(found.name == name))
                .boxed(),
        )
    }

    fn list_for_import(&self, _server: &Server, filter: &ServerFilter) -> ResourceStream<osclients::Server> {
        self.client.list_servers(&filter_query(filter))
    }

    async fn create(&self, server: &Server) -> Outcome<osclients::Server> {
        let spec = server.spec.resource.clone().unwrap_or_default();
        let refs = &self.references;
        let (Some(image_ref), Some(flavor_ref)) = (refs.image_id.clone(), refs.flavor_id.clone()) else {
            return Err(Error::unrecoverable("server references were not resolved").into());
        };
        let opts = ServerCreateOpts {
            name: resource_name(server),
            image_ref,
            flavor_ref,
            key_name: refs.key_name.clone(),
            networks: refs.port_ids.iter().map(|port| ServerNetwork { port: port.clone() }).collect(),
            tags: normalize(&spec.tags),
        };
        self.client.create_server(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _server: &Server, resource: &osclients::Server) -> ReconcileStatus {
        delete_result(self.client.delete_server(&resource.id).await)
    }

    /// Volumes no longer record a server which is going away
    async fn delete_companions(&self, server: &Server) -> ReconcileStatus {
        match self.sync_attachment_records(server, &BTreeSet::new()).await {
            Ok(()) => ReconcileStatus::new(),
            Err(e) => ReconcileStatus::new().with_error(e),
        }
    }

    fn reconcilers(&self) -> Vec<ResourceReconciler<Self, Server>> {
        vec![check_error, reconcile_tags, reconcile_volumes]
    }
}

fn regex_escape(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct ServerFactory;

#[async_trait]
impl ActuatorFactory<Server> for ServerFactory {
    type Actuator = ServerActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, server: &Server) -> Outcome<ServerActuator> {
        let orc = &ctx.orc;
        let mut waiting = ReconcileStatus::new();
        let images = collect(&mut waiting, IMAGE_DEPENDENCY.get_guarded_dependencies(orc, server).await);
        let flavors = collect(&mut waiting, FLAVOR_DEPENDENCY.get_guarded_dependencies(orc, server).await);
        let keypairs = collect(&mut waiting, KEYPAIR_DEPENDENCY.get_guarded_dependencies(orc, server).await);
        let ports = collect(&mut waiting, PORT_DEPENDENCY.get_guarded_dependencies(orc, server).await);
        let volumes = collect(&mut waiting, VOLUME_DEPENDENCY.get_guarded_dependencies(orc, server).await);
        if !waiting.is_complete() {
            return Err(waiting);
        }
        let references = ServerReferences::resolve(server, images, flavors, keypairs, ports, volumes);
        let scope = credentials::scope(ctx, CONTROLLER_NAME, server).await?;
        Ok(ServerActuator::new(scope.compute()?, ctx.orc.clone(), references))
    }

    async fn delete_actuator(&self, ctx: &Context, server: &Server) -> Outcome<ServerActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, server).await?;
        Ok(ServerActuator::new(scope.compute()?, ctx.orc.clone(), ServerReferences::default()))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<Server>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .depends_on(IMAGE_DEPENDENCY)
        .depends_on(FLAVOR_DEPENDENCY)
        .depends_on(KEYPAIR_DEPENDENCY)
        .depends_on(PORT_DEPENDENCY)
        .depends_on(VOLUME_DEPENDENCY)
        .run(ServerFactory)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::{delete, post},
        Json, Router,
    };
    use serde_json::Value;

    use super::*;
    use crate::{
        osclients::{testing, ServiceClient},
        reconcilers::testing::{credentials, TestContext},
        resources::{ServerPortSpec, ServerResourceSpec, ServerSpec, ServerVolumeSpec, VolumeSpec},
    };

    type Calls = Arc<Mutex<Vec<String>>>;

    fn server() -> Server {
        let mut server = Server::new(
            "vm",
            ServerSpec {
                resource: Some(ServerResourceSpec {
                    image_ref: "cirros".into(),
                    flavor_ref: "small".into(),
                    key_pair_ref: Some("deployer".into()),
                    ports: vec![
                        ServerPortSpec { port_ref: "port-b".into() },
                        ServerPortSpec { port_ref: "port-a".into() },
                    ],
                    volumes: vec![ServerVolumeSpec {
                        volume_ref: "data".into(),
                        device: None,
                    }],
                    ..Default::default()
                }),
                cloud_credentials_ref: credentials(),
                ..Default::default()
            },
        );
        server.metadata.namespace = Some("default".into());
        server
    }

    fn volume(name: &str, attachments: &[&str]) -> Volume {
        let mut volume = Volume::new(
            name,
            VolumeSpec {
                attachments: attachments.iter().map(|s| s.to_string()).collect(),
                cloud_credentials_ref: credentials(),
                ..Default::default()
            },
        );
        volume.metadata.namespace = Some("default".into());
        volume
    }

    fn nova_server(status: &str, attached: &[&str]) -> osclients::Server {
        serde_json::from_value(json!({
            "id": "s1",
            "name": "vm",
            "status": status,
            "image": {"id": "img-id"},
            "os-extended-volumes:volumes_attached": attached.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    fn actuator(test: &TestContext, base: &str, references: ServerReferences) -> ServerActuator {
        ServerActuator::new(
            ComputeClient::new(ServiceClient::new(reqwest::Client::new(), base, "t")),
            test.ctx.orc.clone(),
            references,
        )
    }

    #[tokio::test]
    async fn servers_wait_for_every_reference() {
        let test = TestContext::new();
        let status = ServerFactory.create_actuator(&test.ctx, &server()).await.err().unwrap();
        assert_eq!(
            status.messages(),
            vec![
                "waiting for Flavor/small to exist".to_string(),
                "waiting for Image/cirros to exist".to_string(),
                "waiting for KeyPair/deployer to exist".to_string(),
                "waiting for Port/port-a to exist".to_string(),
                "waiting for Port/port-b to exist".to_string(),
                "waiting for Volume/data to exist".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn create_boots_on_ports_in_spec_order() {
        let captured: Arc<Mutex<Vec<Value>>> = Default::default();
        async fn create(State(captured): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>) -> Json<Value> {
            captured.lock().unwrap().push(body);
            Json(json!({"server": {"id": "s1", "adminPass": "secret"}}))
        }
        let base = testing::serve(
            Router::new()
                .route("/servers", post(create))
                .with_state(captured.clone()),
        )
        .await;
        let test = TestContext::new();
        let references = ServerReferences {
            image_id: Some("img-id".into()),
            flavor_id: Some("flv-id".into()),
            key_name: Some("deployer".into()),
            port_ids: vec!["p2".into(), "p1".into()],
            volumes: Vec::new(),
        };

        let created = actuator(&test, &base, references).create(&server()).await.unwrap();
        assert_eq!(created.status, "BUILD");
        assert_eq!(
            captured.lock().unwrap()[0],
            json!({"server": {
                "name": "vm",
                "imageRef": "img-id",
                "flavorRef": "flv-id",
                "key_name": "deployer",
                "networks": [{"port": "p2"}, {"port": "p1"}],
            }})
        );
    }

    #[tokio::test]
    async fn volumes_follow_the_spec_and_are_recorded() {
        let calls: Calls = Default::default();
        async fn attach(State(calls): State<Calls>, Path(id): Path<String>, Json(body): Json<Value>) -> StatusCode {
            let volume = body["volumeAttachment"]["volumeId"].as_str().unwrap_or_default().to_string();
            calls.lock().unwrap().push(format!("attach {volume} to {id}"));
            StatusCode::ACCEPTED
        }
        async fn detach(State(calls): State<Calls>, Path((id, volume)): Path<(String, String)>) -> StatusCode {
            calls.lock().unwrap().push(format!("detach {volume} from {id}"));
            StatusCode::ACCEPTED
        }
        let base = testing::serve(
            Router::new()
                .route("/servers/:id/os-volume_attachments", post(attach))
                .route("/servers/:id/os-volume_attachments/:volume", delete(detach))
                .with_state(calls.clone()),
        )
        .await;

        let test = TestContext::new();
        test.store.insert(&volume("data", &["other-vm"]));
        test.store.insert(&volume("old", &["vm"]));
        let references = ServerReferences {
            volumes: vec![DesiredVolume {
                name: "data".into(),
                id: "v1".into(),
                device: None,
            }],
            ..Default::default()
        };
        let actuator = actuator(&test, &base, references);

        let status = reconcile_volumes(&actuator, &server(), &nova_server("ACTIVE", &["v9"])).await;
        assert_eq!(status.messages(), vec!["resource status will be refreshed".to_string()]);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["attach v1 to s1".to_string(), "detach v9 from s1".to_string()]
        );

        let data = test.store.object::<Volume>("default", "data").unwrap();
        assert_eq!(data.spec.attachments, vec!["other-vm".to_string(), "vm".to_string()]);
        let old = test.store.object::<Volume>("default", "old").unwrap();
        assert!(old.spec.attachments.is_empty());
    }

    #[tokio::test]
    async fn attachments_wait_for_an_active_server() {
        let test = TestContext::new();
        let references = ServerReferences {
            volumes: vec![DesiredVolume {
                name: "data".into(),
                id: "v1".into(),
                device: None,
            }],
            ..Default::default()
        };
        // The client points nowhere, so any call would fail
        let actuator = actuator(&test, "http://127.0.0.1:9", references);
        assert!(reconcile_volumes(&actuator, &server(), &nova_server("BUILD", &[]))
            .await
            .is_complete());
    }

    #[tokio::test]
    async fn errored_servers_report_the_fault() {
        let test = TestContext::new();
        let actuator = actuator(&test, "http://127.0.0.1:9", ServerReferences::default());
        let mut resource = nova_server("ERROR", &[]);
        resource.fault = Some(osclients::ServerFault {
            message: "No valid host was found".into(),
        });
        let status = check_error(&actuator, &server(), &resource).await;
        assert_eq!(
            status.terminal_error().map(ToString::to_string).as_deref(),
            Some("server is in error state: No valid host was found")
        );
        assert_eq!(actuator.resource_status(&resource).image_id, "img-id");
    }

    #[test]
    fn adoption_names_are_anchored_literals() {
        assert_eq!(regex_escape("vm.1"), "vm\\.1");
        assert_eq!(regex_escape("web"), "web");
    }
}
