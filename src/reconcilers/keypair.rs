//! Key pairs have no id of their own: the name is the OpenStack id

use async_trait::async_trait;
use futures::{future, StreamExt, TryStreamExt};
use kube::{Client, ResourceExt};

use super::{
    actuator::{delete_result, request_failed, Actuator, ActuatorFactory, ResourceStream},
    controller::ControllerBuilder,
    credentials,
    progress::{Outcome, ReconcileStatus},
    Context,
};
use crate::{
    osclients::{self, ComputeClient, KeyPairCreateOpts},
    resources::{KeyPair, KeyPairFilter, KeyPairResourceStatus},
};

pub const CONTROLLER_NAME: &str = "keypair";

fn resource_name(keypair: &KeyPair) -> String {
    keypair
        .spec
        .resource
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| keypair.name_any())
}

pub struct KeyPairActuator {
    client: ComputeClient,
}

impl KeyPairActuator {
    pub fn new(client: ComputeClient) -> Self {
        Self { client }
    }

    fn named(&self, name: String) -> ResourceStream<osclients::KeyPair> {
        self.client
            .list_keypairs()
            .try_filter(move |found| future::ready(found.name == name))
            .boxed()
    }
}

#[async_trait]
impl Actuator<KeyPair> for KeyPairActuator {
    type OsResource = osclients::KeyPair;

    const UUID_IDS: bool = false;

    fn resource_id(resource: &osclients::KeyPair) -> &str {
        &resource.name
    }

    fn resource_status(&self, resource: &osclients::KeyPair) -> KeyPairResourceStatus {
        KeyPairResourceStatus {
            name: resource.name.clone(),
            fingerprint: resource.fingerprint.clone(),
            public_key: resource.public_key.clone(),
            type_: resource.type_.clone(),
        }
    }

    async fn get_by_id(&self, name: &str) -> osclients::Result<Option<osclients::KeyPair>> {
        self.client.get_keypair(name).await
    }

    fn list_for_adoption(&self, keypair: &KeyPair) -> Option<ResourceStream<osclients::KeyPair>> {
        keypair.spec.resource.as_ref()?;
        Some(self.named(resource_name(keypair)))
    }

    fn list_for_import(&self, _keypair: &KeyPair, filter: &KeyPairFilter) -> ResourceStream<osclients::KeyPair> {
        match &filter.name {
            Some(name) => self.named(name.clone()),
            None => self.client.list_keypairs(),
        }
    }

    async fn create(&self, keypair: &KeyPair) -> Outcome<osclients::KeyPair> {
        let spec = keypair.spec.resource.clone().unwrap_or_default();
        let opts = KeyPairCreateOpts {
            name: resource_name(keypair),
            public_key: spec.public_key,
            type_: spec.type_,
        };
        self.client.create_keypair(&opts).await.map_err(request_failed)
    }

    async fn delete(&self, _keypair: &KeyPair, resource: &osclients::KeyPair) -> ReconcileStatus {
        delete_result(self.client.delete_keypair(&resource.name).await)
    }
}

pub struct KeyPairFactory;

#[async_trait]
impl ActuatorFactory<KeyPair> for KeyPairFactory {
    type Actuator = KeyPairActuator;

    const CONTROLLER_NAME: &'static str = CONTROLLER_NAME;

    async fn create_actuator(&self, ctx: &Context, keypair: &KeyPair) -> Outcome<KeyPairActuator> {
        let scope = credentials::scope(ctx, CONTROLLER_NAME, keypair).await?;
        Ok(KeyPairActuator::new(scope.compute()?))
    }

    async fn delete_actuator(&self, ctx: &Context, keypair: &KeyPair) -> Outcome<KeyPairActuator> {
        let scope = credentials::scope_for_delete(ctx, CONTROLLER_NAME, keypair).await?;
        Ok(KeyPairActuator::new(scope.compute()?))
    }
}

pub async fn run(client: Client, ctx: Context, concurrency: u16) {
    ControllerBuilder::<KeyPair>::new(client, ctx, CONTROLLER_NAME, concurrency)
        .credentials()
        .run(KeyPairFactory)
        .await
}

#[cfg(test)]
mod tests {
    use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        osclients::{testing, ServiceClient},
        reconcilers::{actuator::get_or_create, testing::TestContext},
        resources::{KeyPairResourceSpec, KeyPairSpec, ResourceImport},
    };

    fn keypair() -> KeyPair {
        let mut keypair = KeyPair::new(
            "deployer",
            KeyPairSpec {
                resource: Some(KeyPairResourceSpec {
                    public_key: "ssh-ed25519 AAAA deployer".into(),
                    ..Default::default()
                }),
                cloud_credentials_ref: crate::reconcilers::testing::credentials(),
                ..Default::default()
            },
        );
        keypair.metadata.namespace = Some("default".into());
        keypair
    }

    async fn fake_nova() -> KeyPairActuator {
        async fn list() -> Json<Value> {
            Json(json!({"keypairs": [{"keypair": {"name": "other", "fingerprint": "aa"}}]}))
        }
        async fn create(Json(body): Json<Value>) -> Json<Value> {
            let name = body["keypair"]["name"].clone();
            Json(json!({"keypair": {"name": name, "fingerprint": "bb", "public_key": body["keypair"]["public_key"]}}))
        }
        async fn get_one(Path(name): Path<String>) -> (StatusCode, Json<Value>) {
            if name == "deployer" {
                (StatusCode::OK, Json(json!({"keypair": {"name": name, "fingerprint": "bb"}})))
            } else {
                (StatusCode::NOT_FOUND, Json(json!({})))
            }
        }
        let base = testing::serve(
            Router::new()
                .route("/os-keypairs", get(list).post(create))
                .route("/os-keypairs/:name", get(get_one)),
        )
        .await;
        KeyPairActuator::new(ComputeClient::new(ServiceClient::new(reqwest::Client::new(), base, "t")))
    }

    #[tokio::test]
    async fn created_keypairs_are_recorded_by_name() {
        let test = TestContext::new();
        test.store.insert(&keypair());
        let object = test.store.object::<KeyPair>("default", "deployer").unwrap();
        let actuator = fake_nova().await;

        let created = get_or_create(&test.ctx, CONTROLLER_NAME, &actuator, &object).await.unwrap();
        assert_eq!(created.fingerprint, "bb");
        let stored = test.store.object::<KeyPair>("default", "deployer").unwrap();
        assert_eq!(stored.status.and_then(|s| s.id).as_deref(), Some("deployer"));
    }

    #[tokio::test]
    async fn non_uuid_import_ids_are_accepted() {
        let test = TestContext::new();
        let mut object = keypair();
        object.spec.resource = None;
        object.spec.import = Some(ResourceImport {
            id: Some("deployer".into()),
            filter: None,
        });
        test.store.insert(&object);
        let object = test.store.object::<KeyPair>("default", "deployer").unwrap();

        let found = get_or_create(&test.ctx, CONTROLLER_NAME, &fake_nova().await, &object)
            .await
            .unwrap();
        assert_eq!(found.name, "deployer");
    }
}
