use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use lru::LruCache;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    osclients::{
        self, AuthMethod, Catalog, ComputeClient, DomainSelector, IdentityClient, ImageClient,
        NetworkingClient, ProjectSelector, ServiceClient, VolumeClient,
    },
    Error, Metrics, Result,
};

/// Secret key holding the clouds.yaml document
pub const CLOUDS_YAML_KEY: &str = "clouds.yaml";

/// Optional secret key holding a PEM bundle trusted in addition to the system roots
pub const CACERT_KEY: &str = "cacert";

/// Scopes whose token expires sooner than this are re-authenticated
fn expiry_margin() -> Duration {
    Duration::minutes(5)
}

#[derive(Deserialize)]
struct CloudsYaml {
    clouds: HashMap<String, Cloud>,
}

/// One entry of a clouds.yaml document
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Cloud {
    pub auth: CloudAuth,
    pub auth_type: Option<String>,
    pub region_name: Option<String>,
    pub interface: Option<String>,
    pub endpoint_type: Option<String>,
    pub verify: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CloudAuth {
    pub auth_url: String,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub password: Option<String>,
    pub project_name: Option<String>,
    pub project_id: Option<String>,
    pub project_domain_name: Option<String>,
    pub project_domain_id: Option<String>,
    pub user_domain_name: Option<String>,
    pub user_domain_id: Option<String>,
    pub domain_name: Option<String>,
    pub domain_id: Option<String>,
    pub application_credential_id: Option<String>,
    pub application_credential_name: Option<String>,
    pub application_credential_secret: Option<String>,
}

impl Cloud {
    /// Select `cloud_name` from a clouds.yaml document
    pub fn from_clouds_yaml(document: &[u8], cloud_name: &str) -> Result<Self> {
        let mut parsed: CloudsYaml = serde_yaml::from_slice(document)?;
        parsed
            .clouds
            .remove(cloud_name)
            .ok_or_else(|| Error::Credentials(format!("cloud {cloud_name:?} not found in {CLOUDS_YAML_KEY}")))
    }

    /// Endpoint interface, accepting the legacy `publicURL` spelling
    pub fn interface(&self) -> String {
        let interface = self
            .interface
            .as_deref()
            .or(self.endpoint_type.as_deref())
            .unwrap_or("public");
        interface.trim_end_matches("URL").to_string()
    }

    pub fn auth_method(&self) -> Result<AuthMethod> {
        let auth = &self.auth;
        // domain_name/domain_id are shorthand for both user and project domains
        let user_domain = DomainSelector {
            id: auth.user_domain_id.clone().or(auth.domain_id.clone()),
            name: auth.user_domain_name.clone().or(auth.domain_name.clone()),
        };

        match self.auth_type.as_deref().unwrap_or("password") {
            "v3applicationcredential" => {
                let secret = auth.application_credential_secret.clone().ok_or_else(|| {
                    Error::Credentials("application_credential_secret is required".into())
                })?;
                if auth.application_credential_id.is_none() && auth.application_credential_name.is_none() {
                    return Err(Error::Credentials(
                        "one of application_credential_id or application_credential_name is required".into(),
                    ));
                }
                Ok(AuthMethod::ApplicationCredential {
                    id: auth.application_credential_id.clone(),
                    name: auth.application_credential_name.clone(),
                    secret,
                    username: auth.username.clone(),
                    user_domain,
                })
            }
            "password" | "v3password" => {
                let password = auth
                    .password
                    .clone()
                    .ok_or_else(|| Error::Credentials("password is required".into()))?;
                if auth.username.is_none() && auth.user_id.is_none() {
                    return Err(Error::Credentials("one of username or user_id is required".into()));
                }
                let project = (auth.project_id.is_some() || auth.project_name.is_some()).then(|| ProjectSelector {
                    id: auth.project_id.clone(),
                    name: auth.project_name.clone(),
                    domain: DomainSelector {
                        id: auth.project_domain_id.clone().or(auth.domain_id.clone()),
                        name: auth.project_domain_name.clone().or(auth.domain_name.clone()),
                    },
                });
                Ok(AuthMethod::Password {
                    username: auth.username.clone(),
                    user_id: auth.user_id.clone(),
                    password,
                    user_domain,
                    project,
                })
            }
            other => Err(Error::Credentials(format!("unsupported auth_type {other:?}"))),
        }
    }
}

/// An authenticated session against one cloud
pub struct Scope {
    http: reqwest::Client,
    token: String,
    expires_at: DateTime<Utc>,
    project_id: Option<String>,
    catalog: Catalog,
    region: Option<String>,
    interface: String,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("expires_at", &self.expires_at)
            .field("project_id", &self.project_id)
            .field("region", &self.region)
            .field("interface", &self.interface)
            .finish_non_exhaustive()
    }
}

impl Scope {
    /// Authenticate with the credentials in `secret`
    pub async fn authenticate(secret: &Secret, cloud_name: &str) -> Result<Self> {
        let data = secret.data.clone().unwrap_or_default();
        let document = data.get(CLOUDS_YAML_KEY).ok_or_else(|| {
            Error::Credentials(format!(
                "secret {} does not contain key {CLOUDS_YAML_KEY}",
                secret.name_any()
            ))
        })?;
        let cloud = Cloud::from_clouds_yaml(&document.0, cloud_name)?;

        let mut builder = reqwest::Client::builder();
        if let Some(cacert) = data.get(CACERT_KEY) {
            let cert = reqwest::Certificate::from_pem(&cacert.0)
                .map_err(|e| Error::Credentials(format!("parsing {CACERT_KEY}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if cloud.verify == Some(false) {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Scope(format!("building HTTP client: {e}")))?;

        let token = osclients::authenticate(&http, &cloud.auth.auth_url, &cloud.auth_method()?).await?;
        info!(cloud = cloud_name, expires_at = %token.expires_at, "authenticated");

        Ok(Self {
            http,
            token: token.value,
            expires_at: token.expires_at,
            project_id: token.project_id,
            catalog: token.catalog,
            interface: cloud.interface(),
            region: cloud.region_name,
        })
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now < expiry_margin()
    }

    fn service(&self, service_types: &[&str]) -> Result<ServiceClient> {
        let endpoint = self
            .catalog
            .endpoint(service_types, self.region.as_deref(), &self.interface)?;
        Ok(ServiceClient::new(self.http.clone(), endpoint, self.token.clone()))
    }

    pub fn networking(&self) -> Result<NetworkingClient> {
        self.service(&["network"]).map(NetworkingClient::new)
    }

    pub fn compute(&self) -> Result<ComputeClient> {
        self.service(&["compute"]).map(ComputeClient::new)
    }

    pub fn image(&self) -> Result<ImageClient> {
        self.service(&["image"]).map(ImageClient::new)
    }

    pub fn volume(&self) -> Result<VolumeClient> {
        self.service(&["block-storage", "volumev3"]).map(VolumeClient::new)
    }

    pub fn identity(&self) -> Result<IdentityClient> {
        self.service(&["identity"]).map(IdentityClient::new)
    }
}

/// A stable hash of everything that determines the session for `secret` and `cloud_name`
pub fn fingerprint(secret: &Secret, cloud_name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    let data: BTreeMap<_, _> = secret.data.clone().unwrap_or_default();
    for (key, value) in &data {
        key.hash(&mut hasher);
        value.0.hash(&mut hasher);
    }
    cloud_name.hash(&mut hasher);
    hasher.finish()
}

type SecretKey = (String, String, String);

/// Bounded cache of authenticated scopes, shared by every controller
pub struct ScopeCache {
    scopes: Mutex<LruCache<u64, Arc<Scope>>>,
    by_secret: Mutex<HashMap<SecretKey, u64>>,
    metrics: Metrics,
}

impl ScopeCache {
    pub fn new(capacity: NonZeroUsize, metrics: Metrics) -> Self {
        Self {
            scopes: Mutex::new(LruCache::new(capacity)),
            by_secret: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Return a scope for `cloud_name` in `secret`, authenticating on a miss
    pub async fn get(&self, secret: &Secret, cloud_name: &str) -> Result<Arc<Scope>> {
        let key = fingerprint(secret, cloud_name);
        self.track(secret, cloud_name, key);

        let cached = self
            .scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(scope) = cached {
            if !scope.expires_soon(Utc::now()) {
                self.metrics.scope_cache_hits.inc();
                return Ok(scope);
            }
            debug!(cloud = cloud_name, "cached token is about to expire");
        }

        self.metrics.scope_cache_misses.inc();
        let scope = Arc::new(Scope::authenticate(secret, cloud_name).await?);
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, scope.clone());
        Ok(scope)
    }

    /// Drop every scope derived from the named secret
    pub fn evict_secret(&self, namespace: &str, name: &str) {
        let mut by_secret = self.by_secret.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        by_secret.retain(|(ns, n, _), key| {
            let matches = ns == namespace && n == name;
            if matches {
                scopes.pop(key);
            }
            !matches
        });
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remember which fingerprint a secret currently maps to, evicting the previous one when its contents changed
    fn track(&self, secret: &Secret, cloud_name: &str, key: u64) {
        let secret_key = (
            secret.namespace().unwrap_or_default(),
            secret.name_any(),
            cloud_name.to_string(),
        );
        let previous = self
            .by_secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(secret_key, key);
        if let Some(previous) = previous.filter(|p| *p != key) {
            debug!(secret = secret.name_any(), "credentials changed, evicting scope");
            self.scopes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop(&previous);
        }
    }
}
