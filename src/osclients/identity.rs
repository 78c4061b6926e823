use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{check, Error, Result, ServiceClient};

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// How to authenticate against keystone
#[derive(Clone, Debug, PartialEq)]
pub enum AuthMethod {
    Password {
        username: Option<String>,
        user_id: Option<String>,
        password: String,
        user_domain: DomainSelector,
        project: Option<ProjectSelector>,
    },
    ApplicationCredential {
        id: Option<String>,
        name: Option<String>,
        secret: String,
        username: Option<String>,
        user_domain: DomainSelector,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DomainSelector {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl DomainSelector {
    fn to_json(&self) -> Value {
        match (&self.id, &self.name) {
            (Some(id), _) => json!({ "id": id }),
            (None, Some(name)) => json!({ "name": name }),
            (None, None) => json!({ "id": "default" }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectSelector {
    pub id: Option<String>,
    pub name: Option<String>,
    pub domain: DomainSelector,
}

impl AuthMethod {
    fn request_body(&self) -> Value {
        match self {
            AuthMethod::Password {
                username,
                user_id,
                password,
                user_domain,
                project,
            } => {
                let user = match user_id {
                    Some(id) => json!({ "id": id, "password": password }),
                    None => json!({
                        "name": username,
                        "password": password,
                        "domain": user_domain.to_json(),
                    }),
                };
                let mut auth = json!({
                    "identity": { "methods": ["password"], "password": { "user": user } },
                });
                if let Some(project) = project {
                    let scope = match &project.id {
                        Some(id) => json!({ "project": { "id": id } }),
                        None => json!({
                            "project": { "name": project.name, "domain": project.domain.to_json() },
                        }),
                    };
                    auth["scope"] = scope;
                }
                json!({ "auth": auth })
            }
            AuthMethod::ApplicationCredential {
                id,
                name,
                secret,
                username,
                user_domain,
            } => {
                let credential = match id {
                    Some(id) => json!({ "id": id, "secret": secret }),
                    None => json!({
                        "name": name,
                        "secret": secret,
                        "user": { "name": username, "domain": user_domain.to_json() },
                    }),
                };
                json!({
                    "auth": {
                        "identity": {
                            "methods": ["application_credential"],
                            "application_credential": credential,
                        },
                    },
                })
            }
        }
    }
}

/// An issued token together with the catalog it was issued with
#[derive(Clone, Debug)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub project_id: Option<String>,
    pub catalog: Catalog,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Catalog(pub Vec<CatalogService>);

#[derive(Clone, Debug, Deserialize)]
pub struct CatalogService {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CatalogEndpoint {
    pub interface: String,
    pub region: Option<String>,
    pub region_id: Option<String>,
    pub url: String,
}

impl Catalog {
    /// Find the endpoint URL of the first matching service type
    pub fn endpoint(&self, service_types: &[&str], region: Option<&str>, interface: &str) -> Result<String> {
        service_types
            .iter()
            .find_map(|service_type| {
                self.0
                    .iter()
                    .filter(|s| s.type_ == *service_type)
                    .flat_map(|s| s.endpoints.iter())
                    .find(|e| {
                        e.interface == interface
                            && region.map_or(true, |r| {
                                e.region.as_deref() == Some(r) || e.region_id.as_deref() == Some(r)
                            })
                    })
                    .map(|e| e.url.clone())
            })
            .ok_or_else(|| Error::NoEndpoint {
                service: service_types.join("/"),
            })
    }
}

#[derive(Deserialize)]
struct TokenBody {
    token: TokenDetails,
}

#[derive(Deserialize)]
struct TokenDetails {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Catalog,
    project: Option<TokenProject>,
}

#[derive(Deserialize)]
struct TokenProject {
    id: String,
}

/// Issue a token from `auth_url`, with or without a trailing `/v3`
pub async fn authenticate(http: &reqwest::Client, auth_url: &str, method: &AuthMethod) -> Result<Token> {
    let base = auth_url.trim_end_matches('/');
    let url = if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    };

    let response = check(http.post(url).json(&method.request_body()).send().await?).await?;
    let value = response
        .headers()
        .get(SUBJECT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(Error::MissingToken)?;
    let body: TokenBody = response.json().await?;

    Ok(Token {
        value,
        expires_at: body.token.expires_at,
        project_id: body.token.project.map(|p| p.id),
        catalog: body.token.catalog,
    })
}

/// Keystone v3 API
#[derive(Clone, Debug)]
pub struct IdentityClient {
    client: ServiceClient,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ProjectCreateOpts {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Domain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DomainCreateOpts {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl IdentityClient {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.client.get_resource(&format!("/projects/{id}"), "project").await
    }

    pub fn list_projects(&self, query: &[(String, String)]) -> BoxStream<'static, Result<Project>> {
        self.client.list("/projects", query, "projects")
    }

    pub async fn create_project(&self, opts: &ProjectCreateOpts) -> Result<Project> {
        self.client.create_resource("/projects", "project", opts).await
    }

    pub async fn update_project(&self, id: &str, changes: &Value) -> Result<Project> {
        let mut response: Value = self
            .client
            .patch(&format!("/projects/{id}"), &json!({ "project": changes }))
            .await?;
        Ok(serde_json::from_value(response["project"].take())?)
    }

    pub async fn delete_project(&self, id: &str) -> Result<()> {
        self.client.delete(&format!("/projects/{id}")).await
    }

    pub async fn get_domain(&self, id: &str) -> Result<Option<Domain>> {
        self.client.get_resource(&format!("/domains/{id}"), "domain").await
    }

    pub fn list_domains(&self, query: &[(String, String)]) -> BoxStream<'static, Result<Domain>> {
        self.client.list("/domains", query, "domains")
    }

    pub async fn create_domain(&self, opts: &DomainCreateOpts) -> Result<Domain> {
        self.client.create_resource("/domains", "domain", opts).await
    }

    pub async fn update_domain(&self, id: &str, changes: &Value) -> Result<Domain> {
        let mut response: Value = self
            .client
            .patch(&format!("/domains/{id}"), &json!({ "domain": changes }))
            .await?;
        Ok(serde_json::from_value(response["domain"].take())?)
    }

    /// Keystone refuses to delete an enabled domain, so this disables it first
    pub async fn delete_domain(&self, id: &str) -> Result<()> {
        self.update_domain(id, &json!({ "enabled": false })).await?;
        self.client.delete(&format!("/domains/{id}")).await
    }
}
