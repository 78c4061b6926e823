use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use http::StatusCode;
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

mod compute;
mod identity;
mod image;
mod networking;
mod volume;

pub use compute::*;
pub use identity::*;
pub use image::*;
pub use networking::*;
pub use volume::*;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{status}: {message}")]
    Http { status: StatusCode, message: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("decoding response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no {service} endpoint in service catalog")]
    NoEndpoint { service: String },

    #[error("authentication response did not include a token")]
    MissingToken,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Request(e) => e.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT)
    }

    /// The request was rejected because of its content, and repeating it will not help
    pub fn is_invalid_argument(&self) -> bool {
        match self.status() {
            Some(
                StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::NOT_FOUND
                | StatusCode::CONFLICT
                | StatusCode::TOO_MANY_REQUESTS,
            ) => false,
            Some(status) => status.is_client_error(),
            None => false,
        }
    }

    /// The message returned by the server, or the error itself for non-HTTP failures
    pub fn server_message(&self) -> String {
        match self {
            Error::Http { message, .. } => message.clone(),
            e => e.to_string(),
        }
    }
}

/// An authenticated client for a single OpenStack service endpoint
#[derive(Clone, Debug)]
pub struct ServiceClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    headers: Vec<(&'static str, String)>,
}

impl ServiceClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            http,
            endpoint,
            token: token.into(),
            headers: Vec::new(),
        }
    }

    /// Send an extra header, e.g. a microversion, with every request
    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.endpoint, path)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self
            .http
            .request(method, self.url(path))
            .header(AUTH_TOKEN_HEADER, &self.token);
        for (name, value) in &self.headers {
            request = request.header(*name, value);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        check(response).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)).await?;
        Ok(response.json().await?)
    }

    /// GET which maps 404 to `None`
    pub async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(self.request(Method::POST, path).json(body)).await?;
        Ok(response.json().await?)
    }

    /// POST where the response body is ignored
    pub async fn post_accepted<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        self.send(self.request(Method::POST, path).json(body)).await?;
        Ok(())
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(self.request(Method::PUT, path).json(body)).await?;
        Ok(response.json().await?)
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(self.request(Method::PATCH, path).json(body)).await?;
        Ok(response.json().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }

    /// PUT raw bytes, e.g. image data, streamed from `body`
    pub async fn put_data(&self, path: &str, body: reqwest::Body) -> Result<()> {
        let request = self
            .request(Method::PUT, path)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.send(request).await?;
        Ok(())
    }

    /// GET a raw response for the caller to stream
    pub async fn get_data(&self, path: &str) -> Result<Response> {
        self.send(self.request(Method::GET, path)).await
    }

    /// GET a URL outside the cloud. The auth token is not sent.
    pub async fn fetch_external(&self, url: Url) -> Result<Response> {
        let response = self.http.get(url).send().await?;
        check(response).await
    }

    /// Fetch `{"<key>": {...}}` and unwrap the envelope, mapping 404 to `None`
    pub async fn get_resource<T: DeserializeOwned>(&self, path: &str, key: &str) -> Result<Option<T>> {
        let Some(mut body) = self.get_opt::<Value>(path).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(body[key].take())?))
    }

    /// POST `{"<key>": body}` and unwrap the response envelope
    pub async fn create_resource<B: Serialize, T: DeserializeOwned>(&self, path: &str, key: &str, body: &B) -> Result<T> {
        let mut response: Value = self.post(path, &envelope(key, body)?).await?;
        Ok(serde_json::from_value(response[key].take())?)
    }

    /// PUT `{"<key>": body}` and unwrap the response envelope
    pub async fn update_resource<B: Serialize, T: DeserializeOwned>(&self, path: &str, key: &str, body: &B) -> Result<T> {
        let mut response: Value = self.put(path, &envelope(key, body)?).await?;
        Ok(serde_json::from_value(response[key].take())?)
    }

    /// Stream every item of a paginated collection
    ///
    /// Follows `<collection>_links` (neutron, nova, cinder), `next` (glance)
    /// and `links.next` (keystone) until a page has no successor.
    pub fn list<T>(&self, path: &str, query: &[(String, String)], collection: &'static str) -> BoxStream<'static, Result<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let first = match Url::parse_with_params(&self.url(path), query) {
            Ok(url) => url.to_string(),
            Err(e) => {
                let err = Error::InvalidUrl {
                    url: self.url(path),
                    reason: e.to_string(),
                };
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        let client = self.clone();
        stream::try_unfold(Some(first), move |next| {
            let client = client.clone();
            async move {
                let Some(url) = next else {
                    return Ok(None);
                };
                let mut page: Value = client.get(&url).await?;
                let items: Vec<T> = match page.get_mut(collection) {
                    Some(items) => serde_json::from_value(items.take())?,
                    None => Vec::new(),
                };
                let next = if items.is_empty() {
                    None
                } else {
                    client.next_page(&page, collection)
                };
                Ok::<_, Error>(Some((stream::iter(items.into_iter().map(Ok)), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    fn next_page(&self, page: &Value, collection: &str) -> Option<String> {
        let href = page
            .get(format!("{collection}_links"))
            .and_then(|links| links.as_array())
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.get("rel").and_then(Value::as_str) == Some("next"))
            })
            .and_then(|l| l.get("href"))
            .or_else(|| page.get("next"))
            .or_else(|| page.pointer("/links/next"))
            .and_then(Value::as_str)?;

        if href.starts_with('/') {
            let base = Url::parse(&self.endpoint).ok()?;
            base.join(href).ok().map(|u| u.to_string())
        } else {
            Some(href.to_string())
        }
    }
}

fn envelope<B: Serialize>(key: &str, body: &B) -> Result<Value> {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), serde_json::to_value(body)?);
    Ok(Value::Object(map))
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Http {
        status,
        message: error_message(&body).unwrap_or_else(|| status.to_string()),
    })
}

/// Extract the human readable message from an OpenStack error body
///
/// Services wrap it differently: `{"NeutronError": {"message": ..}}`,
/// `{"badRequest": {"message": ..}}`, `{"error": {"message": ..}}`, or plain text.
fn error_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| {
                map.values()
                    .find_map(|v| v.get("message").and_then(Value::as_str))
            })
            .map(str::to_string)
            .or_else(|| Some(body.to_string())),
        _ => Some(body.lines().map(str::trim).filter(|l| !l.is_empty()).last()?.to_string()),
    }
}
