//! Client for the proxy's path-addressed admin API
//!
//! The admin API has no upsert: every write either requires the path to be
//! free (create) or occupied (replace). Callers probe with [`ConfigStore::read`]
//! first, and [`ensure`] wraps that for the common create-if-absent case.

use crate::error::AdminError;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, info};

/// Default address of the proxy's admin endpoint
pub const DEFAULT_ADMIN_URL: &str = "http://localhost:2019";

/// Read/write access to a JSON configuration tree addressed by
/// slash-separated paths such as `apps/http/servers/srv0/routes/2`.
///
/// Calls are independent: nothing is transactional across them.
#[allow(async_fn_in_trait)]
pub trait ConfigStore {
    /// Value at `path`, or `None` when nothing is configured there
    async fn read(&self, path: &str) -> Result<Option<Value>, AdminError>;

    /// Write `value` at a free `path`. On a list index this inserts.
    async fn create(&self, path: &str, value: &Value) -> Result<(), AdminError>;

    /// Overwrite the existing value at `path`
    async fn replace(&self, path: &str, value: &Value) -> Result<(), AdminError>;

    /// Push `value` onto the end of the list at `path`
    async fn append(&self, path: &str, value: &Value) -> Result<(), AdminError>;

    async fn delete(&self, path: &str) -> Result<(), AdminError>;

    /// Replace the whole configuration in one request
    async fn load(&self, config: &Value) -> Result<(), AdminError>;
}

/// Return the value at `path`, creating it with `default` if absent.
/// An existing value is never overwritten.
pub async fn ensure<S: ConfigStore>(
    store: &S,
    path: &str,
    default: Value,
) -> Result<Value, AdminError> {
    if let Some(existing) = store.read(path).await? {
        return Ok(existing);
    }

    debug!(path, "Creating missing config node");
    store.create(path, &default).await?;
    Ok(default)
}

/// HTTP implementation of [`ConfigStore`] against `{admin_url}/config/`
#[derive(Debug, Clone)]
pub struct AdminClient {
    client: reqwest::Client,
    base_url: String,
}

impl AdminClient {
    pub fn new(admin_url: &str) -> Result<Self, AdminError> {
        let base_url = admin_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AdminError::InvalidUrl(admin_url.to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn config_url(&self, path: &str) -> String {
        format!("{}/config/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, AdminError> {
        debug!(%method, path, "Admin API request");

        let mut request = self.client.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(method, path, response).await)
        }
    }

    async fn write(&self, method: Method, path: &str, value: &Value) -> Result<(), AdminError> {
        self.send(method, self.config_url(path), path, Some(value))
            .await
            .map(|_| ())
    }
}

async fn status_error(method: Method, path: &str, response: reqwest::Response) -> AdminError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    AdminError::Status {
        method: method_name(&method),
        path: path.to_string(),
        status,
        body: body.trim().to_string(),
    }
}

fn method_name(method: &Method) -> &'static str {
    [
        (Method::GET, "GET"),
        (Method::PUT, "PUT"),
        (Method::PATCH, "PATCH"),
        (Method::POST, "POST"),
        (Method::DELETE, "DELETE"),
    ]
    .into_iter()
    .find(|(m, _)| m == method)
    .map(|(_, name)| name)
    .unwrap_or("REQUEST")
}

impl ConfigStore for AdminClient {
    async fn read(&self, path: &str) -> Result<Option<Value>, AdminError> {
        let url = self.config_url(path);
        debug!(path, "Admin API read");

        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(Method::GET, path, response).await);
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(&bytes).map_err(|source| AdminError::Decode {
            path: path.to_string(),
            source,
        })?;

        Ok((!value.is_null()).then_some(value))
    }

    async fn create(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.write(Method::PUT, path, value).await
    }

    async fn replace(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.write(Method::PATCH, path, value).await
    }

    async fn append(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.write(Method::POST, path, value).await
    }

    async fn delete(&self, path: &str) -> Result<(), AdminError> {
        self.send(Method::DELETE, self.config_url(path), path, None)
            .await
            .map(|_| ())
    }

    async fn load(&self, config: &Value) -> Result<(), AdminError> {
        let url = format!("{}/load", self.base_url);
        info!(admin_url = %self.base_url, "Loading initial proxy configuration");
        self.send(Method::POST, url, "load", Some(config))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_config_url_building() {
        let client = AdminClient::new("http://localhost:2019/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:2019");
        assert_eq!(
            client.config_url("apps/http/servers"),
            "http://localhost:2019/config/apps/http/servers"
        );
        assert_eq!(client.config_url(""), "http://localhost:2019/config/");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            AdminClient::new("localhost:2019"),
            Err(AdminError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_creates_missing_node() {
        let store = MemoryStore::with_config(json!({"apps": {}}));

        let value = ensure(&store, "apps/http", json!({})).await.unwrap();
        assert_eq!(value, json!({}));
        assert_eq!(store.snapshot(), json!({"apps": {"http": {}}}));
    }

    #[tokio::test]
    async fn test_ensure_never_overwrites() {
        let store = MemoryStore::with_config(json!({"apps": {"http": {"servers": {"a": {}}}}}));

        let value = ensure(&store, "apps/http", json!({})).await.unwrap();
        assert_eq!(value, json!({"servers": {"a": {}}}));
        assert!(store.mutations().is_empty());
    }
}
